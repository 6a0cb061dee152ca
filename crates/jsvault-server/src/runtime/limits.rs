//! Resource limits for JavaScript execution.
//!
//! Limits are applied to every engine context a [`ModuleRuntime`] creates.
//! They bound runaway scripts: a task timeout only stops the session, it
//! does not interrupt a script that is still running, so an infinite loop
//! is ended by the loop-iteration limit instead.
//!
//! [`ModuleRuntime`]: crate::runtime::ModuleRuntime

use boa_engine::Context;

/// Resource limits for JavaScript execution.
///
/// # Fields
///
/// - `loop_iteration_limit` - Maximum iterations of a single loop (default: unlimited)
/// - `recursion_limit` - Maximum call depth (default: 512)
///
/// # Example
///
/// ```
/// use jsvault_server::runtime::EngineLimits;
///
/// let limits = EngineLimits::new()
///     .with_loop_iteration_limit(1_000_000);
/// assert!(limits.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineLimits {
    /// Maximum iterations of one loop before the script throws
    pub loop_iteration_limit: Option<u64>,
    /// Maximum depth of nested calls before the script throws
    pub recursion_limit: usize,
}

impl Default for EngineLimits {
    fn default() -> Self {
        Self {
            loop_iteration_limit: None,
            recursion_limit: 512,
        }
    }
}

impl EngineLimits {
    pub fn new() -> Self {
        Self::default()
    }

    /// Limits for interactive debug runs: loops are capped so a runaway
    /// script releases its engine thread.
    pub fn debug() -> Self {
        Self::default().with_loop_iteration_limit(50_000_000)
    }

    pub fn with_loop_iteration_limit(mut self, limit: u64) -> Self {
        self.loop_iteration_limit = Some(limit);
        self
    }

    pub fn with_recursion_limit(mut self, limit: usize) -> Self {
        self.recursion_limit = limit;
        self
    }

    /// Validates the limits.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The loop-iteration limit is zero
    /// - The recursion limit is zero or above 10,000
    pub fn validate(&self) -> Result<(), String> {
        if self.loop_iteration_limit == Some(0) {
            return Err("loop iteration limit must be greater than zero".to_string());
        }

        if self.recursion_limit == 0 {
            return Err("recursion limit must be greater than zero".to_string());
        }

        if self.recursion_limit > 10_000 {
            return Err(format!(
                "recursion limit must be <= 10000 (got {})",
                self.recursion_limit
            ));
        }

        Ok(())
    }

    pub(crate) fn apply(&self, ctx: &mut Context) {
        let runtime_limits = ctx.runtime_limits_mut();
        if let Some(limit) = self.loop_iteration_limit {
            runtime_limits.set_loop_iteration_limit(limit);
        }
        runtime_limits.set_recursion_limit(self.recursion_limit);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits() {
        let limits = EngineLimits::default();
        assert_eq!(limits.loop_iteration_limit, None);
        assert_eq!(limits.recursion_limit, 512);
        assert!(limits.validate().is_ok());
    }

    #[test]
    fn test_builder_pattern() {
        let limits = EngineLimits::new()
            .with_loop_iteration_limit(10)
            .with_recursion_limit(64);
        assert_eq!(limits.loop_iteration_limit, Some(10));
        assert_eq!(limits.recursion_limit, 64);
    }

    #[test]
    fn test_validate_rejects_zero() {
        assert!(EngineLimits::new().with_loop_iteration_limit(0).validate().is_err());
        assert!(EngineLimits::new().with_recursion_limit(0).validate().is_err());
    }

    #[test]
    fn test_validate_rejects_excessive_recursion() {
        let err = EngineLimits::new()
            .with_recursion_limit(20_000)
            .validate()
            .unwrap_err();
        assert!(err.contains("10000"));
    }

    #[test]
    fn test_debug_limits_cap_loops() {
        assert!(EngineLimits::debug().loop_iteration_limit.is_some());
    }
}
