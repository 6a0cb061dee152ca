//! Script console.
//!
//! Every loaded module gets its own [`Console`] scoped to the module's
//! directory and file name, derived from the runtime's root console with
//! [`Console::create`]. What happens to the output depends on the variant:
//! [`LogConsole`] writes bounded lines to `tracing`, the streaming console
//! in [`crate::task::console`] forwards every call to a debug session.

use serde_json::Value as JsonValue;
use std::sync::Arc;

/// Longest line [`LogConsole`] will emit, marker included.
pub const MAX_LEN: usize = 8192;
pub const TRUNCATION_MARKER: &str = "...";
/// File name of a runtime's root console.
pub const ROOT_FILE_NAME: &str = "<root>";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConsoleLevel {
    Log,
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl ConsoleLevel {
    pub const ALL: [ConsoleLevel; 6] = [
        ConsoleLevel::Log,
        ConsoleLevel::Trace,
        ConsoleLevel::Debug,
        ConsoleLevel::Info,
        ConsoleLevel::Warn,
        ConsoleLevel::Error,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ConsoleLevel::Log => "log",
            ConsoleLevel::Trace => "trace",
            ConsoleLevel::Debug => "debug",
            ConsoleLevel::Info => "info",
            ConsoleLevel::Warn => "warn",
            ConsoleLevel::Error => "error",
        }
    }
}

pub trait Console: Send + Sync {
    /// Directory of the module this console belongs to.
    fn file_path(&self) -> &str;

    fn file_name(&self) -> &str;

    fn write(&self, level: ConsoleLevel, args: &[JsonValue]);

    /// Child console for a nested module, sharing this console's target.
    fn create(&self, file_path: &str, file_name: &str) -> Arc<dyn Console>;

    fn log(&self, args: &[JsonValue]) {
        self.write(ConsoleLevel::Log, args);
    }

    fn trace(&self, args: &[JsonValue]) {
        self.write(ConsoleLevel::Trace, args);
    }

    fn debug(&self, args: &[JsonValue]) {
        self.write(ConsoleLevel::Debug, args);
    }

    fn info(&self, args: &[JsonValue]) {
        self.write(ConsoleLevel::Info, args);
    }

    fn warn(&self, args: &[JsonValue]) {
        self.write(ConsoleLevel::Warn, args);
    }

    fn error(&self, args: &[JsonValue]) {
        self.write(ConsoleLevel::Error, args);
    }
}

/// Strings print as-is, everything else as compact JSON.
pub fn stringify(arg: &JsonValue) -> String {
    match arg {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Space-separated rendering of every argument, unbounded.
pub fn render(args: &[JsonValue]) -> String {
    args.iter().map(stringify).collect::<Vec<_>>().join(" ")
}

/// Cut `text` to [`MAX_LEN`] characters, ending with [`TRUNCATION_MARKER`].
pub fn overflow(text: String) -> String {
    if text.chars().count() <= MAX_LEN {
        return text;
    }
    let keep = MAX_LEN - TRUNCATION_MARKER.chars().count();
    let mut cut: String = text.chars().take(keep).collect();
    cut.push_str(TRUNCATION_MARKER);
    cut
}

/// Like [`render`], but each argument and then the whole line are bounded.
pub fn render_bounded(args: &[JsonValue]) -> String {
    let parts: Vec<String> = args.iter().map(|arg| overflow(stringify(arg))).collect();
    overflow(parts.join(" "))
}

/// Server-side console for production handlers.
///
/// Output goes to `tracing` under the `jsvault::script` target, one
/// bounded line per call.
#[derive(Debug, Clone)]
pub struct LogConsole {
    file_path: String,
    file_name: String,
}

impl LogConsole {
    pub fn new(file_path: impl Into<String>, file_name: impl Into<String>) -> Self {
        Self {
            file_path: file_path.into(),
            file_name: file_name.into(),
        }
    }

    pub fn root(file_path: impl Into<String>) -> Self {
        Self::new(file_path, ROOT_FILE_NAME)
    }
}

impl Console for LogConsole {
    fn file_path(&self) -> &str {
        &self.file_path
    }

    fn file_name(&self) -> &str {
        &self.file_name
    }

    fn write(&self, level: ConsoleLevel, args: &[JsonValue]) {
        let line = render_bounded(args);
        let path = &self.file_path;
        let file = &self.file_name;
        match level {
            ConsoleLevel::Trace => tracing::trace!(target: "jsvault::script", %path, %file, "{}", line),
            ConsoleLevel::Debug => tracing::debug!(target: "jsvault::script", %path, %file, "{}", line),
            ConsoleLevel::Log | ConsoleLevel::Info => {
                tracing::info!(target: "jsvault::script", %path, %file, "{}", line)
            }
            ConsoleLevel::Warn => tracing::warn!(target: "jsvault::script", %path, %file, "{}", line),
            ConsoleLevel::Error => tracing::error!(target: "jsvault::script", %path, %file, "{}", line),
        }
    }

    fn create(&self, file_path: &str, file_name: &str) -> Arc<dyn Console> {
        Arc::new(LogConsole::new(file_path, file_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_long_string_is_truncated_to_max_len() {
        let line = render_bounded(&[json!("x".repeat(10_000))]);
        assert_eq!(line.chars().count(), MAX_LEN);
        assert!(line.ends_with(TRUNCATION_MARKER));
    }

    #[test]
    fn test_combined_arguments_are_bounded() {
        let chunk = "y".repeat(5_000);
        let line = render_bounded(&[json!(chunk.clone()), json!(chunk)]);
        assert_eq!(line.chars().count(), MAX_LEN);
        assert!(line.ends_with(TRUNCATION_MARKER));
    }

    #[test]
    fn test_short_lines_untouched() {
        let line = render_bounded(&[json!("total"), json!(3), json!({"a": [1]})]);
        assert_eq!(line, r#"total 3 {"a":[1]}"#);
        assert_eq!(overflow("x".repeat(MAX_LEN)).chars().count(), MAX_LEN);
        assert!(!overflow("x".repeat(MAX_LEN)).ends_with(TRUNCATION_MARKER));
    }

    #[test]
    fn test_multibyte_truncation_counts_characters() {
        let line = overflow("é".repeat(9_000));
        assert_eq!(line.chars().count(), MAX_LEN);
    }

    #[test]
    fn test_child_console_scoping() {
        let root = LogConsole::root("/");
        assert_eq!(root.file_name(), ROOT_FILE_NAME);
        let child = root.create("/lib/", "util.js");
        assert_eq!(child.file_path(), "/lib/");
        assert_eq!(child.file_name(), "util.js");
        child.info(&[json!("hello")]);
    }
}
