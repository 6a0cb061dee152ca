//! A fixed set of module runtimes over one folder.
//!
//! Each runtime owns an engine thread, so a slow script only holds the
//! runtime it was handed. Invalidation is applied to every runtime.

use jsvault_common::protocol::error::{JsVaultError, Result};
use std::ops::Deref;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use super::module_runtime::{ModuleRuntime, RuntimeOptions};

/// Largest accepted number of runtimes.
pub const MAX_RUNTIMES: usize = 64;

#[derive(Clone)]
pub struct RuntimePool {
    runtimes: Arc<Vec<ModuleRuntime>>,
    /// Runtimes not currently handed out
    available: Arc<Mutex<Vec<ModuleRuntime>>>,
    semaphore: Arc<Semaphore>,
}

impl std::fmt::Debug for RuntimePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimePool")
            .field("size", &self.size())
            .field("idle", &self.idle())
            .finish()
    }
}

impl RuntimePool {
    /// Start `size` runtimes from `options`. Runtime `i` is named
    /// `<name>-<i>`.
    pub fn new(options: RuntimeOptions, size: usize) -> Result<Self> {
        if size == 0 || size > MAX_RUNTIMES {
            return Err(JsVaultError::InvalidRequest(format!(
                "runtime pool size must be between 1 and {} (got {})",
                MAX_RUNTIMES, size
            )));
        }

        let mut runtimes = Vec::with_capacity(size);
        for index in 0..size {
            let mut options = options.clone();
            options.name = format!("{}-{}", options.name, index);
            runtimes.push(ModuleRuntime::with_options(options)?);
        }
        debug!(name = %options.name, size, "Runtime pool started");

        Ok(Self {
            available: Arc::new(Mutex::new(runtimes.clone())),
            runtimes: Arc::new(runtimes),
            semaphore: Arc::new(Semaphore::new(size)),
        })
    }

    pub fn size(&self) -> usize {
        self.runtimes.len()
    }

    /// Number of runtimes not handed out.
    pub fn idle(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn runtimes(&self) -> &[ModuleRuntime] {
        &self.runtimes
    }

    /// Wait for a free runtime.
    pub async fn acquire(&self) -> Result<PooledRuntime> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| JsVaultError::EngineUnavailable(format!("runtime pool closed: {}", e)))?;
        self.checkout(permit)
    }

    /// A free runtime, or `None` when all are busy.
    pub fn try_acquire(&self) -> Option<PooledRuntime> {
        let permit = self.semaphore.clone().try_acquire_owned().ok()?;
        self.checkout(permit).ok()
    }

    fn checkout(&self, permit: OwnedSemaphorePermit) -> Result<PooledRuntime> {
        let runtime = self
            .available
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
            .ok_or_else(|| JsVaultError::EngineUnavailable("no runtime available in pool".to_string()))?;
        Ok(PooledRuntime {
            runtime,
            available: self.available.clone(),
            _permit: permit,
        })
    }

    /// Drop `path` and its dependants from every runtime's module cache.
    pub fn invalidate(&self, path: &str) {
        for runtime in self.runtimes.iter() {
            runtime.invalidate(path);
        }
    }

    pub fn invalidate_all(&self) {
        for runtime in self.runtimes.iter() {
            runtime.invalidate_all();
        }
    }
}

/// A runtime checked out of a [`RuntimePool`]; returned on drop.
pub struct PooledRuntime {
    runtime: ModuleRuntime,
    available: Arc<Mutex<Vec<ModuleRuntime>>>,
    _permit: OwnedSemaphorePermit,
}

impl Deref for PooledRuntime {
    type Target = ModuleRuntime;

    fn deref(&self) -> &ModuleRuntime {
        &self.runtime
    }
}

impl Drop for PooledRuntime {
    fn drop(&mut self) {
        // Back in the list before the permit is released
        self.available
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(self.runtime.clone());
    }
}
