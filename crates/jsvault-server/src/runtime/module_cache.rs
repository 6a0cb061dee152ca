//! Instantiated modules of one runtime.
//!
//! Entries hold engine objects, so a `ModuleCache` lives on its runtime's
//! engine thread and is never shared.

use boa_engine::object::JsObject;
use chrono::{DateTime, Utc};
use jsvault_common::path;
use std::collections::HashMap;

/// A module that finished executing.
#[derive(Debug, Clone)]
pub struct ResolvedModule {
    /// Normalized absolute logical path
    pub path: String,
    /// The CommonJS `module` object; its `exports` property is the export
    pub module: JsObject,
    /// Distinct for every execution of a module body within a runtime
    pub load_id: u64,
    /// `lastModified` of the source that was executed
    pub version: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct ModuleCache {
    modules: HashMap<String, ResolvedModule>,
}

impl ModuleCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &str) -> Option<&ResolvedModule> {
        self.modules.get(path)
    }

    /// Insert, replacing any previous entry for the same path.
    pub fn insert(&mut self, module: ResolvedModule) {
        self.modules.insert(module.path.clone(), module);
    }

    pub fn remove(&mut self, path: &str) -> bool {
        self.modules.remove(path).is_some()
    }

    /// Remove `prefix` itself and every module below it.
    pub fn remove_prefix(&mut self, prefix: &str) -> usize {
        let prefix = path::normalize(prefix);
        let before = self.modules.len();
        self.modules
            .retain(|module_path, _| *module_path != prefix && !path::is_descendant(module_path, &prefix));
        before - self.modules.len()
    }

    pub fn clear(&mut self) {
        self.modules.clear();
    }

    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.modules.keys().cloned().collect();
        paths.sort();
        paths
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}
