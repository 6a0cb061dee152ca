//! Keeps the production caches in step with the file store.

use jsvault_common::FileChange;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::folder::FileCache;
use crate::runtime::RuntimePool;

/// Applies store change events to a [`FileCache`] and to the module caches
/// of the runtimes that read through it.
#[derive(Clone)]
pub struct CacheInvalidator {
    cache: Arc<FileCache>,
    runtimes: RuntimePool,
    tenant: String,
    group: String,
}

impl CacheInvalidator {
    pub fn new(
        cache: Arc<FileCache>,
        runtimes: RuntimePool,
        tenant: impl Into<String>,
        group: impl Into<String>,
    ) -> Self {
        Self {
            cache,
            runtimes,
            tenant: tenant.into(),
            group: group.into(),
        }
    }

    pub fn apply(&self, change: &FileChange) {
        self.cache.apply(change);
        if change.tenant == self.tenant && change.group == self.group {
            let full_path = change.full_path();
            debug!(path = %full_path, kind = ?change.change_kind, "Invalidating module");
            self.runtimes.invalidate(&full_path);
        }
    }

    /// Forget everything, for when change events were lost.
    pub fn reset(&self) {
        self.cache.clear();
        self.runtimes.invalidate_all();
    }

    /// Consume `changes` until the store goes away.
    pub fn spawn(self, mut changes: broadcast::Receiver<FileChange>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(change) => self.apply(&change),
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "Change stream lagged, clearing caches");
                        self.reset();
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            info!("Change stream closed, cache invalidation stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::console::LogConsole;
    use crate::runtime::{ModuleRuntime, RuntimeOptions};
    use crate::folder::{Folder, FileKey, MemoryFileStore, StoreFolder};
    use jsvault_common::ChangeKind;
    use serde_json::json;

    struct Fixture {
        store: Arc<MemoryFileStore>,
        cache: Arc<FileCache>,
        runtimes: RuntimePool,
        runtime: ModuleRuntime,
        invalidator: CacheInvalidator,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryFileStore::new());
        let cache = Arc::new(FileCache::new(store.clone()));
        let folder: Arc<dyn Folder> = Arc::new(StoreFolder::new("biz", "g", cache.clone()));
        let options = RuntimeOptions::new("prod", folder, Arc::new(LogConsole::root("/")));
        let runtimes = RuntimePool::new(options, 2).unwrap();
        let runtime = runtimes.runtimes()[0].clone();
        let invalidator = CacheInvalidator::new(cache.clone(), runtimes.clone(), "biz", "g");
        Fixture {
            store,
            cache,
            runtimes,
            runtime,
            invalidator,
        }
    }

    fn value(runtime: &ModuleRuntime, path: &str) -> serde_json::Value {
        runtime
            .use_module(path)
            .unwrap()
            .invoke("value", Vec::new())
            .unwrap()
            .unwrap()
    }

    #[test]
    fn test_update_reloads_module() {
        let f = fixture();
        f.store.put_file("biz", "g", "/a.js", "exports.value = function () { return 1; };").unwrap();
        assert_eq!(value(&f.runtime, "/a.js"), json!(1));

        f.store.put_file("biz", "g", "/a.js", "exports.value = function () { return 2; };").unwrap();
        assert_eq!(value(&f.runtime, "/a.js"), json!(1));

        f.invalidator
            .apply(&FileChange::new("biz", "g", "/", "a.js", ChangeKind::Updated));
        assert_eq!(value(&f.runtime, "/a.js"), json!(2));
    }

    #[test]
    fn test_update_reaches_every_runtime() {
        let f = fixture();
        f.store.put_file("biz", "g", "/a.js", "exports.value = function () { return 1; };").unwrap();
        for runtime in f.runtimes.runtimes() {
            assert_eq!(value(runtime, "/a.js"), json!(1));
        }

        f.store.put_file("biz", "g", "/a.js", "exports.value = function () { return 2; };").unwrap();
        f.invalidator
            .apply(&FileChange::new("biz", "g", "/", "a.js", ChangeKind::Updated));
        for runtime in f.runtimes.runtimes() {
            assert_eq!(value(runtime, "/a.js"), json!(2));
        }
    }

    #[test]
    fn test_directory_delete_drops_nested_modules() {
        let f = fixture();
        f.store.put_file("biz", "g", "/lib/a.js", "exports.value = function () { return 'a'; };").unwrap();
        f.runtime.use_module("/lib/a.js").unwrap();
        assert!(f.cache.contains(&FileKey::new("biz", "g", "/lib/a.js")));

        f.store.delete("biz", "g", "/lib").unwrap();
        f.invalidator
            .apply(&FileChange::new("biz", "g", "/", "lib", ChangeKind::Deleted));

        assert!(!f.cache.contains(&FileKey::new("biz", "g", "/lib/a.js")));
        assert!(f.runtime.cached_paths().unwrap().is_empty());
    }

    #[test]
    fn test_other_namespace_leaves_modules_alone() {
        let f = fixture();
        f.store.put_file("biz", "g", "/a.js", "exports.value = function () { return 1; };").unwrap();
        f.runtime.use_module("/a.js").unwrap();

        f.invalidator
            .apply(&FileChange::new("other", "g", "/", "a.js", ChangeKind::Updated));
        assert_eq!(f.runtime.cached_paths().unwrap(), vec!["/a.js".to_string()]);
    }

    #[tokio::test]
    async fn test_lagged_stream_clears_everything() {
        let f = fixture();
        let changes = f.store.subscribe();
        f.store.put_file("biz", "g", "/a.js", "exports.value = function () { return 1; };").unwrap();
        f.runtime.use_module("/a.js").unwrap();

        // Overflow the change channel before the invalidator gets to run
        for i in 0..1100 {
            f.store.put_file("other", "g", &format!("/f{}.js", i), "x").unwrap();
        }
        let handle = f.invalidator.clone().spawn(changes);

        for _ in 0..100 {
            if f.runtime.cached_paths().unwrap().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(f.runtime.cached_paths().unwrap().is_empty());
        handle.abort();
    }
}
