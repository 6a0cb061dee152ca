//! Read-through cache of virtual file records.
//!
//! Entries never expire by time. They are dropped when a matching
//! [`FileChange`] is applied and repopulated from the store on the next
//! lookup. Misses are cached too, so a path that was looked up and not
//! found stays "not found" until an `Added` change arrives for it.

use dashmap::DashMap;
use jsvault_common::path;
use jsvault_common::protocol::error::Result;
use jsvault_common::{ChangeKind, FileChange, VirtualFile};
use std::sync::Arc;
use tracing::trace;

use super::store::FileStore;

/// Identity of a cached record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileKey {
    pub tenant: String,
    pub group: String,
    pub directory: String,
    pub name: String,
}

impl FileKey {
    pub fn new(tenant: &str, group: &str, full_path: &str) -> Self {
        let (directory, name) = path::split_path(full_path);
        Self {
            tenant: tenant.to_string(),
            group: group.to_string(),
            directory,
            name,
        }
    }

    pub fn full_path(&self) -> String {
        path::join(&self.directory, &self.name)
    }
}

impl From<&FileChange> for FileKey {
    fn from(change: &FileChange) -> Self {
        Self {
            tenant: change.tenant.clone(),
            group: change.group.clone(),
            directory: path::as_directory(&change.parent_path),
            name: change.name.clone(),
        }
    }
}

pub struct FileCache {
    store: Arc<dyn FileStore>,
    entries: DashMap<FileKey, Option<VirtualFile>>,
}

impl FileCache {
    pub fn new(store: Arc<dyn FileStore>) -> Self {
        Self {
            store,
            entries: DashMap::new(),
        }
    }

    /// Look up a record, fetching it from the store on a miss.
    pub fn get(&self, tenant: &str, group: &str, full_path: &str) -> Result<Option<VirtualFile>> {
        let key = FileKey::new(tenant, group, full_path);
        if let Some(entry) = self.entries.get(&key) {
            return Ok(entry.value().clone());
        }

        trace!(path = %key.full_path(), "File cache miss");
        let file = self
            .store
            .get_file(&key.tenant, &key.group, &key.directory, &key.name)?;
        self.entries.insert(key, file.clone());
        Ok(file)
    }

    /// Children are always listed from the store; each child is cached
    /// as a side effect.
    pub fn list_children(
        &self,
        tenant: &str,
        group: &str,
        directory: &str,
    ) -> Result<Vec<VirtualFile>> {
        let children = self.store.list_children(tenant, group, directory)?;
        for child in &children {
            self.entries.insert(
                FileKey::new(tenant, group, &child.full_path()),
                Some(child.clone()),
            );
        }
        Ok(children)
    }

    pub fn invalidate(&self, key: &FileKey) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Drop every cached entry strictly below `prefix`.
    pub fn invalidate_descendants(&self, tenant: &str, group: &str, prefix: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, _| {
            !(key.tenant == tenant
                && key.group == group
                && path::is_descendant(&key.full_path(), prefix))
        });
        before.saturating_sub(self.entries.len())
    }

    /// Apply one change event from the store.
    pub fn apply(&self, change: &FileChange) {
        let key = FileKey::from(change);
        self.invalidate(&key);
        if change.change_kind == ChangeKind::Deleted {
            let removed = self.invalidate_descendants(&key.tenant, &key.group, &key.full_path());
            if removed > 0 {
                trace!(path = %key.full_path(), removed, "Invalidated cached descendants");
            }
        }
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &FileKey) -> bool {
        self.entries.contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::folder::store::MemoryFileStore;

    fn setup() -> (Arc<MemoryFileStore>, FileCache) {
        let store = Arc::new(MemoryFileStore::new());
        let cache = FileCache::new(store.clone());
        (store, cache)
    }

    #[test]
    fn test_read_through_caches_record() {
        let (store, cache) = setup();
        store.put_file("biz", "g", "/a.js", "1").unwrap();

        assert!(cache.get("biz", "g", "/a.js").unwrap().is_some());
        assert!(cache.contains(&FileKey::new("biz", "g", "/a.js")));

        // Without a change event the cached copy is served
        store.put_file("biz", "g", "/a.js", "2").unwrap();
        let cached = cache.get("biz", "g", "/a.js").unwrap().unwrap();
        assert_eq!(cached.content.as_deref(), Some("1"));
    }

    #[test]
    fn test_update_event_refreshes_on_next_lookup() {
        let (store, cache) = setup();
        let mut changes = store.subscribe();
        store.put_file("biz", "g", "/a.js", "1").unwrap();
        cache.get("biz", "g", "/a.js").unwrap();

        store.put_file("biz", "g", "/a.js", "2").unwrap();
        while let Ok(change) = changes.try_recv() {
            cache.apply(&change);
        }
        let file = cache.get("biz", "g", "/a.js").unwrap().unwrap();
        assert_eq!(file.content.as_deref(), Some("2"));
    }

    #[test]
    fn test_negative_entry_cleared_by_added_event() {
        let (store, cache) = setup();
        let mut changes = store.subscribe();
        assert!(cache.get("biz", "g", "/late.js").unwrap().is_none());

        store.put_file("biz", "g", "/late.js", "1").unwrap();
        while let Ok(change) = changes.try_recv() {
            cache.apply(&change);
        }
        assert!(cache.get("biz", "g", "/late.js").unwrap().is_some());
    }

    #[test]
    fn test_directory_delete_invalidates_descendants() {
        let (store, cache) = setup();
        store.put_file("biz", "g", "/lib/a.js", "1").unwrap();
        store.put_file("biz", "g", "/lib/x/b.js", "2").unwrap();
        cache.get("biz", "g", "/lib/a.js").unwrap();
        cache.get("biz", "g", "/lib/x/b.js").unwrap();

        // Only the directory event is applied; descendants still go
        cache.apply(&FileChange::new("biz", "g", "/", "lib", ChangeKind::Deleted));
        assert!(!cache.contains(&FileKey::new("biz", "g", "/lib/a.js")));
        assert!(!cache.contains(&FileKey::new("biz", "g", "/lib/x/b.js")));
    }
}
