//! Folder backed by the file store, read through a [`FileCache`].

use chrono::Utc;
use jsvault_common::path;
use jsvault_common::protocol::error::Result;
use jsvault_common::NodeType;
use std::sync::Arc;

use super::cache::FileCache;
use super::store::FileStore;
use super::{Folder, FolderEntry, FolderProvider};

/// Scripts of one `(tenant, group)` namespace.
pub struct StoreFolder {
    tenant: String,
    group: String,
    cache: Arc<FileCache>,
}

impl StoreFolder {
    pub fn new(tenant: impl Into<String>, group: impl Into<String>, cache: Arc<FileCache>) -> Self {
        Self {
            tenant: tenant.into(),
            group: group.into(),
            cache,
        }
    }

    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn cache(&self) -> &Arc<FileCache> {
        &self.cache
    }
}

impl Folder for StoreFolder {
    fn resolve(&self, logical_path: &str) -> Result<Option<FolderEntry>> {
        let normalized = path::normalize(logical_path);
        if normalized == "/" {
            return Ok(Some(FolderEntry {
                path: normalized,
                name: String::new(),
                node_type: NodeType::Directory,
                content: None,
                last_modified: Utc::now(),
            }));
        }
        Ok(self
            .cache
            .get(&self.tenant, &self.group, &normalized)?
            .map(FolderEntry::from))
    }

    fn list_children(&self, logical_path: &str) -> Result<Vec<FolderEntry>> {
        Ok(self
            .cache
            .list_children(&self.tenant, &self.group, &path::as_directory(logical_path))?
            .into_iter()
            .map(FolderEntry::from)
            .collect())
    }
}

/// Opens a [`StoreFolder`] with its own fresh cache per call.
pub struct StoreFolders {
    store: Arc<dyn FileStore>,
}

impl StoreFolders {
    pub fn new(store: Arc<dyn FileStore>) -> Self {
        Self { store }
    }
}

impl FolderProvider for StoreFolders {
    fn open(&self, tenant: &str, group: &str) -> Arc<dyn Folder> {
        let cache = Arc::new(FileCache::new(self.store.clone()));
        Arc::new(StoreFolder::new(tenant, group, cache))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::folder::store::MemoryFileStore;
    use jsvault_common::{ChangeKind, FileChange};

    #[test]
    fn test_resolve_file_and_root() {
        let store = Arc::new(MemoryFileStore::new());
        store.put_file("biz", "g", "/lib/a.js", "exports.a = 1;").unwrap();
        let folder = StoreFolder::new("biz", "g", Arc::new(FileCache::new(store)));

        let entry = folder.resolve("/lib/./a.js").unwrap().unwrap();
        assert!(entry.has_content());
        assert_eq!(entry.path, "/lib/a.js");

        let root = folder.resolve("/").unwrap().unwrap();
        assert_eq!(root.node_type, NodeType::Directory);

        let children = folder.list_children("/lib").unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].name, "a.js");
    }

    #[test]
    fn test_invalidated_then_deleted_entry_is_not_found() {
        let store = Arc::new(MemoryFileStore::new());
        store.put_file("biz", "g", "/gone.js", "1").unwrap();
        let cache = Arc::new(FileCache::new(store.clone()));
        let folder = StoreFolder::new("biz", "g", cache.clone());

        assert!(folder.resolve("/gone.js").unwrap().is_some());

        store.delete("biz", "g", "/gone.js").unwrap();
        cache.apply(&FileChange::new("biz", "g", "/", "gone.js", ChangeKind::Deleted));

        assert!(folder.resolve("/gone.js").unwrap().is_none());
    }

    #[test]
    fn test_provider_gives_private_caches() {
        let store = Arc::new(MemoryFileStore::new());
        store.put_file("biz", "g", "/a.js", "1").unwrap();
        let provider = StoreFolders::new(store.clone());

        let first = provider.open("biz", "g");
        assert!(first.resolve("/a.js").unwrap().is_some());

        store.put_file("biz", "g", "/a.js", "2").unwrap();
        let second = provider.open("biz", "g");
        let entry = second.resolve("/a.js").unwrap().unwrap();
        assert_eq!(entry.content.as_deref(), Some("2"));
    }
}
