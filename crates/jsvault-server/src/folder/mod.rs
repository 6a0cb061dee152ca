//! Virtual filesystem access for the module runtime.
//!
//! A [`Folder`] resolves logical paths to file content or directory
//! listings. The runtime only ever reads through this trait, so scripts can
//! live in the file store ([`store_folder::StoreFolder`], cached by
//! [`cache::FileCache`]) or on disk ([`fs::FileSystemFolder`]).

pub mod cache;
pub mod fs;
pub mod store;
pub mod store_folder;

use chrono::{DateTime, Utc};
use jsvault_common::protocol::error::Result;
use jsvault_common::{NodeType, VirtualFile};
use std::sync::Arc;

pub use cache::{FileCache, FileKey};
pub use fs::{FileSystemFolder, FileSystemFolders};
pub use store::{FileStore, MemoryFileStore};
pub use store_folder::{StoreFolder, StoreFolders};

/// One resolved node.
#[derive(Debug, Clone, PartialEq)]
pub struct FolderEntry {
    /// Full logical path
    pub path: String,
    pub name: String,
    pub node_type: NodeType,
    pub content: Option<String>,
    pub last_modified: DateTime<Utc>,
}

impl FolderEntry {
    pub fn is_file(&self) -> bool {
        self.node_type == NodeType::File
    }

    /// A file with non-blank content. Only these count as loadable scripts.
    pub fn has_content(&self) -> bool {
        self.is_file()
            && self
                .content
                .as_deref()
                .is_some_and(|content| !content.trim().is_empty())
    }
}

impl From<VirtualFile> for FolderEntry {
    fn from(file: VirtualFile) -> Self {
        Self {
            path: file.full_path(),
            name: file.name,
            node_type: file.node_type,
            content: file.content,
            last_modified: file.last_modified,
        }
    }
}

/// Read-only view of a script tree rooted at `/`.
pub trait Folder: Send + Sync {
    /// Resolve `path`; `Ok(None)` means not found.
    fn resolve(&self, path: &str) -> Result<Option<FolderEntry>>;

    /// Children of the directory at `path`, ordered by name.
    fn list_children(&self, path: &str) -> Result<Vec<FolderEntry>>;

    /// Resolve `path` and keep it only if it is a loadable script.
    fn resolve_script(&self, path: &str) -> Result<Option<FolderEntry>> {
        Ok(self.resolve(path)?.filter(FolderEntry::has_content))
    }
}

/// Hands out a fresh [`Folder`] for a `(tenant, group)` namespace.
pub trait FolderProvider: Send + Sync {
    fn open(&self, tenant: &str, group: &str) -> Arc<dyn Folder>;
}
