//! Folder backed by a directory on disk.

use chrono::{DateTime, Utc};
use jsvault_common::path;
use jsvault_common::protocol::error::Result;
use jsvault_common::NodeType;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::{Folder, FolderEntry, FolderProvider};

/// Maps logical paths beneath `root`. Normalization strips `..`, so a
/// logical path can never address anything outside the root.
pub struct FileSystemFolder {
    root: PathBuf,
}

impl FileSystemFolder {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn physical(&self, logical_path: &str) -> PathBuf {
        let normalized = path::normalize(logical_path);
        self.root.join(normalized.trim_start_matches(path::SEPARATOR))
    }

    fn entry(logical_path: String, physical: &Path) -> Result<Option<FolderEntry>> {
        let metadata = match std::fs::metadata(physical) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let last_modified = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        let (_, name) = path::split_path(&logical_path);

        let (node_type, content) = if metadata.is_dir() {
            (NodeType::Directory, None)
        } else {
            (NodeType::File, Some(std::fs::read_to_string(physical)?))
        };

        Ok(Some(FolderEntry {
            path: logical_path,
            name,
            node_type,
            content,
            last_modified,
        }))
    }
}

impl Folder for FileSystemFolder {
    fn resolve(&self, logical_path: &str) -> Result<Option<FolderEntry>> {
        Self::entry(path::normalize(logical_path), &self.physical(logical_path))
    }

    fn list_children(&self, logical_path: &str) -> Result<Vec<FolderEntry>> {
        let directory = self.physical(logical_path);
        let read_dir = match std::fs::read_dir(&directory) {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut children = Vec::new();
        for dirent in read_dir {
            let dirent = dirent?;
            let name = dirent.file_name().to_string_lossy().into_owned();
            let child = path::join(logical_path, &name);
            if let Some(entry) = Self::entry(child, &dirent.path())? {
                children.push(entry);
            }
        }
        children.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(children)
    }
}

/// Opens `<root>/<tenant>/<group>` for each namespace.
pub struct FileSystemFolders {
    root: PathBuf,
}

impl FileSystemFolders {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

/// A namespace name as a single path component.
fn component(name: &str) -> String {
    name.replace(['/', '\\'], "_").replace("..", "_")
}

impl FolderProvider for FileSystemFolders {
    fn open(&self, tenant: &str, group: &str) -> Arc<dyn Folder> {
        Arc::new(FileSystemFolder::new(
            self.root.join(component(tenant)).join(component(group)),
        ))
    }
}
