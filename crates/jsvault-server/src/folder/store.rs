//! File store interface and an in-memory implementation.
//!
//! The persistent store of script source lives outside this crate; the
//! runtime only needs [`FileStore`]. [`MemoryFileStore`] implements it for
//! the CLI bootstrap and tests, and publishes [`FileChange`] events the same
//! way the persistent store does.

use chrono::Utc;
use jsvault_common::path;
use jsvault_common::protocol::error::{JsVaultError, Result};
use jsvault_common::{ChangeKind, FileChange, NodeType, VirtualFile};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{PoisonError, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, warn};

const CHANGE_CHANNEL_CAPACITY: usize = 1024;

pub trait FileStore: Send + Sync {
    fn get_file(
        &self,
        tenant: &str,
        group: &str,
        directory: &str,
        name: &str,
    ) -> Result<Option<VirtualFile>>;

    /// Direct children of `directory`, ordered by name.
    fn list_children(&self, tenant: &str, group: &str, directory: &str) -> Result<Vec<VirtualFile>>;

    /// Every node strictly below `prefix`.
    fn list_descendants(&self, tenant: &str, group: &str, prefix: &str) -> Result<Vec<VirtualFile>>;
}

type StoreKey = (String, String, String, String);

fn key(tenant: &str, group: &str, directory: &str, name: &str) -> StoreKey {
    (
        tenant.to_string(),
        group.to_string(),
        path::as_directory(directory),
        name.to_string(),
    )
}

pub struct MemoryFileStore {
    files: RwLock<BTreeMap<StoreKey, VirtualFile>>,
    changes: broadcast::Sender<FileChange>,
}

impl Default for MemoryFileStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryFileStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            files: RwLock::new(BTreeMap::new()),
            changes,
        }
    }

    /// Subscribe to the change stream.
    pub fn subscribe(&self) -> broadcast::Receiver<FileChange> {
        self.changes.subscribe()
    }

    pub fn put_file(
        &self,
        tenant: &str,
        group: &str,
        full_path: &str,
        content: impl Into<String>,
    ) -> Result<ChangeKind> {
        self.put(VirtualFile::file(tenant, group, full_path, content))
    }

    /// Insert or replace a node, creating missing parent directories.
    ///
    /// Rewriting a read-only file is rejected.
    pub fn put(&self, mut file: VirtualFile) -> Result<ChangeKind> {
        file.directory = path::as_directory(&file.directory);
        if file.name.is_empty() {
            return Err(JsVaultError::InvalidRequest("cannot write the root node".into()));
        }

        let mut created = Vec::new();
        let kind = {
            let mut files = self.files.write().unwrap_or_else(PoisonError::into_inner);

            let mut ancestor = file.directory.clone();
            while ancestor != "/" {
                let (parent, name) = path::split_path(&ancestor);
                let ancestor_key = key(&file.tenant, &file.group, &parent, &name);
                match files.get(&ancestor_key) {
                    Some(existing) if existing.node_type == NodeType::File => {
                        return Err(JsVaultError::InvalidRequest(format!(
                            "{} is a file, not a directory",
                            existing.full_path()
                        )));
                    }
                    Some(_) => {}
                    None => {
                        let dir = VirtualFile::directory(&file.tenant, &file.group, &ancestor);
                        created.push(FileChange::new(
                            &file.tenant,
                            &file.group,
                            &dir.directory,
                            &dir.name,
                            ChangeKind::Added,
                        ));
                        files.insert(ancestor_key, dir);
                    }
                }
                ancestor = parent;
            }

            let file_key = key(&file.tenant, &file.group, &file.directory, &file.name);
            let kind = match files.get(&file_key) {
                Some(existing) if existing.read_only => {
                    return Err(JsVaultError::InvalidRequest(format!(
                        "{} is read-only",
                        existing.full_path()
                    )));
                }
                Some(existing) if existing.node_type != file.node_type => {
                    return Err(JsVaultError::InvalidRequest(format!(
                        "{} already exists with a different node type",
                        existing.full_path()
                    )));
                }
                Some(_) => ChangeKind::Updated,
                None => ChangeKind::Added,
            };
            file.last_modified = Utc::now();
            created.push(FileChange::new(
                &file.tenant,
                &file.group,
                &file.directory,
                &file.name,
                kind,
            ));
            files.insert(file_key, file);
            kind
        };

        // Parents are announced before the node itself
        created.sort_by_key(|change| change.parent_path.len());
        for change in created {
            self.publish(change);
        }
        Ok(kind)
    }

    pub fn create_directory(&self, tenant: &str, group: &str, full_path: &str) -> Result<()> {
        let (directory, name) = path::split_path(full_path);
        let exists = {
            let files = self.files.read().unwrap_or_else(PoisonError::into_inner);
            files.contains_key(&key(tenant, group, &directory, &name))
        };
        if exists || name.is_empty() {
            return Ok(());
        }
        self.put(VirtualFile::directory(tenant, group, full_path))
            .map(|_| ())
    }

    /// Delete a node. Deleting a directory deletes everything below it and
    /// publishes one `Deleted` event per removed node. Returns how many
    /// nodes were removed.
    pub fn delete(&self, tenant: &str, group: &str, full_path: &str) -> Result<usize> {
        let (directory, name) = path::split_path(full_path);
        let removed = {
            let mut files = self.files.write().unwrap_or_else(PoisonError::into_inner);
            let Some(node) = files.remove(&key(tenant, group, &directory, &name)) else {
                return Ok(0);
            };

            let mut removed = Vec::new();
            if node.node_type == NodeType::Directory {
                let prefix = node.full_path();
                let doomed: Vec<StoreKey> = files
                    .iter()
                    .filter(|(_, file)| {
                        file.tenant == tenant
                            && file.group == group
                            && path::is_descendant(&file.full_path(), &prefix)
                    })
                    .map(|(key, _)| key.clone())
                    .collect();
                for doomed_key in doomed {
                    if let Some(file) = files.remove(&doomed_key) {
                        removed.push(file);
                    }
                }
            }
            removed.push(node);
            removed
        };

        let count = removed.len();
        for file in removed {
            self.publish(FileChange::new(
                tenant,
                group,
                &file.directory,
                &file.name,
                ChangeKind::Deleted,
            ));
        }
        Ok(count)
    }

    /// Seed the store from a directory laid out as `<tenant>/<group>/...`.
    ///
    /// Non-UTF-8 files are skipped. Returns the number of files loaded.
    pub fn load_dir(&self, root: &Path) -> Result<usize> {
        let mut loaded = 0;
        for tenant in std::fs::read_dir(root)? {
            let tenant = tenant?;
            if !tenant.file_type()?.is_dir() {
                continue;
            }
            let tenant_name = tenant.file_name().to_string_lossy().into_owned();
            for group in std::fs::read_dir(tenant.path())? {
                let group = group?;
                if !group.file_type()?.is_dir() {
                    continue;
                }
                let group_name = group.file_name().to_string_lossy().into_owned();
                self.load_tree(&tenant_name, &group_name, &group.path(), "/", &mut loaded)?;
            }
        }
        debug!(root = %root.display(), files = loaded, "Loaded script tree");
        Ok(loaded)
    }

    fn load_tree(
        &self,
        tenant: &str,
        group: &str,
        disk: &Path,
        logical: &str,
        loaded: &mut usize,
    ) -> Result<()> {
        for entry in std::fs::read_dir(disk)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let logical_path = path::join(logical, &name);
            if entry.file_type()?.is_dir() {
                self.create_directory(tenant, group, &logical_path)?;
                self.load_tree(tenant, group, &entry.path(), &logical_path, loaded)?;
            } else {
                match std::fs::read_to_string(entry.path()) {
                    Ok(content) => {
                        self.put_file(tenant, group, &logical_path, content)?;
                        *loaded += 1;
                    }
                    Err(e) => warn!(path = %entry.path().display(), "Skipping unreadable script: {}", e),
                }
            }
        }
        Ok(())
    }

    fn publish(&self, change: FileChange) {
        // No subscribers is fine
        let _ = self.changes.send(change);
    }
}

impl FileStore for MemoryFileStore {
    fn get_file(
        &self,
        tenant: &str,
        group: &str,
        directory: &str,
        name: &str,
    ) -> Result<Option<VirtualFile>> {
        let files = self.files.read().unwrap_or_else(PoisonError::into_inner);
        Ok(files.get(&key(tenant, group, directory, name)).cloned())
    }

    fn list_children(&self, tenant: &str, group: &str, directory: &str) -> Result<Vec<VirtualFile>> {
        let directory = path::as_directory(directory);
        let files = self.files.read().unwrap_or_else(PoisonError::into_inner);
        Ok(files
            .values()
            .filter(|file| file.tenant == tenant && file.group == group && file.directory == directory)
            .cloned()
            .collect())
    }

    fn list_descendants(&self, tenant: &str, group: &str, prefix: &str) -> Result<Vec<VirtualFile>> {
        let files = self.files.read().unwrap_or_else(PoisonError::into_inner);
        Ok(files
            .values()
            .filter(|file| {
                file.tenant == tenant
                    && file.group == group
                    && path::is_descendant(&file.full_path(), prefix)
            })
            .cloned()
            .collect())
    }
}
