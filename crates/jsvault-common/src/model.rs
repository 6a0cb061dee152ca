//! The virtual file record scripts are stored as.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::path;

/// Stored as `1` for files and `2` for folders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeType {
    File,
    Directory,
}

impl NodeType {
    pub fn code(self) -> u8 {
        match self {
            NodeType::File => 1,
            NodeType::Directory => 2,
        }
    }
}

/// One node of the virtual filesystem.
///
/// Identity is `(tenant, group, directory, name)`. `directory` always ends
/// with `/`, so the full path is a plain concatenation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualFile {
    pub tenant: String,
    pub group: String,
    pub directory: String,
    pub name: String,
    pub node_type: NodeType,
    pub content: Option<String>,
    pub last_modified: DateTime<Utc>,
    pub read_only: bool,
}

impl VirtualFile {
    pub fn file(
        tenant: impl Into<String>,
        group: impl Into<String>,
        full_path: &str,
        content: impl Into<String>,
    ) -> Self {
        let (directory, name) = path::split_path(full_path);
        Self {
            tenant: tenant.into(),
            group: group.into(),
            directory,
            name,
            node_type: NodeType::File,
            content: Some(content.into()),
            last_modified: Utc::now(),
            read_only: false,
        }
    }

    pub fn directory(tenant: impl Into<String>, group: impl Into<String>, full_path: &str) -> Self {
        let (directory, name) = path::split_path(full_path);
        Self {
            tenant: tenant.into(),
            group: group.into(),
            directory,
            name,
            node_type: NodeType::Directory,
            content: None,
            last_modified: Utc::now(),
            read_only: false,
        }
    }

    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn full_path(&self) -> String {
        path::join(&self.directory, &self.name)
    }

    pub fn is_file(&self) -> bool {
        self.node_type == NodeType::File
    }

    /// A file with non-blank content.
    pub fn has_content(&self) -> bool {
        self.is_file()
            && self
                .content
                .as_deref()
                .is_some_and(|content| !content.trim().is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_identity_from_full_path() {
        let file = VirtualFile::file("biz", "default", "/public/tmp.js", "exports.a = 1;");
        assert_eq!(file.directory, "/public/");
        assert_eq!(file.name, "tmp.js");
        assert_eq!(file.full_path(), "/public/tmp.js");
        assert!(file.has_content());
    }

    #[test]
    fn test_blank_file_has_no_content() {
        let file = VirtualFile::file("biz", "default", "/blank.js", "   \n");
        assert!(!file.has_content());
        assert!(!VirtualFile::directory("biz", "default", "/lib").has_content());
    }

    #[test]
    fn test_node_type_codes() {
        assert_eq!(NodeType::File.code(), 1);
        assert_eq!(NodeType::Directory.code(), 2);
    }
}
