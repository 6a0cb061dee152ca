//! Change events published by the file store.
//!
//! The storage collaborator emits one [`FileChange`] per affected node. The
//! runtime never produces these; it only consumes them to drop stale cache
//! entries.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    Added,
    Updated,
    Deleted,
}

/// `{tenant, group, parentPath, name, changeKind}` on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileChange {
    pub tenant: String,
    pub group: String,
    pub parent_path: String,
    pub name: String,
    pub change_kind: ChangeKind,
}

impl FileChange {
    pub fn new(
        tenant: impl Into<String>,
        group: impl Into<String>,
        parent_path: impl Into<String>,
        name: impl Into<String>,
        change_kind: ChangeKind,
    ) -> Self {
        Self {
            tenant: tenant.into(),
            group: group.into(),
            parent_path: parent_path.into(),
            name: name.into(),
            change_kind,
        }
    }

    /// The full logical path of the changed node.
    pub fn full_path(&self) -> String {
        crate::path::join(&self.parent_path, &self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_format_is_camel_case() {
        let change = FileChange::new("biz", "default", "/public/", "tmp.js", ChangeKind::Deleted);
        let json = serde_json::to_value(&change).unwrap();
        assert_eq!(json["parentPath"], "/public/");
        assert_eq!(json["changeKind"], "Deleted");
        assert_eq!(change.full_path(), "/public/tmp.js");
    }
}
