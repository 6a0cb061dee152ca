//! Logical path helpers.
//!
//! Logical paths are `/`-rooted and use `/` as the only separator. Every
//! function here works on normalized paths: `.` segments and empty segments
//! are dropped, `..` pops one segment and stops at the root.

pub const SEPARATOR: char = '/';

/// Collapse `.`/`..`, remove duplicate and trailing separators, ensure a leading `/`.
pub fn normalize(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split(SEPARATOR) {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }

    let mut normalized = String::with_capacity(path.len() + 1);
    for segment in &segments {
        normalized.push(SEPARATOR);
        normalized.push_str(segment);
    }
    if normalized.is_empty() {
        normalized.push(SEPARATOR);
    }
    normalized
}

/// Split a full path into `(parent, name)`.
///
/// The parent is everything up to and including the last separator, the
/// name is the remainder. The root is `("/", "")`.
pub fn split_path(full_path: &str) -> (String, String) {
    let normalized = normalize(full_path);
    match normalized.rfind(SEPARATOR) {
        Some(idx) if normalized.len() > 1 => (
            normalized[..=idx].to_string(),
            normalized[idx + 1..].to_string(),
        ),
        _ => (SEPARATOR.to_string(), String::new()),
    }
}

pub fn join(directory: &str, name: &str) -> String {
    normalize(&format!("{directory}{SEPARATOR}{name}"))
}

/// The normalized path with a trailing separator, as stored in `VirtualFile::directory`.
pub fn as_directory(path: &str) -> String {
    let mut normalized = normalize(path);
    if !normalized.ends_with(SEPARATOR) {
        normalized.push(SEPARATOR);
    }
    normalized
}

/// Directory of a file path, with a trailing separator.
pub fn parent(path: &str) -> String {
    split_path(path).0
}

/// Does the last segment carry an extension (`report.json`, not `.hidden`)?
pub fn has_extension(path: &str) -> bool {
    let (_, name) = split_path(path);
    name.rfind('.').is_some_and(|idx| idx > 0 && idx + 1 < name.len())
}

/// Is `path` strictly below the directory `prefix`?
pub fn is_descendant(path: &str, prefix: &str) -> bool {
    let prefix = as_directory(prefix);
    let path = normalize(path);
    path.len() > prefix.len() && path.starts_with(&prefix)
}
