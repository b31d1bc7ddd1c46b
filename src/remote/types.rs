use chrono::{DateTime, Utc};

/// Whether a remote entry is a regular file or a folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    File,
    Directory,
}

/// One child of a remote directory, as reported by a single listing call.
///
/// `path` is always absolute and built from the listed parent plus the
/// entry's own name, so ancestor casing matches what the parent listing
/// reported rather than whatever a recursive listing would return.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub path: String,
    pub kind: EntryKind,
    pub size: u64,
    pub modified_at: Option<DateTime<Utc>>,
}

impl RemoteEntry {
    pub fn file(path: impl Into<String>, size: u64, modified_at: DateTime<Utc>) -> Self {
        Self {
            path: path.into(),
            kind: EntryKind::File,
            size,
            modified_at: Some(modified_at),
        }
    }

    pub fn directory(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: EntryKind::Directory,
            size: 0,
            modified_at: None,
        }
    }

    /// Final path component.
    pub fn name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }
}

/// Metadata returned by a completed download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchedFile {
    pub size: u64,
    pub modified_at: Option<DateTime<Utc>>,
}

/// Collapse repeated slashes and strip the trailing slash, keeping `/` for the root.
pub fn normalize_remote_path(path: &str) -> String {
    let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
    format!("/{}", parts.join("/"))
}

/// Join a child name onto a normalized remote directory path.
pub fn join_remote(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", parent, name)
    }
}

/// Parent directory of a normalized remote path (`/` for top-level entries).
pub fn parent_remote(path: &str) -> &str {
    match path.rsplit_once('/') {
        Some(("", _)) | None => "/",
        Some((parent, _)) => parent,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_collapses_slashes() {
        assert_eq!(normalize_remote_path("//Photos//2024/"), "/Photos/2024");
        assert_eq!(normalize_remote_path("Photos"), "/Photos");
        assert_eq!(normalize_remote_path(""), "/");
        assert_eq!(normalize_remote_path("/"), "/");
    }

    #[test]
    fn test_join_remote_at_root() {
        assert_eq!(join_remote("/", "a"), "/a");
        assert_eq!(join_remote("/a", "x.txt"), "/a/x.txt");
    }

    #[test]
    fn test_parent_remote() {
        assert_eq!(parent_remote("/a"), "/");
        assert_eq!(parent_remote("/a/b/c.txt"), "/a/b");
        assert_eq!(parent_remote("/"), "/");
    }

    #[test]
    fn test_entry_name() {
        let e = RemoteEntry::directory("/Photos/Trip 2024");
        assert_eq!(e.name(), "Trip 2024");
        assert!(e.is_dir());
    }
}
