use std::path::{Path, PathBuf};

use crate::remote::RemoteError;

/// Errors raised by the snapshot engine.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("Listing {path} failed: {source}")]
    Listing {
        path: String,
        #[source]
        source: RemoteError,
    },

    #[error("Transfer of {path} failed: {source}")]
    Transfer {
        path: String,
        #[source]
        source: RemoteError,
    },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Journal {path} is corrupt at line {line}: {reason}")]
    JournalCorrupt {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("Snapshot {0} already exists")]
    AlreadyExists(PathBuf),

    #[error("Interrupted by shutdown signal")]
    Interrupted,

    #[error("Background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl SnapshotError {
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// True if the error means the remote could not be listed, as opposed to
    /// a failure while populating the snapshot.
    pub fn is_listing(&self) -> bool {
        matches!(self, Self::Listing { .. })
    }
}
