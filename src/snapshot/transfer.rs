//! Single-file transfers into a snapshot.
//!
//! Each attempt downloads into a part file in the job's staging directory,
//! which lives beside the snapshot rather than inside it, so no remote name
//! can collide with a part file. Only a verified, fully synced body is
//! renamed over the target. The rename swaps the directory entry, so a
//! hard-linked inode shared with an older snapshot is never written to.

use std::fs::FileTimes;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};

use super::error::SnapshotError;
use crate::remote::{FetchedFile, RemoteError, RetryingRemote};

/// Set the modification and access times of a file.
pub fn set_file_mtime(path: &Path, modified: DateTime<Utc>) -> std::io::Result<()> {
    let time = SystemTime::from(modified);
    let times = FileTimes::new().set_modified(time).set_accessed(time);
    let file = std::fs::File::options().write(true).open(path)?;
    file.set_times(times)?;
    Ok(())
}

/// Removes the part file unless the transfer completed.
struct PartFileGuard {
    path: PathBuf,
    armed: bool,
}

impl PartFileGuard {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PartFileGuard {
    fn drop(&mut self) {
        if self.armed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

#[derive(Clone)]
pub struct TransferEngine {
    remote: RetryingRemote,
}

impl TransferEngine {
    pub fn new(remote: RetryingRemote) -> Self {
        Self { remote }
    }

    /// Fetch one file body into `local_path` by way of `part`, returning the
    /// bytes written. `part` must be on the same filesystem as `local_path`
    /// and unique to this transfer.
    ///
    /// Transient failures are retried under the shared policy. On any error
    /// `local_path` is left exactly as it was.
    pub async fn fetch(
        &self,
        remote_path: &str,
        local_path: &Path,
        part: &Path,
        expected_size: u64,
    ) -> Result<u64, SnapshotError> {
        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| SnapshotError::io(parent, e))?;
        }

        let mut guard = PartFileGuard::new(part.to_path_buf());

        let fetched = self
            .remote
            .with_retry(|| self.attempt(remote_path, part))
            .await
            .map_err(|source| SnapshotError::Transfer {
                path: remote_path.to_string(),
                source,
            })?;

        if fetched.size != expected_size {
            tracing::debug!(
                path = remote_path,
                expected_size,
                actual_size = fetched.size,
                "Remote size changed since listing"
            );
        }

        if let Some(modified) = fetched.modified_at {
            let mtime_path = part.to_path_buf();
            if let Err(e) =
                tokio::task::spawn_blocking(move || set_file_mtime(&mtime_path, modified)).await?
            {
                tracing::warn!("Failed to set mtime on {}: {}", local_path.display(), e);
            }
        }

        let file = tokio::fs::File::open(part)
            .await
            .map_err(|e| SnapshotError::io(part, e))?;
        file.sync_all()
            .await
            .map_err(|e| SnapshotError::io(part, e))?;
        drop(file);

        tokio::fs::rename(part, local_path)
            .await
            .map_err(|e| SnapshotError::io(local_path, e))?;
        guard.disarm();

        tracing::debug!(
            size_bytes = fetched.size,
            path = %local_path.display(),
            "Transfer complete"
        );
        Ok(fetched.size)
    }

    async fn attempt(&self, remote_path: &str, part: &Path) -> Result<FetchedFile, RemoteError> {
        // Always start from an empty part file.
        let _ = tokio::fs::remove_file(part).await;
        let fetched = self.remote.store().fetch(remote_path, part).await?;
        let received = tokio::fs::metadata(part)
            .await
            .map_err(|source| RemoteError::Io {
                path: part.to_path_buf(),
                source,
            })?
            .len();
        if received != fetched.size {
            return Err(RemoteError::Truncated {
                path: remote_path.to_string(),
                expected: fetched.size,
                received,
            });
        }
        Ok(fetched)
    }
}
