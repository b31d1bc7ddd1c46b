use std::path::PathBuf;

use super::error::SnapshotError;
use super::layout::{SnapshotRoot, SnapshotState};

/// Keep the `keep` newest complete snapshots and delete the rest, each with
/// its journal. Temp and incomplete snapshots are never touched.
///
/// Returns the removed snapshot directories. A snapshot that cannot be
/// removed is logged and left for the next rotation.
pub async fn rotate(root: &SnapshotRoot, keep: usize) -> Result<Vec<PathBuf>, SnapshotError> {
    let mut complete: Vec<_> = root
        .scan()
        .await?
        .into_iter()
        .filter(|s| s.state == SnapshotState::Complete)
        .collect();
    complete.sort_by(|a, b| b.name.cmp(&a.name));

    let mut removed = Vec::new();
    for snapshot in complete.into_iter().skip(keep) {
        tracing::info!("Removing expired snapshot {}", snapshot.name);
        if let Err(e) = tokio::fs::remove_dir_all(&snapshot.path).await {
            tracing::warn!("Failed to remove {}: {}", snapshot.path.display(), e);
            continue;
        }
        let journal = root.journal_path(&snapshot.name);
        match tokio::fs::remove_file(&journal).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Failed to remove {}: {}", journal.display(), e),
        }
        removed.push(snapshot.path);
    }
    Ok(removed)
}
