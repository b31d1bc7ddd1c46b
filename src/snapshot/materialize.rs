//! Applies a journal to the incomplete snapshot it was written for.
//!
//! Directory and delete entries are applied in journal order. File bodies
//! are queued and fetched afterwards, smallest first, through part files in
//! the job's staging directory.

use std::io::IsTerminal;
use std::path::{Path, PathBuf};

use futures_util::stream::{self, StreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;

use super::error::SnapshotError;
use super::journal::{read_journal, Action, JournalEntry};
use super::layout::local_path;
use super::stats::SessionStats;
use super::transfer::TransferEngine;
use crate::remote::RemoteError;

/// An incomplete snapshot paired with its sealed journal.
#[derive(Debug, Clone)]
pub struct Job {
    pub name: String,
    pub snapshot_dir: PathBuf,
    pub journal_path: PathBuf,
    /// Holds part files while transfers are in flight. Same filesystem as
    /// `snapshot_dir`, outside it.
    pub staging_dir: PathBuf,
}

/// Outcome of one [`Materializer::apply`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyStats {
    /// Entries that changed the tree, transfers included.
    pub updated: u64,
    /// Entries that could not be applied and were skipped.
    pub failed: u64,
    pub transferred: u64,
    /// `Add` files already present from an earlier, interrupted run.
    pub skipped: u64,
    pub bytes: u64,
}

#[derive(Debug, Clone)]
struct PendingTransfer {
    remote_path: String,
    local_path: PathBuf,
    part_path: PathBuf,
    size: u64,
}

pub struct Materializer<'a> {
    transfer: &'a TransferEngine,
    stats: &'a SessionStats,
    concurrency: usize,
    no_progress_bar: bool,
    shutdown: &'a CancellationToken,
}

impl<'a> Materializer<'a> {
    pub fn new(
        transfer: &'a TransferEngine,
        stats: &'a SessionStats,
        concurrency: usize,
        no_progress_bar: bool,
        shutdown: &'a CancellationToken,
    ) -> Self {
        Self {
            transfer,
            stats,
            concurrency: concurrency.max(1),
            no_progress_bar,
            shutdown,
        }
    }

    pub async fn apply(&self, job: &Job) -> Result<ApplyStats, SnapshotError> {
        let entries = read_journal(&job.journal_path).await?;
        tracing::info!(
            "Applying {} journal entries to {}",
            entries.len(),
            job.snapshot_dir.display()
        );

        let mut result = ApplyStats::default();
        let mut queue = Vec::new();
        // Directories that could not be created; nothing below them can land.
        let mut blocked: Vec<PathBuf> = Vec::new();

        for entry in &entries {
            if entry.action == Action::Unchanged {
                continue;
            }
            let local = local_path(&job.snapshot_dir, &entry.path);
            if entry.action != Action::Delete && blocked.iter().any(|b| local.starts_with(b)) {
                tracing::warn!(
                    "Skipping {}: a parent directory could not be created",
                    local.display()
                );
                result.failed += 1;
                continue;
            }
            match (entry.action, entry.is_dir) {
                (Action::Delete, true) => self.remove_dir(&local, &mut result).await,
                (Action::Delete, false) => self.remove_file(&local, &mut result).await,
                (_, true) => {
                    if !self.create_dir(&local, &mut result).await {
                        blocked.push(local);
                    }
                }
                (_, false) => {
                    if entry.action == Action::Add && already_present(&local, entry).await {
                        tracing::debug!("Already present: {}", local.display());
                        result.skipped += 1;
                        result.updated += 1;
                        continue;
                    }
                    let part_path = job.staging_dir.join(format!("{}.part", queue.len()));
                    queue.push(PendingTransfer {
                        remote_path: entry.path.clone(),
                        local_path: local,
                        part_path,
                        size: entry.size,
                    });
                }
            }
        }
        self.stats.add_updated(result.updated);
        self.stats.add_failed(result.failed);

        if queue.is_empty() {
            return Ok(result);
        }
        reset_staging(&job.staging_dir).await?;
        let drained = self.drain(queue, &mut result).await;
        if let Err(e) = tokio::fs::remove_dir_all(&job.staging_dir).await {
            tracing::debug!("Cannot remove {}: {}", job.staging_dir.display(), e);
        }
        drained?;
        Ok(result)
    }

    async fn remove_dir(&self, path: &Path, result: &mut ApplyStats) {
        match tokio::fs::symlink_metadata(path).await {
            Ok(meta) if !meta.is_dir() => {
                tracing::debug!("Not a directory, skipping delete: {}", path.display());
                return;
            }
            _ => {}
        }
        match tokio::fs::remove_dir_all(path).await {
            Ok(()) => result.updated += 1,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => result.updated += 1,
            Err(e) => {
                tracing::warn!("Failed to remove {}: {}", path.display(), e);
                result.failed += 1;
            }
        }
    }

    /// Returns false when the directory could not be created.
    async fn create_dir(&self, path: &Path, result: &mut ApplyStats) -> bool {
        match tokio::fs::create_dir_all(path).await {
            Ok(()) => {
                result.updated += 1;
                true
            }
            Err(e) => {
                tracing::warn!("Failed to create {}: {}", path.display(), e);
                result.failed += 1;
                false
            }
        }
    }

    async fn remove_file(&self, path: &Path, result: &mut ApplyStats) {
        match tokio::fs::symlink_metadata(path).await {
            Ok(meta) if meta.is_dir() => {
                tracing::debug!("Is a directory, skipping file delete: {}", path.display());
                return;
            }
            _ => {}
        }
        match tokio::fs::remove_file(path).await {
            Ok(()) => result.updated += 1,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => result.updated += 1,
            Err(e) => {
                tracing::warn!("Failed to remove {}: {}", path.display(), e);
                result.failed += 1;
            }
        }
    }

    /// Fetch queued bodies smallest first. A file gone from the remote is
    /// counted and skipped; any other failure stops new transfers from being
    /// scheduled while in-flight ones finish.
    async fn drain(
        &self,
        mut queue: Vec<PendingTransfer>,
        result: &mut ApplyStats,
    ) -> Result<(), SnapshotError> {
        queue.sort_by_key(|t| t.size);
        let total = queue.len();
        let total_bytes: u64 = queue.iter().map(|t| t.size).sum();
        tracing::info!(
            "Transferring {} files ({}), concurrency {}",
            total,
            indicatif::HumanBytes(total_bytes),
            self.concurrency
        );

        let pb = create_progress_bar(self.no_progress_bar, total_bytes);
        let stop = self.shutdown.child_token();
        let transfer = self.transfer;

        let mut completions = stream::iter(queue)
            .take_while(|_| std::future::ready(!stop.is_cancelled()))
            .map(|task| async move {
                let outcome = transfer
                    .fetch(&task.remote_path, &task.local_path, &task.part_path, task.size)
                    .await;
                (task, outcome)
            })
            .buffer_unordered(self.concurrency);

        let mut first_error = None;
        let mut done = 0usize;
        while let Some((task, outcome)) = completions.next().await {
            done += 1;
            pb.inc(task.size);
            match outcome {
                Ok(bytes) => {
                    result.transferred += 1;
                    result.updated += 1;
                    result.bytes += bytes;
                    self.stats.add_updated(1);
                    self.stats.add_downloaded(bytes);
                    if let Some(name) = task.local_path.file_name() {
                        pb.set_message(name.to_string_lossy().into_owned());
                    }
                }
                Err(SnapshotError::Transfer {
                    source: RemoteError::NotFound(_),
                    ..
                }) => {
                    pb.suspend(|| {
                        tracing::warn!(
                            "{} no longer exists on the remote, skipping",
                            task.remote_path
                        )
                    });
                    result.failed += 1;
                    self.stats.add_failed(1);
                }
                Err(e) => {
                    pb.suspend(|| tracing::error!("Transfer failed: {}: {}", task.remote_path, e));
                    stop.cancel();
                    first_error.get_or_insert(e);
                }
            }
        }
        pb.finish_and_clear();

        if let Some(e) = first_error {
            return Err(e);
        }
        if done < total {
            tracing::info!("Shutdown requested, {} transfers not started", total - done);
            return Err(SnapshotError::Interrupted);
        }
        Ok(())
    }
}

/// Start the staging directory empty; a crashed run may have left part files.
async fn reset_staging(dir: &Path) -> Result<(), SnapshotError> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(SnapshotError::io(dir, e)),
    }
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| SnapshotError::io(dir, e))
}

async fn already_present(local: &Path, entry: &JournalEntry) -> bool {
    matches!(
        tokio::fs::symlink_metadata(local).await,
        Ok(meta) if meta.is_file() && meta.len() == entry.size
    )
}

fn create_progress_bar(no_progress_bar: bool, total_bytes: u64) -> ProgressBar {
    if no_progress_bar || !std::io::stdout().is_terminal() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(total_bytes);
    pb.set_style(
        ProgressStyle::with_template(
            "[{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta}) {msg}",
        )
        .expect("valid template")
        .progress_chars("=> "),
    );
    pb
}
