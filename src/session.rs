//! One snapshot session: resume or list, diff, materialize, complete, rotate.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::remote::{RemoteStore, RetryingRemote};
use crate::retry::{Pacer, RetryConfig};
use crate::snapshot::differ::{self, Differ};
use crate::snapshot::journal::{read_journal, JournalSummary, JournalWriter};
use crate::snapshot::layout::{hard_link_clone, SnapshotDir};
use crate::snapshot::materialize::{ApplyStats, Job, Materializer};
use crate::snapshot::stats::StatsSummary;
use crate::snapshot::transfer::TransferEngine;
use crate::snapshot::{retention, SessionStats, SnapshotError, SnapshotRoot, SnapshotState};

/// Settings for a session, decoupled from CLI and file configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub snapshot_root: PathBuf,
    pub remote_folders: Vec<String>,
    pub rotations: usize,
    pub concurrency: usize,
    pub retry: RetryConfig,
    pub mtime_tolerance: Duration,
    pub no_progress_bar: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    Listing,
    Comparing,
    Materializing,
    Completing,
    Rotated,
}

#[derive(Debug)]
pub struct SessionReport {
    pub name: String,
    pub snapshot: PathBuf,
    pub resumed: bool,
    pub apply: ApplyStats,
    pub rotated: Vec<PathBuf>,
    pub stats: StatsSummary,
}

pub struct Session {
    config: SessionConfig,
    root: SnapshotRoot,
    remote: RetryingRemote,
    stats: SessionStats,
    state: SessionState,
    shutdown: CancellationToken,
}

impl Session {
    pub fn new(
        config: SessionConfig,
        store: Arc<dyn RemoteStore>,
        pacer: Arc<Pacer>,
        shutdown: CancellationToken,
    ) -> Self {
        let remote = RetryingRemote::new(store, config.retry, pacer);
        Self {
            root: SnapshotRoot::new(&config.snapshot_root),
            config,
            remote,
            stats: SessionStats::new(),
            state: SessionState::Init,
            shutdown,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub async fn run(&mut self) -> Result<SessionReport, SnapshotError> {
        self.run_at(Utc::now()).await
    }

    /// Run a session whose new snapshot (if any) is named after `now`.
    /// Counters are logged however the session ends.
    pub async fn run_at(&mut self, now: DateTime<Utc>) -> Result<SessionReport, SnapshotError> {
        let started = Instant::now();
        let result = self.run_inner(now).await;
        match &result {
            Ok(report) => tracing::info!("Snapshot {} complete", report.name),
            Err(SnapshotError::Interrupted) => {
                tracing::warn!(state = ?self.state, "Session interrupted; snapshot left resumable")
            }
            Err(e) => tracing::error!(state = ?self.state, "Session failed: {}", e),
        }
        self.stats.snapshot().log(started.elapsed());
        result
    }

    async fn run_inner(&mut self, now: DateTime<Utc>) -> Result<SessionReport, SnapshotError> {
        self.state = SessionState::Init;
        self.root.ensure_exists().await?;

        let (job, resumed) = match self.prepare_resume().await? {
            Some(ResumePoint::Journal(job)) => {
                tracing::info!("Resuming {} from its journal", job.name);
                (job, true)
            }
            Some(ResumePoint::Rediff(name)) => {
                tracing::info!("Re-comparing unfinished snapshot {}", name);
                let listed = self.list().await?;
                (self.compare(&name, listed).await?, true)
            }
            None => {
                let listed = self.list().await?;
                let name = self.create_snapshot(now).await?;
                (self.compare(&name, listed).await?, false)
            }
        };

        self.state = SessionState::Materializing;
        let engine = TransferEngine::new(self.remote.clone());
        let apply = Materializer::new(
            &engine,
            &self.stats,
            self.config.concurrency,
            self.config.no_progress_bar,
            &self.shutdown,
        )
        .apply(&job)
        .await?;

        self.state = SessionState::Completing;
        let snapshot = self
            .root
            .promote(&job.name, SnapshotState::Incomplete, SnapshotState::Complete)
            .await?;

        let rotated = retention::rotate(&self.root, self.config.rotations).await?;
        self.state = SessionState::Rotated;

        Ok(SessionReport {
            name: job.name,
            snapshot,
            resumed,
            apply,
            rotated,
            stats: self.stats.snapshot(),
        })
    }

    /// Clean up after a crashed run and decide whether to continue it.
    async fn prepare_resume(&self) -> Result<Option<ResumePoint>, SnapshotError> {
        let snapshots = self.root.scan().await?;

        for temp in snapshots.iter().filter(|s| s.state == SnapshotState::Temp) {
            tracing::info!("Discarding unfinished clone {}", temp.path.display());
            tokio::fs::remove_dir_all(&temp.path)
                .await
                .map_err(|e| SnapshotError::io(&temp.path, e))?;
            remove_if_exists(&self.root.partial_journal_path(&temp.name)).await?;
        }

        let mut incomplete: Vec<&SnapshotDir> = snapshots
            .iter()
            .filter(|s| s.state == SnapshotState::Incomplete)
            .collect();
        let Some(latest) = incomplete.pop() else {
            return Ok(None);
        };
        for stale in incomplete {
            tracing::warn!(
                "Ignoring older unfinished snapshot {}; only the newest is resumed",
                stale.path.display()
            );
        }

        if tokio::fs::try_exists(self.root.journal_path(&latest.name))
            .await
            .unwrap_or(false)
        {
            Ok(Some(ResumePoint::Journal(self.job(&latest.name))))
        } else {
            Ok(Some(ResumePoint::Rediff(latest.name.clone())))
        }
    }

    async fn list(&mut self) -> Result<Vec<differ::ListedFolder>, SnapshotError> {
        self.state = SessionState::Listing;
        differ::list_folders(&self.remote, &self.config.remote_folders).await
    }

    /// Hard-link clone the latest complete snapshot and mark it incomplete.
    async fn create_snapshot(&self, now: DateTime<Utc>) -> Result<String, SnapshotError> {
        let name = SnapshotRoot::snapshot_name(&now);
        let final_path = self.root.path_for(&name, SnapshotState::Complete);
        if tokio::fs::try_exists(&final_path).await.unwrap_or(false) {
            return Err(SnapshotError::AlreadyExists(final_path));
        }

        let previous = self.root.latest_complete().await?;
        match &previous {
            Some(p) => tracing::info!("Cloning {} into {}", p.name, name),
            None => tracing::info!("No previous snapshot, starting {} empty", name),
        }
        let temp = self.root.path_for(&name, SnapshotState::Temp);
        let cloned = hard_link_clone(previous.map(|p| p.path), temp).await?;
        tracing::debug!(dirs = cloned.dirs, files = cloned.files, "Clone finished");

        self.root
            .promote(&name, SnapshotState::Temp, SnapshotState::Incomplete)
            .await?;
        Ok(name)
    }

    /// Diff into a fresh partial journal and seal it.
    async fn compare(
        &mut self,
        name: &str,
        listed: Vec<differ::ListedFolder>,
    ) -> Result<Job, SnapshotError> {
        self.state = SessionState::Comparing;
        let job = self.job(name);
        let part = self.root.partial_journal_path(name);
        let mut journal = JournalWriter::create(&part).await?;

        let summary = Differ::new(
            &self.remote,
            &job.snapshot_dir,
            self.config.mtime_tolerance,
            &self.stats,
            &self.shutdown,
        )
        .compare(listed, &mut journal)
        .await?;

        tracing::debug!(lines = journal.lines(), "Journal complete");
        journal.finish(&job.journal_path).await?;
        tracing::info!(
            "Compared: {} added, {} updated, {} deleted, {} unchanged",
            summary.added,
            summary.updated,
            summary.deleted,
            summary.unchanged
        );
        Ok(job)
    }

    fn job(&self, name: &str) -> Job {
        Job {
            name: name.to_string(),
            snapshot_dir: self.root.path_for(name, SnapshotState::Incomplete),
            journal_path: self.root.journal_path(name),
            staging_dir: self.root.staging_path(name),
        }
    }
}

enum ResumePoint {
    /// Incomplete snapshot with a sealed journal: replay it.
    Journal(Job),
    /// Incomplete snapshot whose journal never finished: diff again.
    Rediff(String),
}

async fn remove_if_exists(path: &std::path::Path) -> Result<(), SnapshotError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(SnapshotError::io(path, e)),
    }
}

/// Journal state of a snapshot, for `status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalState {
    Missing,
    Partial,
    Sealed,
}

#[derive(Debug, Clone)]
pub struct SnapshotStatus {
    pub name: String,
    pub state: SnapshotState,
    pub journal: JournalState,
    /// Pending work, for an incomplete snapshot with a sealed journal.
    pub pending: Option<JournalSummary>,
}

/// Describe every snapshot under the root.
pub async fn inspect(root: &SnapshotRoot) -> Result<Vec<SnapshotStatus>, SnapshotError> {
    if !tokio::fs::try_exists(root.path()).await.unwrap_or(false) {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    for snapshot in root.scan().await? {
        let sealed = root.journal_path(&snapshot.name);
        let journal = if tokio::fs::try_exists(&sealed).await.unwrap_or(false) {
            JournalState::Sealed
        } else if tokio::fs::try_exists(root.partial_journal_path(&snapshot.name))
            .await
            .unwrap_or(false)
        {
            JournalState::Partial
        } else {
            JournalState::Missing
        };
        let pending = if snapshot.state == SnapshotState::Incomplete
            && journal == JournalState::Sealed
        {
            Some(JournalSummary::from_entries(&read_journal(&sealed).await?))
        } else {
            None
        };
        out.push(SnapshotStatus {
            name: snapshot.name,
            state: snapshot.state,
            journal,
            pending,
        });
    }
    Ok(out)
}
