//! On-disk layout of a snapshot root.
//!
//! ```text
//! <root>/2024-05-01 03:00                 complete snapshot
//! <root>/2024-05-01 03:00.journal         its journal
//! <root>/2024-05-02 03:00.temp            hard-link clone in progress
//! <root>/2024-05-02 03:00.incomplete      being populated
//! <root>/2024-05-02 03:00.journal.part    journal still being written by the differ
//! <root>/2024-05-02 03:00.staging         part files of in-flight transfers
//! ```
//!
//! Every lifecycle transition is a single rename.

use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, Utc};
use walkdir::WalkDir;

use super::error::SnapshotError;

pub const NAME_FORMAT: &str = "%Y-%m-%d %H:%M";
pub const TEMP_SUFFIX: &str = ".temp";
pub const INCOMPLETE_SUFFIX: &str = ".incomplete";
pub const JOURNAL_SUFFIX: &str = ".journal";
pub const PARTIAL_JOURNAL_SUFFIX: &str = ".journal.part";
pub const STAGING_SUFFIX: &str = ".staging";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotState {
    Temp,
    Incomplete,
    Complete,
}

impl SnapshotState {
    pub fn suffix(&self) -> &'static str {
        match self {
            SnapshotState::Temp => TEMP_SUFFIX,
            SnapshotState::Incomplete => INCOMPLETE_SUFFIX,
            SnapshotState::Complete => "",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotState::Temp => "temp",
            SnapshotState::Incomplete => "incomplete",
            SnapshotState::Complete => "complete",
        }
    }
}

/// A snapshot directory found under the root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotDir {
    /// Timestamp name without any lifecycle suffix.
    pub name: String,
    pub state: SnapshotState,
    pub path: PathBuf,
}

/// Counts from a hard-link clone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CloneStats {
    pub dirs: u64,
    pub files: u64,
}

#[derive(Debug, Clone)]
pub struct SnapshotRoot {
    root: PathBuf,
}

impl SnapshotRoot {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Snapshot names are UTC so that name order is chronological order,
    /// whatever the local clock does.
    pub fn snapshot_name(at: &DateTime<Utc>) -> String {
        at.format(NAME_FORMAT).to_string()
    }

    pub fn is_snapshot_name(name: &str) -> bool {
        NaiveDateTime::parse_from_str(name, NAME_FORMAT).is_ok()
    }

    pub fn path_for(&self, name: &str, state: SnapshotState) -> PathBuf {
        self.root.join(format!("{}{}", name, state.suffix()))
    }

    pub fn journal_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{}{}", name, JOURNAL_SUFFIX))
    }

    pub fn partial_journal_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{}{}", name, PARTIAL_JOURNAL_SUFFIX))
    }

    pub fn staging_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{}{}", name, STAGING_SUFFIX))
    }

    pub async fn ensure_exists(&self) -> Result<(), SnapshotError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| SnapshotError::io(&self.root, e))
    }

    /// All snapshot directories under the root, sorted by name ascending.
    /// Entries whose name is not a snapshot timestamp are ignored.
    pub async fn scan(&self) -> Result<Vec<SnapshotDir>, SnapshotError> {
        let mut dir = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|e| SnapshotError::io(&self.root, e))?;

        let mut found = Vec::new();
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| SnapshotError::io(&self.root, e))?
        {
            let file_type = match entry.file_type().await {
                Ok(t) => t,
                Err(_) => continue,
            };
            if !file_type.is_dir() {
                continue;
            }
            let Some(file_name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if let Some(snapshot) = classify_dir_name(&file_name, entry.path()) {
                found.push(snapshot);
            }
        }

        found.sort_by(|a, b| a.name.cmp(&b.name).then(a.path.cmp(&b.path)));
        Ok(found)
    }

    pub async fn latest_complete(&self) -> Result<Option<SnapshotDir>, SnapshotError> {
        Ok(self
            .scan()
            .await?
            .into_iter()
            .filter(|s| s.state == SnapshotState::Complete)
            .max_by(|a, b| a.name.cmp(&b.name)))
    }

    /// Rename a snapshot from one lifecycle state to the next.
    pub async fn promote(
        &self,
        name: &str,
        from: SnapshotState,
        to: SnapshotState,
    ) -> Result<PathBuf, SnapshotError> {
        let src = self.path_for(name, from);
        let dest = self.path_for(name, to);
        if tokio::fs::try_exists(&dest).await.unwrap_or(false) {
            return Err(SnapshotError::AlreadyExists(dest));
        }
        tokio::fs::rename(&src, &dest)
            .await
            .map_err(|e| SnapshotError::io(&src, e))?;
        tracing::debug!(
            "Renamed {} -> {}",
            src.display(),
            dest.display()
        );
        Ok(dest)
    }
}

fn classify_dir_name(file_name: &str, path: PathBuf) -> Option<SnapshotDir> {
    let (name, state) = if let Some(base) = file_name.strip_suffix(TEMP_SUFFIX) {
        (base, SnapshotState::Temp)
    } else if let Some(base) = file_name.strip_suffix(INCOMPLETE_SUFFIX) {
        (base, SnapshotState::Incomplete)
    } else {
        (file_name, SnapshotState::Complete)
    };
    SnapshotRoot::is_snapshot_name(name).then(|| SnapshotDir {
        name: name.to_string(),
        state,
        path,
    })
}

/// Map a normalized remote path to its location inside a snapshot directory.
pub fn local_path(snapshot_dir: &Path, remote_path: &str) -> PathBuf {
    let relative = remote_path.trim_start_matches('/');
    if relative.is_empty() {
        snapshot_dir.to_path_buf()
    } else {
        snapshot_dir.join(relative)
    }
}

/// Clone `source` into a new directory `dest` using hard links for files.
///
/// With no source the destination is created empty. Runs on the blocking
/// pool; `dest` must not exist yet.
pub async fn hard_link_clone(
    source: Option<PathBuf>,
    dest: PathBuf,
) -> Result<CloneStats, SnapshotError> {
    tokio::task::spawn_blocking(move || hard_link_tree(source.as_deref(), &dest)).await?
}

fn hard_link_tree(source: Option<&Path>, dest: &Path) -> Result<CloneStats, SnapshotError> {
    std::fs::create_dir(dest).map_err(|e| SnapshotError::io(dest, e))?;
    let mut stats = CloneStats::default();
    let Some(source) = source else {
        return Ok(stats);
    };

    for entry in WalkDir::new(source).min_depth(1).follow_links(false) {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(source).to_path_buf();
            SnapshotError::io(path, e.into())
        })?;
        let rel = entry.path().strip_prefix(source).unwrap_or(entry.path());
        let target = dest.join(rel);
        let ft = entry.file_type();
        if ft.is_dir() {
            std::fs::create_dir_all(&target).map_err(|e| SnapshotError::io(&target, e))?;
            stats.dirs += 1;
        } else if ft.is_file() {
            std::fs::hard_link(entry.path(), &target)
                .map_err(|e| SnapshotError::io(&target, e))?;
            stats.files += 1;
        } else {
            tracing::debug!("Skipping non-regular entry {}", entry.path().display());
        }
    }
    Ok(stats)
}
