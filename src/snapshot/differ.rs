//! Remote-vs-local tree comparison.
//!
//! The walk lists one remote directory at a time, compares its children with
//! the matching directory inside the snapshot being built, and appends the
//! resulting block to the journal before descending. A crash therefore loses
//! at most one directory's comparison.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use super::error::SnapshotError;
use super::journal::{Action, JournalEntry, JournalSummary, JournalWriter};
use super::layout::local_path;
use super::stats::SessionStats;
use crate::remote::types::{join_remote, normalize_remote_path};
use crate::remote::{RemoteEntry, RetryingRemote};

/// Default slack when comparing modification times.
pub const DEFAULT_MTIME_TOLERANCE: Duration = Duration::from_secs(2);

/// A configured remote folder together with its first listing.
#[derive(Debug, Clone)]
pub struct ListedFolder {
    pub path: String,
    pub entries: Vec<RemoteEntry>,
}

/// What the differ found for one name inside a local directory.
#[derive(Debug, Clone, Copy)]
struct LocalEntry {
    is_dir: bool,
    size: u64,
    modified: Option<SystemTime>,
}

/// Normalize the configured folders and drop any nested inside another.
///
/// `/` swallows everything else.
pub fn effective_folders(folders: &[String]) -> Vec<String> {
    let normalized: BTreeSet<String> = folders.iter().map(|f| normalize_remote_path(f)).collect();
    if normalized.is_empty() || normalized.contains("/") {
        return vec!["/".to_string()];
    }
    let mut kept: Vec<String> = Vec::new();
    for folder in normalized {
        let nested = kept
            .iter()
            .any(|k| folder.starts_with(&format!("{}/", k)));
        if !nested {
            kept.push(folder);
        }
    }
    kept
}

/// List every configured folder once. Fails before anything is written if a
/// folder is missing or the remote is unreachable.
pub async fn list_folders(
    remote: &RetryingRemote,
    folders: &[String],
) -> Result<Vec<ListedFolder>, SnapshotError> {
    let mut listed = Vec::with_capacity(folders.len());
    for folder in effective_folders(folders) {
        let entries = remote
            .list(&folder)
            .await
            .map_err(|source| SnapshotError::Listing {
                path: folder.clone(),
                source,
            })?;
        tracing::debug!(folder = %folder, entries = entries.len(), "Listed folder");
        listed.push(ListedFolder {
            path: folder,
            entries,
        });
    }
    Ok(listed)
}

pub struct Differ<'a> {
    remote: &'a RetryingRemote,
    snapshot_dir: &'a Path,
    tolerance: Duration,
    stats: &'a SessionStats,
    shutdown: &'a CancellationToken,
}

impl<'a> Differ<'a> {
    pub fn new(
        remote: &'a RetryingRemote,
        snapshot_dir: &'a Path,
        tolerance: Duration,
        stats: &'a SessionStats,
        shutdown: &'a CancellationToken,
    ) -> Self {
        Self {
            remote,
            snapshot_dir,
            tolerance,
            stats,
            shutdown,
        }
    }

    /// Walk every listed folder and append one journal block per directory.
    pub async fn compare(
        &self,
        listed: Vec<ListedFolder>,
        journal: &mut JournalWriter,
    ) -> Result<JournalSummary, SnapshotError> {
        let mut summary = JournalSummary::default();
        let whole_tree = listed.len() == 1 && listed[0].path == "/";

        if !whole_tree {
            let block = self.prune_unlisted_roots(&listed).await;
            self.write_block(journal, &block, &mut summary).await?;
        }

        for folder in listed {
            if folder.path != "/" {
                let block = self.folder_root_block(&folder.path).await;
                self.write_block(journal, &block, &mut summary).await?;
            }
            self.walk(folder, journal, &mut summary).await?;
        }
        Ok(summary)
    }

    async fn walk(
        &self,
        folder: ListedFolder,
        journal: &mut JournalWriter,
        summary: &mut JournalSummary,
    ) -> Result<(), SnapshotError> {
        let mut stack: Vec<(String, Option<Vec<RemoteEntry>>)> =
            vec![(folder.path, Some(folder.entries))];

        while let Some((dir, prefetched)) = stack.pop() {
            if self.shutdown.is_cancelled() {
                return Err(SnapshotError::Interrupted);
            }

            let remote_entries = match prefetched {
                Some(entries) => entries,
                None => self
                    .remote
                    .list(&dir)
                    .await
                    .map_err(|source| SnapshotError::Listing {
                        path: dir.clone(),
                        source,
                    })?,
            };
            self.stats.add_scanned(remote_entries.len() as u64);

            let local = read_local_dir(&local_path(self.snapshot_dir, &dir)).await;
            let (block, subdirs) = classify_directory(&dir, remote_entries, local, self.tolerance);
            self.write_block(journal, &block, summary).await?;

            // Reverse so the lexicographically first child is popped next.
            for sub in subdirs.into_iter().rev() {
                stack.push((sub, None));
            }
        }
        Ok(())
    }

    async fn write_block(
        &self,
        journal: &mut JournalWriter,
        block: &[JournalEntry],
        summary: &mut JournalSummary,
    ) -> Result<(), SnapshotError> {
        journal.append_block(block).await?;
        for entry in block {
            summary.record(entry);
        }
        Ok(())
    }

    /// Deletes for top-level local entries outside every configured folder.
    async fn prune_unlisted_roots(&self, listed: &[ListedFolder]) -> Vec<JournalEntry> {
        let keep: BTreeSet<&str> = listed
            .iter()
            .filter_map(|f| f.path.trim_start_matches('/').split('/').next())
            .collect();
        let local = read_local_dir(self.snapshot_dir).await;
        let mut block: Vec<JournalEntry> = local
            .into_iter()
            .filter(|(name, _)| !keep.contains(name.as_str()))
            .map(|(name, entry)| delete_entry(join_remote("/", &name), entry))
            .collect();
        block.sort_by(|a, b| a.path.cmp(&b.path));
        block
    }

    /// Make sure a configured folder exists as a directory in the snapshot.
    async fn folder_root_block(&self, folder: &str) -> Vec<JournalEntry> {
        let path = local_path(self.snapshot_dir, folder);
        match tokio::fs::symlink_metadata(&path).await {
            Ok(meta) if meta.is_dir() => Vec::new(),
            Ok(_) => vec![
                JournalEntry::file(Action::Delete, folder, 0),
                JournalEntry::dir(Action::Add, folder),
            ],
            Err(_) => vec![JournalEntry::dir(Action::Add, folder)],
        }
    }
}

fn delete_entry(path: String, local: LocalEntry) -> JournalEntry {
    if local.is_dir {
        JournalEntry::dir(Action::Delete, path)
    } else {
        JournalEntry::file(Action::Delete, path, 0)
    }
}

fn is_safe_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains(['/', '\n', '\r'])
}

/// Read one local directory. Any failure reads as an empty directory, so
/// every remote child becomes an `Add`.
async fn read_local_dir(path: &Path) -> HashMap<String, LocalEntry> {
    let mut out = HashMap::new();
    let mut dir = match tokio::fs::read_dir(path).await {
        Ok(d) => d,
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("Cannot read {}: {}; treating as empty", path.display(), e);
            }
            return out;
        }
    };

    loop {
        let entry = match dir.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!("Error reading {}: {}", path.display(), e);
                break;
            }
        };
        let Ok(name) = entry.file_name().into_string() else {
            tracing::warn!("Skipping non-UTF-8 name in {}", path.display());
            continue;
        };
        if !is_safe_name(&name) {
            tracing::warn!("Skipping unrepresentable name {:?} in {}", name, path.display());
            continue;
        }
        let meta = match tokio::fs::symlink_metadata(entry.path()).await {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!("Cannot stat {}: {}", entry.path().display(), e);
                continue;
            }
        };
        out.insert(
            name,
            LocalEntry {
                is_dir: meta.is_dir(),
                size: meta.len(),
                modified: meta.modified().ok(),
            },
        );
    }
    out
}

/// Either size or modification time differing counts as a change.
fn is_unchanged(local: &LocalEntry, remote: &RemoteEntry, tolerance: Duration) -> bool {
    if local.size != remote.size {
        return false;
    }
    match (local.modified, remote.modified_at) {
        (_, None) => true,
        (None, Some(_)) => false,
        (Some(l), Some(r)) => match system_time_to_utc(l) {
            Some(l) => {
                let diff_ms = (l - r).num_milliseconds().unsigned_abs();
                diff_ms <= tolerance.as_millis() as u64
            }
            None => false,
        },
    }
}

/// `None` when the time lies outside what chrono can represent.
fn system_time_to_utc(t: SystemTime) -> Option<DateTime<Utc>> {
    match t.duration_since(UNIX_EPOCH) {
        Ok(after) => DateTime::<Utc>::from_timestamp(
            i64::try_from(after.as_secs()).ok()?,
            after.subsec_nanos(),
        ),
        Err(e) => {
            let before = e.duration();
            let secs = i64::try_from(before.as_secs()).ok()?;
            match before.subsec_nanos() {
                0 => DateTime::<Utc>::from_timestamp(secs.checked_neg()?, 0),
                nanos => DateTime::<Utc>::from_timestamp(-secs - 1, 1_000_000_000 - nanos),
            }
        }
    }
}

/// Classify one directory's children.
///
/// Returns the journal block, sorted by path with a `Delete` ahead of any
/// other action on the same path, and the child directories to descend into
/// in lexicographic order.
fn classify_directory(
    dir: &str,
    remote: Vec<RemoteEntry>,
    mut local: HashMap<String, LocalEntry>,
    tolerance: Duration,
) -> (Vec<JournalEntry>, Vec<String>) {
    let mut block = Vec::with_capacity(remote.len());
    let mut subdirs = Vec::new();

    for entry in remote {
        let name = entry.name().to_string();
        if !is_safe_name(&name) {
            tracing::warn!("Skipping remote entry with unrepresentable name {:?}", entry.path);
            continue;
        }
        let path = join_remote(dir, &name);

        match local.remove(&name) {
            None => block.push(add_entry(&path, &entry)),
            Some(l) if l.is_dir != entry.is_dir() => {
                block.push(delete_entry(path.clone(), l));
                block.push(add_entry(&path, &entry));
            }
            Some(_) if entry.is_dir() => block.push(JournalEntry::dir(Action::Unchanged, &path)),
            Some(l) => {
                let action = if is_unchanged(&l, &entry, tolerance) {
                    Action::Unchanged
                } else {
                    Action::Update
                };
                block.push(JournalEntry::file(action, &path, entry.size));
            }
        }
        if entry.is_dir() {
            subdirs.push(path);
        }
    }

    for (name, l) in local {
        block.push(delete_entry(join_remote(dir, &name), l));
    }

    block.sort_by(|a, b| {
        a.path
            .cmp(&b.path)
            .then_with(|| (a.action != Action::Delete).cmp(&(b.action != Action::Delete)))
    });
    subdirs.sort();
    (block, subdirs)
}

fn add_entry(path: &str, remote: &RemoteEntry) -> JournalEntry {
    if remote.is_dir() {
        JournalEntry::dir(Action::Add, path)
    } else {
        JournalEntry::file(Action::Add, path, remote.size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::fake::{retrying, ts, FakeRemote};
    use crate::snapshot::transfer::set_file_mtime;
    use std::fs;
    use std::sync::Arc;

    async fn run_diff(
        fake: &Arc<FakeRemote>,
        snapshot_dir: &Path,
        folders: &[&str],
    ) -> Result<String, SnapshotError> {
        let remote = retrying(fake, 1);
        let folders: Vec<String> = folders.iter().map(|f| f.to_string()).collect();
        let listed = list_folders(&remote, &folders).await?;
        let stats = SessionStats::new();
        let token = CancellationToken::new();
        let journal_dir = tempfile::tempdir().unwrap();
        let part = journal_dir.path().join("j.part");
        let mut journal = JournalWriter::create(&part).await?;
        Differ::new(&remote, snapshot_dir, DEFAULT_MTIME_TOLERANCE, &stats, &token)
            .compare(listed, &mut journal)
            .await?;
        let fin = journal_dir.path().join("j");
        journal.finish(&fin).await?;
        Ok(fs::read_to_string(fin).unwrap())
    }

    fn write_local(root: &Path, rel: &str, data: &[u8], modified: DateTime<Utc>) {
        let p = root.join(rel);
        fs::create_dir_all(p.parent().unwrap()).unwrap();
        fs::write(&p, data).unwrap();
        set_file_mtime(&p, modified).unwrap();
    }

    #[tokio::test]
    async fn test_empty_local_adds_directory_before_children() {
        let fake = Arc::new(FakeRemote::new());
        fake.add_file("/a/y.txt", &[0u8; 20], ts(100));
        fake.add_file("/a/x.txt", &[0u8; 10], ts(100));
        let snap = tempfile::tempdir().unwrap();

        let journal = run_diff(&fake, snap.path(), &["/"]).await.unwrap();
        assert_eq!(journal, "+ /a/\n+ /a/x.txt 10\n+ /a/y.txt 20\n");
    }

    #[tokio::test]
    async fn test_unchanged_tree_yields_only_unchanged_entries() {
        let fake = Arc::new(FakeRemote::new());
        fake.add_file("/a/x.txt", b"0123456789", ts(1_700_000_000));
        fake.add_file("/top.bin", b"abc", ts(1_700_000_100));
        let snap = tempfile::tempdir().unwrap();
        write_local(snap.path(), "a/x.txt", b"0123456789", ts(1_700_000_000));
        write_local(snap.path(), "top.bin", b"abc", ts(1_700_000_101));

        let journal = run_diff(&fake, snap.path(), &["/"]).await.unwrap();
        assert_eq!(journal, "  /a/\n  /top.bin 3\n  /a/x.txt 10\n");
        let again = run_diff(&fake, snap.path(), &["/"]).await.unwrap();
        assert_eq!(journal, again);
    }

    #[tokio::test]
    async fn test_either_size_or_mtime_change_is_an_update() {
        let fake = Arc::new(FakeRemote::new());
        fake.add_file("/same_size_new_mtime", b"aaaa", ts(2_000));
        fake.add_file("/new_size_same_mtime", b"bbbbbb", ts(1_000));
        fake.add_file("/within_tolerance", b"cc", ts(1_001));
        let snap = tempfile::tempdir().unwrap();
        write_local(snap.path(), "same_size_new_mtime", b"AAAA", ts(1_000));
        write_local(snap.path(), "new_size_same_mtime", b"bb", ts(1_000));
        write_local(snap.path(), "within_tolerance", b"cc", ts(1_000));

        let journal = run_diff(&fake, snap.path(), &["/"]).await.unwrap();
        assert_eq!(
            journal,
            "u /new_size_same_mtime 6\nu /same_size_new_mtime 4\n  /within_tolerance 2\n"
        );
    }

    #[tokio::test]
    async fn test_local_only_entries_are_deleted() {
        let fake = Arc::new(FakeRemote::new());
        fake.add_file("/keep.txt", b"k", ts(5));
        let snap = tempfile::tempdir().unwrap();
        write_local(snap.path(), "keep.txt", b"k", ts(5));
        write_local(snap.path(), "b.txt", b"stale", ts(5));
        write_local(snap.path(), "old/deep/file", b"x", ts(5));

        let journal = run_diff(&fake, snap.path(), &["/"]).await.unwrap();
        assert_eq!(journal, "- /b.txt 0\n  /keep.txt 1\n- /old/\n");
    }

    #[tokio::test]
    async fn test_kind_change_deletes_then_adds() {
        let fake = Arc::new(FakeRemote::new());
        fake.add_file("/d/inner", b"1", ts(5));
        fake.add_file("/f", b"22", ts(5));
        let snap = tempfile::tempdir().unwrap();
        write_local(snap.path(), "d", b"was a file", ts(5));
        fs::create_dir(snap.path().join("f")).unwrap();

        let journal = run_diff(&fake, snap.path(), &["/"]).await.unwrap();
        assert_eq!(
            journal,
            "- /d 0\n+ /d/\n- /f/\n+ /f 2\n+ /d/inner 1\n"
        );
    }

    #[tokio::test]
    async fn test_listing_order_does_not_matter() {
        // The fake lists children in reverse order.
        let fake = Arc::new(FakeRemote::new());
        for name in ["c", "a", "b"] {
            fake.add_file(&format!("/{name}"), b"1", ts(1));
        }
        let snap = tempfile::tempdir().unwrap();
        let journal = run_diff(&fake, snap.path(), &["/"]).await.unwrap();
        assert_eq!(journal, "+ /a 1\n+ /b 1\n+ /c 1\n");
    }

    #[tokio::test]
    async fn test_listing_failure_escalates() {
        let fake = Arc::new(FakeRemote::new());
        fake.add_file("/a/x", b"1", ts(1));
        fake.fail_list("/a", crate::remote::fake::Failure::Server, 10);
        let snap = tempfile::tempdir().unwrap();

        let err = run_diff(&fake, snap.path(), &["/"]).await.unwrap_err();
        assert!(err.is_listing(), "got {err:?}");
    }

    #[tokio::test]
    async fn test_missing_folder_fails_before_walking() {
        let fake = Arc::new(FakeRemote::new());
        let snap = tempfile::tempdir().unwrap();
        let err = run_diff(&fake, snap.path(), &["/Nope"]).await.unwrap_err();
        assert!(err.is_listing());
        assert_eq!(fake.list_calls(), 1);
    }

    #[tokio::test]
    async fn test_configured_folders_prune_other_top_level_entries() {
        let fake = Arc::new(FakeRemote::new());
        fake.add_file("/Photos/p.jpg", b"jpg", ts(1));
        fake.add_file("/Docs/d.txt", b"d", ts(1));
        fake.add_file("/Other/o", b"o", ts(1));
        let snap = tempfile::tempdir().unwrap();
        write_local(snap.path(), "Docs/d.txt", b"d", ts(1));
        write_local(snap.path(), "Unwanted/u", b"u", ts(1));
        write_local(snap.path(), "loose.txt", b"l", ts(1));

        let journal = run_diff(&fake, snap.path(), &["/Photos", "Docs/", "/Docs/sub"])
            .await
            .unwrap();
        assert_eq!(
            journal,
            "- /Unwanted/\n- /loose.txt 0\n  /Docs/d.txt 1\n+ /Photos/\n+ /Photos/p.jpg 3\n"
        );
    }

    #[tokio::test]
    async fn test_cancelled_walk_is_interrupted() {
        let fake = Arc::new(FakeRemote::new());
        fake.add_file("/a", b"1", ts(1));
        let remote = retrying(&fake, 1);
        let listed = list_folders(&remote, &["/".to_string()]).await.unwrap();
        let snap = tempfile::tempdir().unwrap();
        let stats = SessionStats::new();
        let token = CancellationToken::new();
        token.cancel();
        let part = snap.path().join("j.part");
        let mut journal = JournalWriter::create(&part).await.unwrap();
        let err = Differ::new(&remote, snap.path(), DEFAULT_MTIME_TOLERANCE, &stats, &token)
            .compare(listed, &mut journal)
            .await
            .unwrap_err();
        assert!(matches!(err, SnapshotError::Interrupted));
    }

    #[test]
    fn test_effective_folders() {
        let f = |v: &[&str]| effective_folders(&v.iter().map(|s| s.to_string()).collect::<Vec<_>>());
        assert_eq!(f(&[]), vec!["/"]);
        assert_eq!(f(&["/a", "/"]), vec!["/"]);
        assert_eq!(f(&["/b", "a/", "/a/x", "/ab"]), vec!["/a", "/ab", "/b"]);
    }

    #[test]
    fn test_out_of_range_local_mtime_counts_as_changed() {
        let remote = RemoteEntry::file("/f", 1, ts(1));
        let far_future = UNIX_EPOCH
            .checked_add(Duration::from_secs(1 << 45))
            .unwrap();
        let local = LocalEntry {
            is_dir: false,
            size: 1,
            modified: Some(far_future),
        };
        assert!(system_time_to_utc(far_future).is_none());
        assert!(!is_unchanged(&local, &remote, DEFAULT_MTIME_TOLERANCE));
    }

    #[test]
    fn test_system_time_conversion_before_and_after_epoch() {
        let after = UNIX_EPOCH + Duration::from_millis(1_500);
        assert_eq!(
            system_time_to_utc(after).unwrap().timestamp_millis(),
            1_500
        );
        let before = UNIX_EPOCH - Duration::from_millis(1_500);
        assert_eq!(
            system_time_to_utc(before).unwrap().timestamp_millis(),
            -1_500
        );
    }

    #[test]
    fn test_classify_skips_unrepresentable_names() {
        let remote = vec![
            RemoteEntry::file("/bad\nname", 1, ts(1)),
            RemoteEntry::file("/good", 1, ts(1)),
        ];
        let (block, subdirs) =
            classify_directory("/", remote, HashMap::new(), DEFAULT_MTIME_TOLERANCE);
        assert_eq!(block, vec![JournalEntry::file(Action::Add, "/good", 1)]);
        assert!(subdirs.is_empty());
    }
}
