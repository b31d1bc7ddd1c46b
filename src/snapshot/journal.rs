//! Append-only action ledger written by the differ and replayed by the
//! materializer.
//!
//! One entry per line: `<code> <path>[ <size>]`. Directories carry a trailing
//! `/` and no size. A final line without a newline is a torn write and makes
//! the whole journal unreadable.

use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;

use super::error::SnapshotError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Action {
    Unchanged,
    Add,
    Update,
    Delete,
}

impl Action {
    pub fn code(&self) -> char {
        match self {
            Action::Unchanged => ' ',
            Action::Add => '+',
            Action::Update => 'u',
            Action::Delete => '-',
        }
    }

    pub fn from_code(c: char) -> Option<Self> {
        match c {
            ' ' => Some(Action::Unchanged),
            '+' => Some(Action::Add),
            'u' => Some(Action::Update),
            '-' => Some(Action::Delete),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    pub action: Action,
    /// Normalized remote path, without a trailing slash.
    pub path: String,
    pub size: u64,
    pub is_dir: bool,
}

impl JournalEntry {
    pub fn file(action: Action, path: impl Into<String>, size: u64) -> Self {
        Self {
            action,
            path: path.into(),
            size,
            is_dir: false,
        }
    }

    pub fn dir(action: Action, path: impl Into<String>) -> Self {
        Self {
            action,
            path: path.into(),
            size: 0,
            is_dir: true,
        }
    }

    /// Needs a body from the remote.
    pub fn is_transfer(&self) -> bool {
        !self.is_dir && matches!(self.action, Action::Add | Action::Update)
    }

    pub fn to_line(&self) -> String {
        if self.is_dir {
            let path = if self.path == "/" { "" } else { self.path.as_str() };
            format!("{} {}/", self.action.code(), path)
        } else {
            format!("{} {} {}", self.action.code(), self.path, self.size)
        }
    }

    pub fn parse_line(line: &str) -> Result<Self, String> {
        let mut chars = line.chars();
        let code = chars.next().ok_or("empty line")?;
        let action = Action::from_code(code).ok_or_else(|| format!("unknown action {code:?}"))?;
        let rest = chars
            .as_str()
            .strip_prefix(' ')
            .ok_or("missing separator after action")?;

        if !rest.starts_with('/') {
            return Err(format!("path {rest:?} is not absolute"));
        }

        if let Some(dir) = rest.strip_suffix('/') {
            let path = if dir.is_empty() { "/" } else { dir };
            return Ok(Self::dir(action, path));
        }

        let (path, size) = rest.rsplit_once(' ').ok_or("file entry without size")?;
        let size = size
            .parse::<u64>()
            .map_err(|_| format!("invalid size {size:?}"))?;
        if path.is_empty() {
            return Err("empty path".into());
        }
        Ok(Self::file(action, path, size))
    }
}

/// Writes a journal to its `.part` path block by block.
pub struct JournalWriter {
    file: tokio::fs::File,
    path: PathBuf,
    lines: u64,
}

impl JournalWriter {
    /// Start a fresh journal, truncating any leftover partial one.
    pub async fn create(path: &Path) -> Result<Self, SnapshotError> {
        let file = tokio::fs::File::create(path)
            .await
            .map_err(|e| SnapshotError::io(path, e))?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
            lines: 0,
        })
    }

    /// Append one directory's entries and make them durable before returning.
    pub async fn append_block(&mut self, entries: &[JournalEntry]) -> Result<(), SnapshotError> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut buf = String::new();
        for entry in entries {
            buf.push_str(&entry.to_line());
            buf.push('\n');
        }
        self.file
            .write_all(buf.as_bytes())
            .await
            .map_err(|e| SnapshotError::io(&self.path, e))?;
        self.file
            .flush()
            .await
            .map_err(|e| SnapshotError::io(&self.path, e))?;
        self.file
            .sync_data()
            .await
            .map_err(|e| SnapshotError::io(&self.path, e))?;
        self.lines += entries.len() as u64;
        Ok(())
    }

    pub fn lines(&self) -> u64 {
        self.lines
    }

    /// Seal the journal by renaming it to its final path.
    pub async fn finish(mut self, final_path: &Path) -> Result<(), SnapshotError> {
        self.file
            .flush()
            .await
            .map_err(|e| SnapshotError::io(&self.path, e))?;
        self.file
            .sync_all()
            .await
            .map_err(|e| SnapshotError::io(&self.path, e))?;
        drop(self.file);
        tokio::fs::rename(&self.path, final_path)
            .await
            .map_err(|e| SnapshotError::io(final_path, e))?;
        tracing::debug!(
            lines = self.lines,
            path = %final_path.display(),
            "Journal sealed"
        );
        Ok(())
    }
}

/// Read and validate a whole journal.
pub async fn read_journal(path: &Path) -> Result<Vec<JournalEntry>, SnapshotError> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| SnapshotError::io(path, e))?;
    parse_journal(path, &bytes)
}

fn parse_journal(path: &Path, bytes: &[u8]) -> Result<Vec<JournalEntry>, SnapshotError> {
    let corrupt = |line: usize, reason: String| SnapshotError::JournalCorrupt {
        path: path.to_path_buf(),
        line,
        reason,
    };

    let text = std::str::from_utf8(bytes)
        .map_err(|e| corrupt(0, format!("not valid UTF-8: {e}")))?;
    if text.is_empty() {
        return Ok(Vec::new());
    }
    let Some(body) = text.strip_suffix('\n') else {
        let line = text.lines().count();
        return Err(corrupt(line, "torn final line".into()));
    };

    body.split('\n')
        .enumerate()
        .map(|(i, line)| JournalEntry::parse_line(line).map_err(|reason| corrupt(i + 1, reason)))
        .collect()
}

/// Per-action totals for reporting on a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JournalSummary {
    pub unchanged: u64,
    pub added: u64,
    pub updated: u64,
    pub deleted: u64,
    /// Declared bytes of every entry that needs a transfer.
    pub transfer_bytes: u64,
}

impl JournalSummary {
    pub fn from_entries(entries: &[JournalEntry]) -> Self {
        let mut summary = Self::default();
        for entry in entries {
            summary.record(entry);
        }
        summary
    }

    pub fn record(&mut self, entry: &JournalEntry) {
        match entry.action {
            Action::Unchanged => self.unchanged += 1,
            Action::Add => self.added += 1,
            Action::Update => self.updated += 1,
            Action::Delete => self.deleted += 1,
        }
        if entry.is_transfer() {
            self.transfer_bytes += entry.size;
        }
    }

    pub fn changes(&self) -> u64 {
        self.added + self.updated + self.deleted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_format() {
        assert_eq!(JournalEntry::dir(Action::Add, "/a").to_line(), "+ /a/");
        assert_eq!(
            JournalEntry::file(Action::Add, "/a/x.txt", 10).to_line(),
            "+ /a/x.txt 10"
        );
        assert_eq!(
            JournalEntry::file(Action::Delete, "/b.txt", 0).to_line(),
            "- /b.txt 0"
        );
        assert_eq!(
            JournalEntry::file(Action::Unchanged, "/c", 3).to_line(),
            "  /c 3"
        );
        assert_eq!(
            JournalEntry::file(Action::Update, "/d", 4).to_line(),
            "u /d 4"
        );
    }

    #[test]
    fn test_parse_paths_with_spaces() {
        let e = JournalEntry::parse_line("u /My Docs/report final.pdf 1234").unwrap();
        assert_eq!(e, JournalEntry::file(Action::Update, "/My Docs/report final.pdf", 1234));

        let e = JournalEntry::parse_line("- /Old Stuff/").unwrap();
        assert_eq!(e, JournalEntry::dir(Action::Delete, "/Old Stuff"));

        let e = JournalEntry::parse_line("  /same 7").unwrap();
        assert_eq!(e.action, Action::Unchanged);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for bad in [
            "",
            "x /a 1",
            "+/a 1",
            "+ a 1",
            "+ /a",
            "+ /a notanumber",
            "+ /a -1",
        ] {
            assert!(JournalEntry::parse_line(bad).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn test_torn_final_line_is_corrupt() {
        let err = parse_journal(Path::new("j"), b"+ /a/\n+ /a/x.txt 1").unwrap_err();
        match err {
            SnapshotError::JournalCorrupt { line, reason, .. } => {
                assert_eq!(line, 2);
                assert!(reason.contains("torn"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_bad_line_reports_line_number() {
        let err = parse_journal(Path::new("j"), b"+ /a/\n? /b 1\n").unwrap_err();
        assert!(matches!(err, SnapshotError::JournalCorrupt { line: 2, .. }));
    }

    #[test]
    fn test_empty_journal_is_valid() {
        assert!(parse_journal(Path::new("j"), b"").unwrap().is_empty());
    }

    #[test]
    fn test_summary_counts() {
        let entries = vec![
            JournalEntry::dir(Action::Add, "/a"),
            JournalEntry::file(Action::Add, "/a/x", 10),
            JournalEntry::file(Action::Update, "/y", 5),
            JournalEntry::file(Action::Delete, "/z", 0),
            JournalEntry::file(Action::Unchanged, "/w", 99),
        ];
        let s = JournalSummary::from_entries(&entries);
        assert_eq!(s.added, 2);
        assert_eq!(s.updated, 1);
        assert_eq!(s.deleted, 1);
        assert_eq!(s.unchanged, 1);
        assert_eq!(s.transfer_bytes, 15);
        assert_eq!(s.changes(), 4);
    }

    #[tokio::test]
    async fn test_writer_blocks_then_seal() {
        let tmp = tempfile::tempdir().unwrap();
        let part = tmp.path().join("s.journal.part");
        let fin = tmp.path().join("s.journal");

        let mut w = JournalWriter::create(&part).await.unwrap();
        w.append_block(&[JournalEntry::dir(Action::Add, "/a")])
            .await
            .unwrap();
        w.append_block(&[
            JournalEntry::file(Action::Add, "/a/x.txt", 10),
            JournalEntry::file(Action::Add, "/a/y.txt", 20),
        ])
        .await
        .unwrap();
        // Blocks are durable before sealing.
        assert_eq!(
            std::fs::read_to_string(&part).unwrap(),
            "+ /a/\n+ /a/x.txt 10\n+ /a/y.txt 20\n"
        );
        assert_eq!(w.lines(), 3);

        w.finish(&fin).await.unwrap();
        assert!(!part.exists());
        let entries = read_journal(&fin).await.unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0], JournalEntry::dir(Action::Add, "/a"));
        assert_eq!(entries[2], JournalEntry::file(Action::Add, "/a/y.txt", 20));
    }
}
