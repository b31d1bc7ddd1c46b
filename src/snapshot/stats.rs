use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use indicatif::HumanBytes;

/// Counters shared by the differ, the materializer and its transfer workers.
///
/// Relaxed ordering is enough: the values are only read for reporting after
/// the workers that update them have been joined.
#[derive(Debug, Default)]
pub struct SessionStats {
    scanned: AtomicU64,
    updated: AtomicU64,
    failed: AtomicU64,
    downloaded_bytes: AtomicU64,
}

impl SessionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_scanned(&self, n: u64) {
        self.scanned.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_updated(&self, n: u64) {
        self.updated.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_failed(&self, n: u64) {
        self.failed.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_downloaded(&self, bytes: u64) {
        self.downloaded_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSummary {
        StatsSummary {
            scanned: self.scanned.load(Ordering::Relaxed),
            updated: self.updated.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            downloaded_bytes: self.downloaded_bytes.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSummary {
    pub scanned: u64,
    pub updated: u64,
    pub failed: u64,
    pub downloaded_bytes: u64,
}

impl StatsSummary {
    pub fn log(&self, elapsed: Duration) {
        tracing::info!("── Summary ──");
        tracing::info!("  {} entries scanned", self.scanned);
        tracing::info!("  {} entries updated", self.updated);
        if self.failed > 0 {
            tracing::warn!("  {} entries failed", self.failed);
        }
        tracing::info!("  {} downloaded", HumanBytes(self.downloaded_bytes));
        tracing::info!("  elapsed: {}", format_duration(elapsed));
    }
}

pub fn format_duration(d: Duration) -> String {
    let total_secs = d.as_secs();
    let hours = total_secs / 3600;
    let mins = (total_secs % 3600) / 60;
    let secs = total_secs % 60;

    if hours > 0 {
        format!("{}h {:02}m {:02}s", hours, mins, secs)
    } else if mins > 0 {
        format!("{}m {:02}s", mins, secs)
    } else {
        format!("{}s", secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(0)), "0s");
        assert_eq!(format_duration(Duration::from_secs(61)), "1m 01s");
        assert_eq!(format_duration(Duration::from_secs(3723)), "1h 02m 03s");
    }

    #[test]
    fn test_counters_accumulate() {
        let stats = SessionStats::new();
        stats.add_scanned(3);
        stats.add_scanned(2);
        stats.add_updated(1);
        stats.add_failed(1);
        stats.add_downloaded(1024);
        assert_eq!(
            stats.snapshot(),
            StatsSummary {
                scanned: 5,
                updated: 1,
                failed: 1,
                downloaded_bytes: 1024,
            }
        );
    }
}
