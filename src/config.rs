use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use crate::cli::GlobalArgs;
use crate::retry::RetryConfig;
use crate::session::SessionConfig;
use crate::snapshot::differ::DEFAULT_MTIME_TOLERANCE;

const DEFAULT_ROTATIONS: usize = 7;
const DEFAULT_CONCURRENCY: usize = 1;
const MAX_RETRY_DELAY: Duration = Duration::from_secs(300);

/// On-disk configuration file. Every key is optional; unknown keys are an error.
#[derive(Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FileConfig {
    pub snapshot_root: Option<String>,
    pub remote_folders: Option<Vec<String>>,
    pub rotations: Option<usize>,
    pub token: Option<String>,
    pub concurrency: Option<usize>,
    pub max_attempts: Option<u32>,
    pub retry_delay_secs: Option<u64>,
    pub mtime_tolerance_secs: Option<u64>,
}

impl FileConfig {
    /// Read the file at `path`; a missing file is an empty configuration.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No config file at {}", path.display());
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Cannot read config {}", path.display()))
            }
        };
        serde_json::from_str(&raw).with_context(|| format!("Invalid config {}", path.display()))
    }
}

/// Application configuration: file values overridden by environment and CLI.
pub struct Config {
    pub snapshot_root: PathBuf,
    pub remote_folders: Vec<String>,
    pub token: Option<String>,
    pub lockfile: PathBuf,
    pub rotations: usize,
    pub concurrency: usize,
    pub retry: RetryConfig,
    pub mtime_tolerance: Duration,
    pub no_progress_bar: bool,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("snapshot_root", &self.snapshot_root)
            .field("remote_folders", &self.remote_folders)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("rotations", &self.rotations)
            .field("concurrency", &self.concurrency)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

pub(crate) fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

impl Config {
    pub fn load(args: &GlobalArgs) -> anyhow::Result<Self> {
        let file = FileConfig::load(&expand_tilde(&args.config))?;
        Self::from_parts(file, args)
    }

    pub fn from_parts(file: FileConfig, args: &GlobalArgs) -> anyhow::Result<Self> {
        let snapshot_root = args
            .snapshot_root
            .clone()
            .or(file.snapshot_root)
            .map(|p| expand_tilde(&p))
            .context("No snapshot root configured. Use --snapshot-root or set snapshotRoot")?;

        let remote_folders = if !args.folders.is_empty() {
            args.folders.clone()
        } else {
            file.remote_folders.unwrap_or_default()
        };
        let remote_folders = if remote_folders.is_empty() {
            vec!["/".to_string()]
        } else {
            remote_folders
        };

        let rotations = args.rotations.or(file.rotations).unwrap_or(DEFAULT_ROTATIONS);
        if rotations == 0 {
            anyhow::bail!("rotations must be at least 1");
        }
        let concurrency = args
            .concurrency
            .or(file.concurrency)
            .unwrap_or(DEFAULT_CONCURRENCY);
        if concurrency == 0 {
            anyhow::bail!("concurrency must be at least 1");
        }

        let defaults = RetryConfig::default();
        let max_attempts = args
            .max_attempts
            .or(file.max_attempts)
            .unwrap_or(defaults.max_attempts);
        if max_attempts == 0 {
            anyhow::bail!("max attempts must be at least 1");
        }
        let base_delay = args
            .retry_delay
            .or(file.retry_delay_secs)
            .map(Duration::from_secs)
            .unwrap_or(defaults.base_delay);

        let mtime_tolerance = file
            .mtime_tolerance_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_MTIME_TOLERANCE);

        Ok(Self {
            snapshot_root,
            remote_folders,
            token: args.token.clone().or(file.token),
            lockfile: expand_tilde(&args.lockfile),
            rotations,
            concurrency,
            retry: RetryConfig {
                max_attempts,
                base_delay,
                max_delay: MAX_RETRY_DELAY.max(base_delay),
            },
            mtime_tolerance,
            no_progress_bar: args.no_progress_bar,
        })
    }

    pub fn require_token(&self) -> anyhow::Result<&str> {
        self.token.as_deref().filter(|t| !t.is_empty()).context(
            "No Dropbox access token. Set DSNAPSHOT_TOKEN, pass --token, or set token in the config file",
        )
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            snapshot_root: self.snapshot_root.clone(),
            remote_folders: self.remote_folders.clone(),
            rotations: self.rotations,
            concurrency: self.concurrency,
            retry: self.retry,
            mtime_tolerance: self.mtime_tolerance,
            no_progress_bar: self.no_progress_bar,
        }
    }
}
