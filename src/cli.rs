use clap::{Args, Parser, Subcommand};

use crate::types::LogLevel;

#[derive(Parser, Debug)]
#[command(
    name = "dsnapshot",
    version,
    about = "Incremental hard-link snapshots of a Dropbox account"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    #[command(flatten)]
    pub global: GlobalArgs,
}

/// Options shared by every command.
#[derive(Args, Debug, Clone, Default)]
pub struct GlobalArgs {
    /// Path to the JSON configuration file
    #[arg(short = 'c', long, global = true, default_value = "~/.dsnapshot/config.json")]
    pub config: String,

    /// Directory holding the snapshots
    #[arg(short = 's', long, global = true)]
    pub snapshot_root: Option<String>,

    /// Remote folder to snapshot (repeatable; default: the whole account)
    #[arg(short = 'f', long = "folder", global = true)]
    pub folders: Vec<String>,

    /// Number of complete snapshots to keep
    #[arg(short = 'r', long, global = true)]
    pub rotations: Option<usize>,

    /// Dropbox access token.
    /// WARNING: passing via --token is visible in process listings.
    /// Prefer the DSNAPSHOT_TOKEN environment variable instead.
    #[arg(long, env = "DSNAPSHOT_TOKEN", global = true, hide_env_values = true)]
    pub token: Option<String>,

    /// Number of concurrent transfers (1 keeps strict smallest-first order)
    #[arg(long, global = true)]
    pub concurrency: Option<usize>,

    /// Maximum attempts per remote call, the first one included
    #[arg(long, global = true)]
    pub max_attempts: Option<u32>,

    /// Base delay in seconds between retries
    #[arg(long, global = true)]
    pub retry_delay: Option<u64>,

    /// Lock file allowing a single running instance
    #[arg(long, global = true, default_value = "~/.dsnapshot/lockfile")]
    pub lockfile: String,

    /// Log level
    #[arg(long, value_enum, default_value = "info", global = true)]
    pub log_level: LogLevel,

    /// Disable progress bar
    #[arg(long, global = true)]
    pub no_progress_bar: bool,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Take a snapshot (default)
    Snapshot(SnapshotArgs),

    /// Show snapshots under the root and any pending job
    Status,

    /// Delete snapshots beyond the retention count
    Rotate,
}

#[derive(Args, Debug, Clone, Default)]
pub struct SnapshotArgs {
    /// Run continuously, waiting N seconds between snapshots
    #[arg(long)]
    pub watch_with_interval: Option<u64>,
}

impl Cli {
    /// The command to run; a bare invocation takes a snapshot.
    pub fn effective_command(&self) -> Command {
        self.command
            .clone()
            .unwrap_or_else(|| Command::Snapshot(SnapshotArgs::default()))
    }
}
