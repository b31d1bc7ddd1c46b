//! dsnapshot: rsnapshot-style incremental snapshots of a Dropbox account.
//!
//! Each run lists the remote tree one directory at a time, diffs it against
//! a hard-link clone of the previous snapshot, records the differences in a
//! journal, and downloads only what changed. Interrupted runs resume from
//! the journal. Old snapshots are rotated out once a new one completes.

#![warn(clippy::all)]

mod cli;
mod config;
mod lock;
mod remote;
pub mod retry;
mod session;
mod shutdown;
mod snapshot;
mod types;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::{Command, GlobalArgs, SnapshotArgs};
use config::Config;
use remote::dropbox::DropboxClient;
use remote::RemoteStore;
use session::{JournalState, Session};
use snapshot::{SnapshotError, SnapshotRoot};

const HTTP_TIMEOUT: Duration = Duration::from_secs(60);

/// Run the snapshot command, once or on an interval.
async fn run_snapshot(global: &GlobalArgs, args: SnapshotArgs) -> anyhow::Result<()> {
    let config = Config::load(global)?;
    tracing::debug!(?config, "Loaded configuration");
    let token = config.require_token()?;

    let _lock = lock::InstanceLock::acquire(&config.lockfile).await?;
    let shutdown_token = shutdown::install_signal_handler()?;

    let client = DropboxClient::new(token, HTTP_TIMEOUT)?;
    let account = client
        .current_account()
        .await
        .context("Failed to look up the Dropbox account")?;
    tracing::info!(
        "Logged in as {} <{}>",
        account.name.display_name,
        account.email
    );

    let store: Arc<dyn RemoteStore> = Arc::new(client);
    let pacer = Arc::new(retry::Pacer::default());
    tracing::info!(
        concurrency = config.concurrency,
        folders = ?config.remote_folders,
        "Snapshotting into {}",
        config.snapshot_root.display()
    );

    loop {
        if shutdown_token.is_cancelled() {
            tracing::info!("Shutdown requested, exiting...");
            break;
        }

        let mut session = Session::new(
            config.session_config(),
            store.clone(),
            pacer.clone(),
            shutdown_token.clone(),
        );
        match session.run().await {
            Ok(report) => {
                if report.resumed {
                    tracing::info!(
                        "Finished interrupted snapshot {} ({} files transferred)",
                        report.name,
                        report.apply.transferred
                    );
                }
                if report.apply.failed > 0 {
                    tracing::warn!(
                        "{} entries could not be applied to {}",
                        report.apply.failed,
                        report.snapshot.display()
                    );
                }
                tracing::debug!(
                    scanned = report.stats.scanned,
                    downloaded_bytes = report.stats.downloaded_bytes,
                    "Session counters"
                );
                for removed in &report.rotated {
                    tracing::debug!("Rotated out {}", removed.display());
                }
            }
            Err(SnapshotError::Interrupted) => break,
            Err(e) if e.is_listing() => {
                return Err(anyhow::Error::new(e).context("Remote listing failed"));
            }
            Err(e) => return Err(e.into()),
        }

        let Some(interval) = args.watch_with_interval else {
            break;
        };
        tracing::info!("Waiting {} seconds...", interval);
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(interval)) => {}
            _ = shutdown_token.cancelled() => {
                tracing::info!("Shutdown during wait, exiting...");
                break;
            }
        }
    }

    Ok(())
}

/// Run the status command.
async fn run_status(global: &GlobalArgs) -> anyhow::Result<()> {
    let config = Config::load(global)?;
    let root = SnapshotRoot::new(&config.snapshot_root);
    let snapshots = session::inspect(&root).await?;

    println!("Snapshot root: {}", root.path().display());
    println!("Retention:     {} snapshots", config.rotations);
    println!();

    if snapshots.is_empty() {
        println!("No snapshots yet.");
        return Ok(());
    }

    println!("Snapshots:");
    for s in &snapshots {
        let journal = match s.journal {
            JournalState::Sealed => "journal",
            JournalState::Partial => "partial journal",
            JournalState::Missing => "no journal",
        };
        println!("  {}  {:<10}  {}", s.name, s.state.as_str(), journal);
    }

    for s in &snapshots {
        if let Some(pending) = &s.pending {
            println!();
            println!("Pending job {} ({} changes):", s.name, pending.changes());
            println!("  Add:       {}", pending.added);
            println!("  Update:    {}", pending.updated);
            println!("  Delete:    {}", pending.deleted);
            println!("  Unchanged: {}", pending.unchanged);
            println!(
                "  Transfers: {}",
                indicatif::HumanBytes(pending.transfer_bytes)
            );
        }
    }

    Ok(())
}

/// Run the rotate command.
async fn run_rotate(global: &GlobalArgs) -> anyhow::Result<()> {
    let config = Config::load(global)?;
    let _lock = lock::InstanceLock::acquire(&config.lockfile).await?;
    let root = SnapshotRoot::new(&config.snapshot_root);
    let removed = snapshot::retention::rotate(&root, config.rotations).await?;
    tracing::info!(
        "Removed {} snapshots, keeping {}",
        removed.len(),
        config.rotations
    );
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cli.global.log_level.as_filter())),
        )
        .init();

    match cli.effective_command() {
        Command::Snapshot(args) => run_snapshot(&cli.global, args).await,
        Command::Status => run_status(&cli.global).await,
        Command::Rotate => run_rotate(&cli.global).await,
    }
}
