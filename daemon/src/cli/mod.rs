//! CLI commands for chatlog-ingest.

pub mod scan;
pub mod status;
pub mod watch;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use tokio::sync::watch as signal;

use crate::config::Config;
use crate::error::Error;

/// Incremental ingestion of coding-assistant chat transcripts
#[derive(Parser)]
#[command(name = "chatlog-ingest")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Watch the transcript root and ingest changes until Ctrl+C
    Watch(Paths),

    /// Ingest everything under the transcript root once, then exit
    Scan(Paths),

    /// Show what has been ingested
    Status {
        /// SQLite database (defaults to daemon.db_path)
        #[arg(long)]
        db: Option<PathBuf>,
    },
}

/// Overrides for configured locations.
#[derive(Args, Debug, Clone, Default)]
pub struct Paths {
    /// Transcript root (defaults to watcher.target_dir)
    #[arg(long)]
    pub root: Option<PathBuf>,

    /// SQLite database (defaults to daemon.db_path)
    #[arg(long)]
    pub db: Option<PathBuf>,
}

impl Paths {
    /// Apply overrides and resolve the transcript root to an absolute path.
    pub fn apply(&self, mut config: Config) -> Result<Config, Error> {
        if let Some(root) = &self.root {
            config.watcher.target_dir = root.clone();
        }
        if let Some(db) = &self.db {
            config.daemon.db_path = db.clone();
        }

        let root = &config.watcher.target_dir;
        config.watcher.target_dir = root.canonicalize().map_err(|e| Error::FileSystem {
            path: root.clone(),
            message: format!("cannot resolve transcript root: {e}"),
        })?;
        Ok(config)
    }
}

/// Resolves once the flag flips to true or the sender is gone.
pub(crate) async fn shutdown_signal(mut rx: signal::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            break;
        }
    }
}
