//! chatlog-ingest - incremental ingestion of coding-assistant chat transcripts.

use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use chatlog_ingest::cli::{self, Cli, Commands};
use chatlog_ingest::config::Config;
use chatlog_ingest::Error;

#[tokio::main]
async fn main() -> Result<(), Error> {
    let cli = Cli::parse();
    let config = Config::load()?;

    // RUST_LOG wins over the configured level
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(format!("chatlog_ingest={}", config.daemon.log_level))
            .map_err(|e| Error::Config(format!("invalid daemon.log_level: {e}")))?,
    };
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    match cli.command {
        Commands::Watch(paths) => {
            let config = paths.apply(config)?;
            cli::watch::run(&config).await?;
        }
        Commands::Scan(paths) => {
            let config = paths.apply(config)?;
            cli::scan::run(&config).await?;
        }
        Commands::Status { db } => {
            let db_path = db.unwrap_or(config.daemon.db_path);
            cli::status::run(&db_path)?;
        }
    }

    Ok(())
}
