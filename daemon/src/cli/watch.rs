//! Watch daemon - keeps the database in step with the transcript root.

use std::sync::Arc;

use tokio::sync::watch as signal;
use tracing::{error, info, warn};

use super::{scan, shutdown_signal};
use crate::config::Config;
use crate::context::IngestContext;
use crate::error::Error;
use crate::watcher::{
    BatchProcessor, EventHandler, FileWatcher, Intake, NotifyWatcher, PeriodicReconciler,
};

/// Run `watch` until Ctrl+C.
pub async fn run(config: &Config) -> Result<(), Error> {
    info!("Starting chatlog ingestion");
    info!("Transcripts: {}", config.watcher.target_dir.display());
    info!("Database: {}", config.daemon.db_path.display());

    let (ctx, _db) = IngestContext::open_local(&config.daemon.db_path)?;
    let ctx = Arc::new(ctx);

    if !config.watcher.persistent {
        let summary = scan::ingest_once(ctx, config).await?;
        info!(
            queued = summary.queued,
            inserted = summary.stats.inserted,
            "Non-persistent mode, single pass done"
        );
        return Ok(());
    }

    let (intake, rx) = Intake::channel();
    let intake: Arc<dyn EventHandler> = Arc::new(intake);
    let (shutdown_tx, shutdown_rx) = signal::channel(false);

    let processor = Arc::new(BatchProcessor::new(ctx.clone(), config.ingest.worker_limit));
    let mut processor_handle =
        tokio::spawn(processor.run(rx, shutdown_signal(shutdown_rx.clone())));

    let reconciler = Arc::new(PeriodicReconciler::new(
        ctx,
        &config.watcher,
        config.ingest.reconcile_interval(),
        intake.clone(),
    )?);

    // Startup pass picks up anything written while not running.
    let startup = reconciler.clone();
    match tokio::task::spawn_blocking(move || startup.scan_once()).await {
        Ok(Ok(events)) => info!(events = events.len(), "Startup reconciliation queued"),
        Ok(Err(e)) => warn!(code = %e.code(), error = %e, "Startup reconciliation failed"),
        Err(e) => warn!(error = %e, "Startup reconciliation task failed"),
    }

    let watcher = NotifyWatcher::new();
    if let Err(e) = watcher.start(&config.watcher, intake) {
        error!(code = %e.code(), error = %e, "Cannot start file watcher");
        let _ = shutdown_tx.send(true);
        let _ = processor_handle.await;
        return Err(e);
    }

    let reconciler_handle = tokio::spawn(reconciler.run(shutdown_signal(shutdown_rx)));

    info!("Watching. Press Ctrl+C to stop.");

    let finished = tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res?;
            info!("Shutting down...");
            None
        }
        res = &mut processor_handle => {
            error!("Processor stopped unexpectedly");
            Some(res)
        }
    };

    // New events stop first; in-flight batches are allowed to finish.
    watcher.stop()?;
    let _ = shutdown_tx.send(true);
    if let Err(e) = reconciler_handle.await {
        warn!(error = %e, "Reconciler task failed");
    }

    let result = match finished {
        Some(res) => res,
        None => processor_handle.await,
    };
    match result {
        Ok(stats) => info!(
            batches = stats.batches,
            inserted = stats.inserted,
            discarded = stats.discarded,
            failed = stats.failed,
            "Stopped"
        ),
        Err(e) => error!(error = %e, "Processor task failed"),
    }

    Ok(())
}
