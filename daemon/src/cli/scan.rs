//! One-shot ingestion of the whole transcript root.

use std::sync::Arc;

use tracing::info;

use crate::config::Config;
use crate::context::IngestContext;
use crate::error::Error;
use crate::watcher::{BatchProcessor, Intake, PeriodicReconciler, ProcessorStats};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanSummary {
    /// Events produced by the reconciliation pass.
    pub queued: usize,
    pub stats: ProcessorStats,
}

/// Run `scan`.
pub async fn run(config: &Config) -> Result<(), Error> {
    let (ctx, _db) = IngestContext::open_local(&config.daemon.db_path)?;
    let summary = ingest_once(Arc::new(ctx), config).await?;

    println!("Scanned {}", config.watcher.target_dir.display());
    println!("  Files queued:      {}", summary.queued);
    println!("  Batches:           {}", summary.stats.batches);
    println!("  Messages inserted: {}", summary.stats.inserted);
    if summary.stats.failed > 0 {
        println!("  Failed:            {} (see log)", summary.stats.failed);
    }
    Ok(())
}

/// Reconcile once and process every resulting event to completion.
pub async fn ingest_once(ctx: Arc<IngestContext>, config: &Config) -> Result<ScanSummary, Error> {
    let (intake, rx) = Intake::channel();
    let reconciler = Arc::new(PeriodicReconciler::new(
        ctx.clone(),
        &config.watcher,
        config.ingest.reconcile_interval(),
        Arc::new(intake),
    )?);

    let events = tokio::task::spawn_blocking(move || reconciler.scan_once())
        .await
        .map_err(|e| Error::watcher(format!("scan task failed: {e}")))??;
    info!(events = events.len(), "Reconciliation pass complete");

    // The reconciler and its intake are gone, so the processor drains and stops.
    let processor = Arc::new(BatchProcessor::new(ctx, config.ingest.worker_limit));
    let stats = processor.run(rx, std::future::pending()).await;

    Ok(ScanSummary {
        queued: events.len(),
        stats,
    })
}
