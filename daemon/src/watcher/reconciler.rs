//! Periodic full scan that recovers events the watcher missed.
//!
//! Compares the transcript tree with the tracking store and feeds the same
//! intake as the watcher: files that are untracked or modified since their
//! last commit become change events, tracked files that disappeared become
//! unlink events.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::{EventHandler, FileEvent, FileEventKind, PathFilter};
use crate::config::WatcherConfig;
use crate::context::IngestContext;
use crate::error::Error;
use crate::fs::ListOptions;
use crate::models::TrackingRecord;

pub struct PeriodicReconciler {
    ctx: Arc<IngestContext>,
    filter: PathFilter,
    interval: Duration,
    intake: Arc<dyn EventHandler>,
}

impl PeriodicReconciler {
    pub fn new(
        ctx: Arc<IngestContext>,
        config: &WatcherConfig,
        interval: Duration,
        intake: Arc<dyn EventHandler>,
    ) -> Result<Self, Error> {
        Ok(Self {
            ctx,
            filter: PathFilter::new(config)?,
            interval,
            intake,
        })
    }

    /// Scan the root once and hand every stale path to the intake.
    /// Returns the events emitted, sorted by path.
    pub fn scan_once(&self) -> Result<Vec<FileEvent>, Error> {
        let root = self.filter.root();
        let listing = self
            .ctx
            .lister
            .read_directory(root, ListOptions { recursive: true })?;
        let records = self.ctx.tracking.list_records()?;
        let active: HashMap<&Path, &TrackingRecord> = records
            .iter()
            .filter(|r| !r.tombstoned)
            .map(|r| (r.file_path.as_path(), r))
            .collect();

        let mut present = HashSet::new();
        let mut events = Vec::new();

        for entry in listing
            .iter()
            .filter(|e| e.is_file && self.filter.matches(&e.path))
        {
            present.insert(entry.path.as_path());
            let stale = match active.get(entry.path.as_path()) {
                None => true,
                Some(record) => entry.modified > record.last_updated_at,
            };
            if stale {
                events.push(FileEvent::new(FileEventKind::Change, entry.path.clone()));
            }
        }

        for path in active.keys() {
            if self.filter.matches(path) && !present.contains(path) {
                events.push(FileEvent::new(FileEventKind::Unlink, *path));
            }
        }

        events.sort_by(|a, b| a.path.cmp(&b.path));
        for event in &events {
            debug!(path = %event.path.display(), kind = %event.kind, "Reconcile event");
            self.intake.handle(event.clone())?;
        }

        Ok(events)
    }

    /// Scan every interval until `shutdown` resolves. The first scan runs one
    /// interval after start; failed scans are logged and retried next tick.
    pub async fn run(self: Arc<Self>, shutdown: impl Future<Output = ()>) {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let this = Arc::clone(&self);
                    match tokio::task::spawn_blocking(move || this.scan_once()).await {
                        Ok(Ok(events)) if !events.is_empty() => {
                            info!(events = events.len(), "Reconciliation found missed changes");
                        }
                        Ok(Ok(_)) => debug!("Reconciliation found nothing"),
                        Ok(Err(e)) => {
                            warn!(code = %e.code(), error = %e, "Reconciliation scan failed");
                        }
                        Err(e) => warn!(error = %e, "Reconciliation task failed"),
                    }
                }
                _ = &mut shutdown => {
                    debug!("Reconciler stopping");
                    break;
                }
            }
        }
    }
}
