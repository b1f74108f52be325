//! Transcript watching, parsing and ingestion.

pub mod debounce;
pub mod file_watcher;
pub mod log_parser;
pub mod memory_watcher;
pub mod processor;
pub mod reconciler;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use globset::GlobMatcher;
use tokio::sync::mpsc;
use tracing::warn;

use crate::config::WatcherConfig;
use crate::error::Error;

pub use file_watcher::NotifyWatcher;
pub use log_parser::{LogEntry, LogParser, ParsedLogFile};
pub use memory_watcher::MemoryWatcher;
pub use processor::{BatchOutcome, BatchProcessor, ProcessorStats};
pub use reconciler::PeriodicReconciler;

/// Kind of filesystem change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileEventKind {
    Add,
    Change,
    Unlink,
}

impl std::fmt::Display for FileEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FileEventKind::Add => write!(f, "add"),
            FileEventKind::Change => write!(f, "change"),
            FileEventKind::Unlink => write!(f, "unlink"),
        }
    }
}

/// A change notification, from the watcher or a reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEvent {
    pub kind: FileEventKind,
    pub path: PathBuf,
    pub timestamp: DateTime<Utc>,
}

impl FileEvent {
    pub fn new(kind: FileEventKind, path: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            path: path.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Receives watcher events.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: FileEvent) -> Result<(), Error>;
}

/// Deliver an event, reporting handler failures instead of propagating them.
pub(crate) fn deliver(handler: &dyn EventHandler, event: FileEvent) {
    let path = event.path.clone();
    let kind = event.kind;
    if let Err(e) = handler.handle(event) {
        warn!(path = %path.display(), %kind, error = %e, "Event handler failed");
    }
}

/// A filesystem subscription.
pub trait FileWatcher: Send + Sync {
    /// Subscribe to changes under `config.target_dir`.
    ///
    /// Fails with a watcher error when a subscription is already active,
    /// leaving that subscription untouched.
    fn start(&self, config: &WatcherConfig, handler: Arc<dyn EventHandler>) -> Result<(), Error>;

    /// Tear down the subscription. A no-op when not watching.
    fn stop(&self) -> Result<(), Error>;

    fn is_watching(&self) -> bool;
}

pub type IntakeReceiver = mpsc::UnboundedReceiver<FileEvent>;

/// Single event intake shared by the watcher and the reconciler.
#[derive(Debug, Clone)]
pub struct Intake {
    tx: mpsc::UnboundedSender<FileEvent>,
}

impl Intake {
    pub fn channel() -> (Self, IntakeReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventHandler for Intake {
    fn handle(&self, event: FileEvent) -> Result<(), Error> {
        self.tx
            .send(event)
            .map_err(|_| Error::watcher("event intake closed"))
    }
}

/// Decides which paths under the watch root are transcripts.
#[derive(Debug, Clone)]
pub struct PathFilter {
    root: PathBuf,
    matcher: GlobMatcher,
}

impl PathFilter {
    pub fn new(config: &WatcherConfig) -> Result<Self, Error> {
        Ok(Self {
            root: config.target_dir.clone(),
            matcher: config.matcher()?,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn matches(&self, path: &Path) -> bool {
        path.strip_prefix(&self.root)
            .map(|rel| self.matcher.is_match(rel))
            .unwrap_or(false)
    }
}
