//! OS-backed file watcher.
//!
//! Wraps `notify` through `notify-debouncer-mini`. The debouncer reports a
//! path once it has been quiet for the stability threshold but does not say
//! what happened, so events are classified against the set of known paths.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use notify::{RecommendedWatcher, RecursiveMode};
use notify_debouncer_mini::{new_debouncer_opt, DebounceEventResult, Debouncer};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::{deliver, EventHandler, FileEvent, FileEventKind, FileWatcher, PathFilter};
use crate::config::WatcherConfig;
use crate::error::Error;

/// Watches the transcript root for `.jsonl` changes.
#[derive(Default)]
pub struct NotifyWatcher {
    debouncer: Mutex<Option<Debouncer<RecommendedWatcher>>>,
}

impl NotifyWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn debouncer(&self) -> MutexGuard<'_, Option<Debouncer<RecommendedWatcher>>> {
        self.debouncer.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Matching files already present under the root.
fn existing_files(filter: &PathFilter) -> HashSet<PathBuf> {
    WalkDir::new(filter.root())
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file() && filter.matches(e.path()))
        .map(|e| e.into_path())
        .collect()
}

/// Turn a settled path into an add/change/unlink event.
fn classify(known: &mut HashSet<PathBuf>, path: PathBuf) -> Option<FileEvent> {
    if path.exists() {
        let kind = if known.insert(path.clone()) {
            FileEventKind::Add
        } else {
            FileEventKind::Change
        };
        Some(FileEvent::new(kind, path))
    } else if known.remove(&path) {
        Some(FileEvent::new(FileEventKind::Unlink, path))
    } else {
        // Created and removed within one window.
        None
    }
}

impl FileWatcher for NotifyWatcher {
    fn start(&self, config: &WatcherConfig, handler: Arc<dyn EventHandler>) -> Result<(), Error> {
        let mut slot = self.debouncer();
        if slot.is_some() {
            return Err(Error::watcher("already running"));
        }

        let root = &config.target_dir;
        if !root.is_dir() {
            return Err(Error::watcher(format!(
                "watch root {} does not exist",
                root.display()
            )));
        }

        let filter = PathFilter::new(config)?;
        let mut known = existing_files(&filter);

        if config.ignore_initial {
            debug!(files = known.len(), "Ignoring files present at start");
        } else {
            let mut initial: Vec<_> = known.iter().cloned().collect();
            initial.sort();
            for path in initial {
                deliver(handler.as_ref(), FileEvent::new(FileEventKind::Add, path));
            }
        }

        let callback_filter = filter.clone();
        let callback = move |res: DebounceEventResult| match res {
            Ok(events) => {
                for event in events {
                    if !callback_filter.matches(&event.path) {
                        continue;
                    }
                    if let Some(file_event) = classify(&mut known, event.path) {
                        debug!(path = %file_event.path.display(), kind = %file_event.kind, "File event");
                        deliver(handler.as_ref(), file_event);
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "Watch error");
            }
        };

        let debouncer_config = notify_debouncer_mini::Config::default()
            .with_timeout(config.stability_threshold())
            .with_notify_config(notify::Config::default().with_poll_interval(config.poll_interval()));

        let mut debouncer = new_debouncer_opt::<_, RecommendedWatcher>(debouncer_config, callback)?;
        debouncer
            .watcher()
            .watch(root, RecursiveMode::Recursive)
            .map_err(|e| Error::watcher(format!("failed to watch {}: {e}", root.display())))?;

        info!(path = %root.display(), glob = %config.glob, "Watching for transcript changes");
        *slot = Some(debouncer);
        Ok(())
    }

    fn stop(&self) -> Result<(), Error> {
        // Dropped under the lock so a concurrent start() waits for teardown.
        let mut slot = self.debouncer();
        if slot.take().is_some() {
            info!("Stopped watching");
        }
        Ok(())
    }

    fn is_watching(&self) -> bool {
        self.debouncer().is_some()
    }
}
