//! Deterministic watcher driven by the caller.
//!
//! Events are injected with [`MemoryWatcher::emit`] and released by advancing
//! a manual clock, so tests exercise debouncing without timers or disks.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::debug;

use super::debounce::Debouncer;
use super::{deliver, EventHandler, FileEvent, FileEventKind, FileWatcher, PathFilter};
use crate::config::WatcherConfig;
use crate::error::Error;

struct Subscription {
    handler: Arc<dyn EventHandler>,
    filter: PathFilter,
    debouncer: Debouncer,
}

#[derive(Default)]
struct State {
    subscription: Option<Subscription>,
    clock: Duration,
}

#[derive(Default)]
pub struct MemoryWatcher {
    state: Mutex<State>,
}

impl MemoryWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Inject a raw filesystem event. Returns false when it was not accepted
    /// (not watching, or the path does not match the glob).
    pub fn emit(&self, kind: FileEventKind, path: impl Into<PathBuf>) -> bool {
        let path = path.into();
        let mut state = self.state();
        let now = state.clock;
        let Some(sub) = state.subscription.as_mut() else {
            debug!(path = %path.display(), "Not watching, dropping event");
            return false;
        };
        if !sub.filter.matches(&path) {
            return false;
        }
        sub.debouncer.record(path, kind, now);
        true
    }

    /// Move the clock forward and deliver events that have settled.
    pub fn advance(&self, by: Duration) -> usize {
        let (handler, settled) = {
            let mut state = self.state();
            state.clock += by;
            let now = state.clock;
            match state.subscription.as_mut() {
                Some(sub) => (sub.handler.clone(), sub.debouncer.drain_settled(now)),
                None => return 0,
            }
        };
        Self::dispatch(handler.as_ref(), settled)
    }

    /// Deliver everything pending regardless of the stability window.
    pub fn flush(&self) -> usize {
        let (handler, pending) = {
            let mut state = self.state();
            match state.subscription.as_mut() {
                Some(sub) => (sub.handler.clone(), sub.debouncer.drain_all()),
                None => return 0,
            }
        };
        Self::dispatch(handler.as_ref(), pending)
    }

    pub fn pending_count(&self) -> usize {
        self.state()
            .subscription
            .as_ref()
            .map(|s| s.debouncer.pending_count())
            .unwrap_or(0)
    }

    // Handlers run outside the lock so they may call back into the watcher.
    fn dispatch(handler: &dyn EventHandler, events: Vec<(PathBuf, FileEventKind)>) -> usize {
        let count = events.len();
        for (path, kind) in events {
            deliver(handler, FileEvent::new(kind, path));
        }
        count
    }
}

impl FileWatcher for MemoryWatcher {
    fn start(&self, config: &WatcherConfig, handler: Arc<dyn EventHandler>) -> Result<(), Error> {
        let mut state = self.state();
        if state.subscription.is_some() {
            return Err(Error::watcher("already running"));
        }
        state.subscription = Some(Subscription {
            handler,
            filter: PathFilter::new(config)?,
            debouncer: Debouncer::new(config.stability_threshold()),
        });
        Ok(())
    }

    fn stop(&self) -> Result<(), Error> {
        let mut state = self.state();
        if let Some(mut sub) = state.subscription.take() {
            sub.debouncer.clear();
        }
        Ok(())
    }

    fn is_watching(&self) -> bool {
        self.state().subscription.is_some()
    }
}
