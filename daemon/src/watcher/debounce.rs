//! Stability-window coalescing of file events.
//!
//! A path is reported once it has been quiet for the threshold. The clock is
//! supplied by the caller, which keeps this usable with a manual clock.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use super::FileEventKind;

#[derive(Debug, Clone, Copy)]
struct Pending {
    kind: FileEventKind,
    last_seen: Duration,
}

#[derive(Debug)]
pub struct Debouncer {
    threshold: Duration,
    pending: HashMap<PathBuf, Pending>,
}

impl Debouncer {
    pub fn new(threshold: Duration) -> Self {
        Self {
            threshold,
            pending: HashMap::new(),
        }
    }

    /// Record an event observed at `now`.
    pub fn record(&mut self, path: PathBuf, kind: FileEventKind, now: Duration) {
        let merged = match self.pending.get(&path) {
            // A file created and then written is still new.
            Some(prev) if prev.kind == FileEventKind::Add && kind == FileEventKind::Change => {
                FileEventKind::Add
            }
            _ => kind,
        };
        self.pending.insert(
            path,
            Pending {
                kind: merged,
                last_seen: now,
            },
        );
    }

    /// Remove and return paths quiet for at least the threshold, sorted by path.
    pub fn drain_settled(&mut self, now: Duration) -> Vec<(PathBuf, FileEventKind)> {
        let threshold = self.threshold;
        let settled: Vec<PathBuf> = self
            .pending
            .iter()
            .filter(|(_, p)| now.saturating_sub(p.last_seen) >= threshold)
            .map(|(path, _)| path.clone())
            .collect();

        let mut out: Vec<_> = settled
            .into_iter()
            .filter_map(|path| self.pending.remove(&path).map(|p| (path, p.kind)))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Remove and return everything pending.
    pub fn drain_all(&mut self) -> Vec<(PathBuf, FileEventKind)> {
        let mut out: Vec<_> = self.pending.drain().map(|(path, p)| (path, p.kind)).collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}
