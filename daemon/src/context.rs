//! Dependencies shared by every pipeline operation.
//!
//! Built once at startup and passed explicitly; tests build isolated
//! instances over [`MemoryFs`](crate::fs::MemoryFs) and an in-memory database.

use std::path::Path;
use std::sync::Arc;

use crate::db::Database;
use crate::error::Error;
use crate::fs::{DirectoryLister, FileReader, LocalFs};
use crate::repository::{MessageRepository, ProjectRepository, SessionRepository, TrackingStore};
use crate::watcher::LogParser;

#[derive(Clone)]
pub struct IngestContext {
    pub reader: Arc<dyn FileReader>,
    pub lister: Arc<dyn DirectoryLister>,
    pub parser: LogParser,
    pub tracking: Arc<dyn TrackingStore>,
    pub projects: Arc<dyn ProjectRepository>,
    pub sessions: Arc<dyn SessionRepository>,
    pub messages: Arc<dyn MessageRepository>,
}

impl IngestContext {
    /// Wire every port to one filesystem and one store.
    pub fn new<F, S>(fs: Arc<F>, store: Arc<S>) -> Self
    where
        F: FileReader + DirectoryLister + 'static,
        S: TrackingStore + ProjectRepository + SessionRepository + MessageRepository + 'static,
    {
        let reader: Arc<dyn FileReader> = fs.clone();
        Self {
            parser: LogParser::new(reader.clone()),
            reader,
            lister: fs,
            tracking: store.clone(),
            projects: store.clone(),
            sessions: store.clone(),
            messages: store,
        }
    }

    /// Real disk and a SQLite database at `db_path`.
    pub fn open_local(db_path: &Path) -> Result<(Self, Arc<Database>), Error> {
        let db = Arc::new(Database::open(db_path)?);
        Ok((Self::new(Arc::new(LocalFs), db.clone()), db))
    }

    /// Replace the tracking store.
    pub fn with_tracking(mut self, tracking: Arc<dyn TrackingStore>) -> Self {
        self.tracking = tracking;
        self
    }
}
