//! Persistence ports consumed by the batch processor.

use std::path::Path;

use chrono::{DateTime, Utc};

use crate::error::Error;
use crate::models::{Message, Project, Session, TrackingRecord};

pub trait ProjectRepository: Send + Sync {
    /// Insert the project if absent. Existing rows are left untouched.
    fn upsert_project(&self, project: &Project) -> Result<(), Error>;

    fn get_project(&self, id: &str) -> Result<Option<Project>, Error>;

    fn list_projects(&self) -> Result<Vec<Project>, Error>;
}

pub trait SessionRepository: Send + Sync {
    /// Insert the session if absent, filling a missing `cwd` on an existing row.
    fn upsert_session(&self, session: &Session) -> Result<(), Error>;

    /// Advance activity timestamps. Never moves them backwards.
    fn touch_session(
        &self,
        id: &str,
        at: DateTime<Utc>,
        status: Option<&str>,
    ) -> Result<(), Error>;

    fn get_session(&self, id: &str) -> Result<Option<Session>, Error>;

    fn list_sessions(&self, project_id: &str) -> Result<Vec<Session>, Error>;
}

pub trait MessageRepository: Send + Sync {
    /// Insert by natural key. Returns false when the message already existed.
    fn upsert_message(&self, message: &Message) -> Result<bool, Error>;

    /// Messages for a session, ordered by timestamp then line.
    fn list_messages(&self, session_id: &str) -> Result<Vec<Message>, Error>;

    fn count_messages(&self, session_id: &str) -> Result<usize, Error>;
}

/// A cursor move for one file identity.
#[derive(Debug, Clone, Copy)]
pub struct CursorUpdate<'a> {
    pub file_key: &'a str,
    pub path: &'a Path,
    pub expected: u64,
    pub new: u64,
    /// Stored when the commit creates the record.
    pub first_seen_at: DateTime<Utc>,
    /// Taken before the content behind `new` was read; becomes
    /// `last_updated_at`, so later writes compare as newer.
    pub read_at: DateTime<Utc>,
}

impl<'a> CursorUpdate<'a> {
    /// Update stamped with the current time.
    pub fn new(file_key: &'a str, path: &'a Path, expected: u64, new: u64) -> Self {
        let now = Utc::now();
        Self {
            file_key,
            path,
            expected,
            new,
            first_seen_at: now,
            read_at: now,
        }
    }
}

/// Durable per-file ingestion cursor.
pub trait TrackingStore: Send + Sync {
    fn get(&self, file_key: &str) -> Result<Option<TrackingRecord>, Error>;

    /// The live (non-tombstoned) record for a path, if any.
    fn active_record(&self, path: &Path) -> Result<Option<TrackingRecord>, Error>;

    /// Move the cursor from `expected` to `new` and stamp `read_at`.
    ///
    /// A missing record counts as cursor 0 and is created. Fails with
    /// [`Error::TrackingConflict`] when the stored cursor differs from
    /// `expected`, the record is tombstoned, or `new < expected`.
    /// `new == expected` only refreshes `last_updated_at`.
    fn compare_and_set(&self, update: &CursorUpdate<'_>) -> Result<(), Error>;

    /// Exclude a record from future processing. Idempotent.
    fn tombstone(&self, file_key: &str) -> Result<(), Error>;

    fn list_records(&self) -> Result<Vec<TrackingRecord>, Error>;
}
