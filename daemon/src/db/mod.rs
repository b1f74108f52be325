//! SQLite persistence for domain records and tracking cursors.

mod schema;

pub use schema::{format_ts, init_db};

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::Error;
use crate::models::{Message, Project, Session, TrackingRecord};
use crate::repository::{
    CursorUpdate, MessageRepository, ProjectRepository, SessionRepository, TrackingStore,
};

/// Database connection wrapper.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create database at path.
    pub fn open(path: &Path) -> Result<Self, Error> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open in-memory database for testing.
    pub fn open_memory() -> Result<Self, Error> {
        let conn = Connection::open_in_memory()?;
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // Every statement runs to completion under the lock, so a poisoned
        // guard still wraps a usable connection.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Row counts for status reporting.
    pub fn stats(&self) -> Result<DatabaseStats, Error> {
        let conn = self.conn();
        let count = |sql: &str| -> Result<usize, Error> {
            Ok(conn.query_row(sql, [], |row| row.get::<_, i64>(0))? as usize)
        };

        Ok(DatabaseStats {
            projects: count("SELECT COUNT(*) FROM projects")?,
            sessions: count("SELECT COUNT(*) FROM sessions")?,
            messages: count("SELECT COUNT(*) FROM messages")?,
            tracked_files: count("SELECT COUNT(*) FROM log_file_tracking WHERE tombstoned = 0")?,
            tombstoned_files: count(
                "SELECT COUNT(*) FROM log_file_tracking WHERE tombstoned = 1",
            )?,
        })
    }
}

/// Row counts across the store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DatabaseStats {
    pub projects: usize,
    pub sessions: usize,
    pub messages: usize,
    pub tracked_files: usize,
    pub tombstoned_files: usize,
}

// ========== Projects ==========

impl ProjectRepository for Database {
    fn upsert_project(&self, project: &Project) -> Result<(), Error> {
        self.conn().execute(
            r#"
            INSERT INTO projects (id, name, path, created_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(id) DO NOTHING
            "#,
            params![
                project.id,
                project.name,
                project.path.to_string_lossy(),
                format_ts(project.created_at),
            ],
        )?;
        Ok(())
    }

    fn get_project(&self, id: &str) -> Result<Option<Project>, Error> {
        let conn = self.conn();
        let project = conn
            .query_row(
                "SELECT * FROM projects WHERE id = ?1",
                [id],
                Project::from_row,
            )
            .optional()?;
        Ok(project)
    }

    fn list_projects(&self) -> Result<Vec<Project>, Error> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT * FROM projects ORDER BY name ASC")?;
        let rows = stmt.query_map([], Project::from_row)?;

        let mut projects = Vec::new();
        for row in rows {
            projects.push(row?);
        }
        Ok(projects)
    }
}

// ========== Sessions ==========

impl SessionRepository for Database {
    fn upsert_session(&self, session: &Session) -> Result<(), Error> {
        self.conn().execute(
            r#"
            INSERT INTO sessions (
                id, project_id, name, cwd, status,
                created_at, updated_at, last_message_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(id) DO UPDATE SET
                cwd = COALESCE(sessions.cwd, excluded.cwd),
                name = CASE WHEN sessions.name = sessions.id
                    THEN excluded.name ELSE sessions.name END
            "#,
            params![
                session.id,
                session.project_id,
                session.name,
                session.cwd,
                session.status,
                format_ts(session.created_at),
                format_ts(session.updated_at),
                session.last_message_at.map(format_ts),
            ],
        )?;
        Ok(())
    }

    fn touch_session(
        &self,
        id: &str,
        at: DateTime<Utc>,
        status: Option<&str>,
    ) -> Result<(), Error> {
        let now = format_ts(Utc::now());
        // SET expressions see the pre-update row, so status is judged against
        // the previous last_message_at.
        self.conn().execute(
            r#"
            UPDATE sessions SET
                status = CASE
                    WHEN ?3 IS NOT NULL AND (last_message_at IS NULL OR last_message_at <= ?2)
                    THEN ?3 ELSE status END,
                last_message_at = CASE
                    WHEN last_message_at IS NULL OR last_message_at < ?2
                    THEN ?2 ELSE last_message_at END,
                updated_at = CASE WHEN updated_at < ?4 THEN ?4 ELSE updated_at END
            WHERE id = ?1
            "#,
            params![id, format_ts(at), status, now],
        )?;
        Ok(())
    }

    fn get_session(&self, id: &str) -> Result<Option<Session>, Error> {
        let conn = self.conn();
        let session = conn
            .query_row(
                "SELECT * FROM sessions WHERE id = ?1",
                [id],
                Session::from_row,
            )
            .optional()?;
        Ok(session)
    }

    fn list_sessions(&self, project_id: &str) -> Result<Vec<Session>, Error> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            r#"
            SELECT * FROM sessions
            WHERE project_id = ?1
            ORDER BY last_message_at DESC
            "#,
        )?;
        let rows = stmt.query_map([project_id], Session::from_row)?;

        let mut sessions = Vec::new();
        for row in rows {
            sessions.push(row?);
        }
        Ok(sessions)
    }
}

// ========== Messages ==========

impl MessageRepository for Database {
    fn upsert_message(&self, message: &Message) -> Result<bool, Error> {
        let inserted = self.conn().execute(
            r#"
            INSERT INTO messages (
                id, session_id, natural_key, seq, role,
                content, timestamp, raw_payload
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT DO NOTHING
            "#,
            params![
                message.id,
                message.session_id,
                message.natural_key,
                message.seq as i64,
                message.role,
                message.content,
                format_ts(message.timestamp),
                message.raw_payload,
            ],
        )?;
        Ok(inserted == 1)
    }

    fn list_messages(&self, session_id: &str) -> Result<Vec<Message>, Error> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            r#"
            SELECT * FROM messages
            WHERE session_id = ?1
            ORDER BY timestamp ASC, seq ASC
            "#,
        )?;
        let rows = stmt.query_map([session_id], Message::from_row)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    fn count_messages(&self, session_id: &str) -> Result<usize, Error> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM messages WHERE session_id = ?1",
            [session_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

// ========== Tracking ==========

impl TrackingStore for Database {
    fn get(&self, file_key: &str) -> Result<Option<TrackingRecord>, Error> {
        let conn = self.conn();
        let record = conn
            .query_row(
                "SELECT * FROM log_file_tracking WHERE file_key = ?1",
                [file_key],
                TrackingRecord::from_row,
            )
            .optional()?;
        Ok(record)
    }

    fn active_record(&self, path: &Path) -> Result<Option<TrackingRecord>, Error> {
        let conn = self.conn();
        let record = conn
            .query_row(
                "SELECT * FROM log_file_tracking WHERE file_path = ?1 AND tombstoned = 0",
                [path.to_string_lossy()],
                TrackingRecord::from_row,
            )
            .optional()?;
        Ok(record)
    }

    fn compare_and_set(&self, update: &CursorUpdate<'_>) -> Result<(), Error> {
        let CursorUpdate {
            file_key,
            path,
            expected,
            new,
            ..
        } = *update;
        let conn = self.conn();
        let read_at = format_ts(update.read_at);

        let conflict = |conn: &Connection| -> Result<Error, Error> {
            let actual = conn
                .query_row(
                    "SELECT cursor FROM log_file_tracking WHERE file_key = ?1",
                    [file_key],
                    |row| row.get::<_, i64>(0),
                )
                .optional()?
                .map(|c| c as u64);
            Ok(Error::TrackingConflict {
                file_key: file_key.to_string(),
                expected,
                actual,
            })
        };

        if new < expected {
            return Err(conflict(&conn)?);
        }

        let changed = conn.execute(
            r#"
            UPDATE log_file_tracking
            SET cursor = ?3, last_updated_at = ?4
            WHERE file_key = ?1 AND cursor = ?2 AND tombstoned = 0
            "#,
            params![file_key, expected as i64, new as i64, read_at],
        )?;
        if changed == 1 {
            return Ok(());
        }

        if expected == 0 {
            // First commit for this identity. Loses to any other live identity
            // for the same path through the partial unique index.
            let inserted = conn.execute(
                r#"
                INSERT OR IGNORE INTO log_file_tracking (
                    file_key, file_path, cursor, first_seen_at, last_updated_at, tombstoned
                ) VALUES (?1, ?2, ?3, ?4, ?5, 0)
                "#,
                params![
                    file_key,
                    path.to_string_lossy(),
                    new as i64,
                    format_ts(update.first_seen_at),
                    read_at
                ],
            )?;
            if inserted == 1 {
                return Ok(());
            }
        }

        Err(conflict(&conn)?)
    }

    fn tombstone(&self, file_key: &str) -> Result<(), Error> {
        let now = format_ts(Utc::now());
        self.conn().execute(
            r#"
            UPDATE log_file_tracking
            SET tombstoned = 1, last_updated_at = ?2
            WHERE file_key = ?1 AND tombstoned = 0
            "#,
            params![file_key, now],
        )?;
        Ok(())
    }

    fn list_records(&self) -> Result<Vec<TrackingRecord>, Error> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT * FROM log_file_tracking ORDER BY file_path ASC")?;
        let rows = stmt.query_map([], TrackingRecord::from_row)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }
}
