//! Database schema definitions.

use std::path::PathBuf;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, Result, Row};

use crate::error::Error;
use crate::models::{Message, Project, Session, TrackingRecord};

/// Initialize database with all tables.
pub fn init_db(conn: &Connection) -> Result<(), Error> {
    // Off by default in SQLite, and per connection.
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;

    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS projects (
            id          TEXT PRIMARY KEY,
            name        TEXT NOT NULL UNIQUE,
            path        TEXT NOT NULL,
            created_at  TEXT NOT NULL
        );
        "#,
    )?;

    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS sessions (
            id               TEXT PRIMARY KEY,
            project_id       TEXT NOT NULL,
            name             TEXT NOT NULL,
            cwd              TEXT,
            status           TEXT,
            created_at       TEXT NOT NULL,
            updated_at       TEXT NOT NULL,
            last_message_at  TEXT,
            FOREIGN KEY (project_id) REFERENCES projects(id)
        );

        CREATE INDEX IF NOT EXISTS idx_sessions_project ON sessions(project_id);
        "#,
    )?;

    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS messages (
            id           TEXT PRIMARY KEY,
            session_id   TEXT NOT NULL,
            natural_key  TEXT NOT NULL,
            seq          INTEGER NOT NULL,
            role         TEXT NOT NULL,
            content      TEXT NOT NULL,
            timestamp    TEXT NOT NULL,
            raw_payload  TEXT NOT NULL,
            UNIQUE (session_id, natural_key),
            FOREIGN KEY (session_id) REFERENCES sessions(id)
        );

        CREATE INDEX IF NOT EXISTS idx_messages_session_ts ON messages(session_id, timestamp, seq);
        "#,
    )?;

    // One live cursor per path; tombstoned identities are kept for history.
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS log_file_tracking (
            file_key         TEXT PRIMARY KEY,
            file_path        TEXT NOT NULL,
            cursor           INTEGER NOT NULL DEFAULT 0,
            first_seen_at    TEXT NOT NULL,
            last_updated_at  TEXT NOT NULL,
            tombstoned       INTEGER NOT NULL DEFAULT 0
        );

        CREATE UNIQUE INDEX IF NOT EXISTS idx_tracking_active_path
            ON log_file_tracking(file_path) WHERE tombstoned = 0;
        "#,
    )?;

    Ok(())
}

/// Fixed-width UTC timestamp, so text comparison in SQL orders correctly.
pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn ts_column(row: &Row<'_>, name: &str) -> Result<DateTime<Utc>> {
    let raw: String = row.get(name)?;
    parse_ts(&raw, row, name)
}

fn opt_ts_column(row: &Row<'_>, name: &str) -> Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(name)?;
    raw.map(|s| parse_ts(&s, row, name)).transpose()
}

fn parse_ts(raw: &str, row: &Row<'_>, name: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            let idx = row.as_ref().column_index(name).unwrap_or(0);
            rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
        })
}

impl Project {
    pub fn from_row(row: &Row<'_>) -> Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            name: row.get("name")?,
            path: PathBuf::from(row.get::<_, String>("path")?),
            created_at: ts_column(row, "created_at")?,
        })
    }
}

impl Session {
    pub fn from_row(row: &Row<'_>) -> Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            project_id: row.get("project_id")?,
            name: row.get("name")?,
            cwd: row.get("cwd")?,
            status: row.get("status")?,
            created_at: ts_column(row, "created_at")?,
            updated_at: ts_column(row, "updated_at")?,
            last_message_at: opt_ts_column(row, "last_message_at")?,
        })
    }
}

impl Message {
    pub fn from_row(row: &Row<'_>) -> Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            session_id: row.get("session_id")?,
            natural_key: row.get("natural_key")?,
            seq: row.get::<_, i64>("seq")? as u64,
            role: row.get("role")?,
            content: row.get("content")?,
            timestamp: ts_column(row, "timestamp")?,
            raw_payload: row.get("raw_payload")?,
        })
    }
}

impl TrackingRecord {
    pub fn from_row(row: &Row<'_>) -> Result<Self> {
        Ok(Self {
            file_key: row.get("file_key")?,
            file_path: PathBuf::from(row.get::<_, String>("file_path")?),
            cursor: row.get::<_, i64>("cursor")? as u64,
            first_seen_at: ts_column(row, "first_seen_at")?,
            last_updated_at: ts_column(row, "last_updated_at")?,
            tombstoned: row.get::<_, i32>("tombstoned")? != 0,
        })
    }
}
