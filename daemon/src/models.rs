//! Normalized records produced by ingestion.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Namespace for ids derived from natural keys.
const ID_NAMESPACE: Uuid = Uuid::from_u128(0x6c0b_3e2a_8f41_4d6e_9a57_12c4_d0e8_b731);

/// Stable id for a project, derived from its name.
pub fn project_id(project_name: &str) -> String {
    Uuid::new_v5(&ID_NAMESPACE, format!("project:{project_name}").as_bytes()).to_string()
}

/// Stable id for a message, derived from its session and natural key.
pub fn message_id(session_id: &str, natural_key: &str) -> String {
    Uuid::new_v5(
        &ID_NAMESPACE,
        format!("message:{session_id}:{natural_key}").as_bytes(),
    )
    .to_string()
}

/// A project directory under the watch root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
}

/// One chat session, backed by one transcript file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub project_id: String,
    pub name: String,
    pub cwd: Option<String>,
    pub status: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_message_at: Option<DateTime<Utc>>,
}

/// A user or assistant turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub session_id: String,
    /// Per-line identity used for deduplication.
    pub natural_key: String,
    /// Line number within the transcript.
    pub seq: u64,
    pub role: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub raw_payload: String,
}

/// Ingestion progress for one physical transcript file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingRecord {
    /// `<path>@<first seen unix millis>`.
    pub file_key: String,
    pub file_path: PathBuf,
    /// Number of complete lines already applied.
    pub cursor: u64,
    pub first_seen_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    pub tombstoned: bool,
}

impl TrackingRecord {
    /// Key for a file identity first seen at `first_seen_at`.
    ///
    /// Recreating a file at the same path yields a new key, so a stale cursor
    /// is never resurrected.
    pub fn key_for(path: &std::path::Path, first_seen_at: DateTime<Utc>) -> String {
        format!("{}@{}", path.display(), first_seen_at.timestamp_millis())
    }
}
