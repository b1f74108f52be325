//! Error types for the ingestion daemon.

use std::path::PathBuf;

use thiserror::Error;

/// Daemon error type.
#[derive(Error, Debug)]
pub enum Error {
    /// Watcher lifecycle failure (already running, failed to start or stop).
    #[error("Watcher error: {0}")]
    Watcher(String),

    #[error("Failed to read {path}: {source}")]
    FileReader {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Path derivation failure or a file without a single valid entry.
    #[error("Parser error: {0}")]
    Parser(String),

    /// Transcript could not be read.
    #[error("Parser error: cannot read {path}: {source}")]
    ParserRead {
        path: PathBuf,
        #[source]
        source: Box<Error>,
    },

    #[error("Failed to list {path}: {message}")]
    FileSystem { path: PathBuf, message: String },

    /// Lost a compare-and-set race on a tracking cursor.
    #[error("Tracking conflict on {file_key}: expected cursor {expected}, found {actual:?}")]
    TrackingConflict {
        file_key: String,
        expected: u64,
        actual: Option<u64>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("File watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Config error: {0}")]
    Config(String),
}

impl Error {
    pub fn watcher(msg: impl Into<String>) -> Self {
        Self::Watcher(msg.into())
    }

    pub fn parser(msg: impl Into<String>) -> Self {
        Self::Parser(msg.into())
    }

    /// Taxonomy code for operator-facing reports.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Watcher(_) | Error::Watch(_) => ErrorCode::WatcherError,
            Error::FileReader { .. } => ErrorCode::FileReaderError,
            Error::Parser(_) | Error::ParserRead { .. } | Error::Json(_) => {
                ErrorCode::ParserError
            }
            Error::FileSystem { .. } => ErrorCode::FileSystemError,
            Error::TrackingConflict { .. } => ErrorCode::TrackingConflict,
            Error::Io(_) => ErrorCode::IoError,
            Error::Database(_) => ErrorCode::DatabaseError,
            Error::Config(_) => ErrorCode::ConfigError,
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::TrackingConflict { .. })
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}

/// Error codes reported alongside failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    WatcherError,
    FileReaderError,
    ParserError,
    FileSystemError,
    TrackingConflict,
    IoError,
    DatabaseError,
    ConfigError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::WatcherError => "WATCHER_ERROR",
            ErrorCode::FileReaderError => "FILE_READER_ERROR",
            ErrorCode::ParserError => "PARSER_ERROR",
            ErrorCode::FileSystemError => "FILE_SYSTEM_ERROR",
            ErrorCode::TrackingConflict => "TRACKING_CONFLICT",
            ErrorCode::IoError => "IO_ERROR",
            ErrorCode::DatabaseError => "DATABASE_ERROR",
            ErrorCode::ConfigError => "CONFIG_ERROR",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
