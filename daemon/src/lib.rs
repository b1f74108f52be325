//! chatlog-ingest library.
//!
//! Watches a tree of append-only JSONL chat transcripts and projects each
//! line, at most once, into Project/Session/Message rows in SQLite.

pub mod cli;
pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod fs;
pub mod models;
pub mod repository;
pub mod watcher;

pub use error::Error;
