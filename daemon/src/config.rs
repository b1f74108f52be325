//! Configuration management for the ingestion daemon.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Global daemon configuration, stored at `~/.chatlog/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub watcher: WatcherConfig,

    #[serde(default)]
    pub ingest: IngestConfig,

    #[serde(default)]
    pub daemon: DaemonConfig,
}

/// Filesystem subscription settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherConfig {
    /// Root of the `<project>/<session>.jsonl` tree.
    #[serde(default = "default_target_dir")]
    pub target_dir: PathBuf,

    /// Glob matched against paths relative to `target_dir`.
    #[serde(default = "default_glob")]
    pub glob: String,

    /// Keep subscribing after the startup pass. When false, `watch` ingests once and exits.
    #[serde(default = "default_true")]
    pub persistent: bool,

    /// Do not emit `add` events for files already present at start.
    #[serde(default = "default_true")]
    pub ignore_initial: bool,

    /// Quiet period before a burst of writes is reported as one change.
    #[serde(default = "default_stability_threshold_ms")]
    pub stability_threshold_ms: u64,

    /// Poll interval for backends that fall back to polling.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            target_dir: default_target_dir(),
            glob: default_glob(),
            persistent: true,
            ignore_initial: true,
            stability_threshold_ms: default_stability_threshold_ms(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl WatcherConfig {
    /// Watcher config rooted at `dir` with default timings.
    pub fn for_root(dir: impl Into<PathBuf>) -> Self {
        Self {
            target_dir: dir.into(),
            ..Self::default()
        }
    }

    pub fn stability_threshold(&self) -> Duration {
        Duration::from_millis(self.stability_threshold_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Compile the glob into a matcher for root-relative paths.
    pub fn matcher(&self) -> Result<globset::GlobMatcher, Error> {
        let glob = globset::GlobBuilder::new(&self.glob)
            .literal_separator(true)
            .build()
            .map_err(|e| Error::Config(format!("invalid glob {:?}: {}", self.glob, e)))?;
        Ok(glob.compile_matcher())
    }
}

/// Processing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Interval between full-tree reconciliation passes.
    #[serde(default = "default_reconcile_interval_ms")]
    pub reconcile_interval_ms: u64,

    /// Maximum number of files processed concurrently.
    #[serde(default = "default_worker_limit")]
    pub worker_limit: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            reconcile_interval_ms: default_reconcile_interval_ms(),
            worker_limit: default_worker_limit(),
        }
    }
}

impl IngestConfig {
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            log_level: default_log_level(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_target_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".claude")
        .join("projects")
}

fn default_glob() -> String {
    "**/*.jsonl".to_string()
}

fn default_stability_threshold_ms() -> u64 {
    2000
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_reconcile_interval_ms() -> u64 {
    5 * 60 * 1000
}

fn default_worker_limit() -> usize {
    4
}

fn default_db_path() -> PathBuf {
    Config::global_dir().join("chatlog.db")
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load config from ~/.chatlog/config.toml
    pub fn load() -> Result<Self, Error> {
        Self::load_from(&Self::path())
    }

    /// Load config from an explicit path, falling back to defaults when it is missing.
    pub fn load_from(path: &Path) -> Result<Self, Error> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), Error> {
        if self.ingest.worker_limit == 0 {
            return Err(Error::Config("ingest.worker_limit must be at least 1".into()));
        }
        if self.ingest.reconcile_interval_ms == 0 {
            return Err(Error::Config(
                "ingest.reconcile_interval_ms must be positive".into(),
            ));
        }
        self.watcher.matcher()?;
        Ok(())
    }

    /// Path to global directory (~/.chatlog/)
    pub fn global_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".chatlog")
    }

    /// Path to config file
    pub fn path() -> PathBuf {
        Self::global_dir().join("config.toml")
    }
}
