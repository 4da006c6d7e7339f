//! Collector configuration.

use crate::store::{RetentionPolicy, StoreConfig, DEFAULT_DB_PATH};
use crate::types::Target;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// First port a profiled host's workers listen on.
pub const DEFAULT_BASE_PORT: u16 = 16384;

/// Collector configuration.
///
/// Every field has a default, so a config file only needs the fields it
/// changes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    /// Path of the store file.
    pub db_path: PathBuf,

    /// Hosts to poll.
    pub hosts: Vec<String>,

    /// Worker processes per host, on consecutive ports from `base_port`.
    pub nprocs: u16,

    /// Pause between sweeps.
    pub interval_secs: u64,

    pub base_port: u16,

    /// Per-request timeout.
    pub request_timeout_secs: u64,

    /// Threads fetching concurrently. Store writes stay on one thread.
    pub fetch_workers: usize,

    /// Pause between attempts to open a busy store.
    pub busy_backoff_ms: u64,

    /// Trimming applied when the store is reorganized.
    pub retention: RetentionPolicy,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            hosts: Vec::new(),
            nprocs: 1,
            interval_secs: 600,
            base_port: DEFAULT_BASE_PORT,
            request_timeout_secs: 5,
            fetch_workers: 1,
            busy_backoff_ms: 0,
            retention: RetentionPolicy::unbounded(),
        }
    }
}

impl CollectorConfig {
    /// Load a JSON config file. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> io::Result<Self> {
        let text = fs::read_to_string(path)?;
        serde_json::from_str(&text).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// Every `(host, port)` to poll: hosts in configured order, each with
    /// ports `base_port..base_port + nprocs` ascending.
    pub fn targets(&self) -> impl Iterator<Item = Target> + '_ {
        let base = self.base_port;
        let end = base.saturating_add(self.nprocs);
        self.hosts
            .iter()
            .flat_map(move |host| (base..end).map(move |port| Target::new(host.as_str(), port)))
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Store settings derived from this config.
    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            path: self.db_path.clone(),
            create_if_missing: true,
            busy_backoff: Duration::from_millis(self.busy_backoff_ms),
            retention: self.retention,
        }
    }
}
