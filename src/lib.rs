//! # Stack Collector
//!
//! Periodically polls profiling endpoints for stack-sample counts and
//! appends them to a persistent store keyed by stack signature.
//!
//! ## Core Concepts
//!
//! - **Targets**: `(host, port)` endpoints, one per worker process
//! - **Observations**: `host:port:timestamp:count ` records, one per stack per poll
//! - **Store**: an append-only file mapping each stack signature to the
//!   concatenation of its observations
//! - **Sweeps**: one poll of every target, repeated on a fixed interval
//!
//! ## Example
//!
//! ```ignore
//! use stackcollector::{Observation, StackSignature, StackStore, Target, Timestamp};
//!
//! let store = StackStore::open_path("/var/lib/stackcollector/db")?;
//! let target = Target::new("localhost", 16384);
//! store.append(
//!     &StackSignature::from("main;serve;handle"),
//!     &Observation::new(&target, Timestamp::now(), "5"),
//! )?;
//! store.close()?;
//! ```

pub mod collector;
pub mod config;
pub mod error;
pub mod records;
pub mod store;
pub mod types;

// Re-exports
pub use collector::{
    parse_payload, run, CollectOutcome, Collector, HttpSource, ParsedPayload, ProfileSource,
    SweepReport,
};
pub use config::{CollectorConfig, DEFAULT_BASE_PORT};
pub use error::{CollectError, Result, StoreError};
pub use store::{
    retry_while_busy, ReorganizeStats, RetentionPolicy, StackStore, StoreConfig, DEFAULT_DB_PATH,
};
pub use types::*;
