//! Error types for the signature store and the collector.

use thiserror::Error;

/// Main error type for store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The store file is locked by another handle. Transient.
    #[error("Store is locked by another handle")]
    Busy,

    #[error("Invalid store format: {0}")]
    InvalidFormat(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Key too large: {0} bytes")]
    KeyTooLarge(usize),

    #[error("Store does not exist: {0}")]
    NotInitialized(String),
}

impl StoreError {
    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Busy)
    }
}

/// Errors raised while collecting from a single target.
#[derive(Debug, Error)]
pub enum CollectError {
    #[error("Request failed: {0}")]
    Fetch(#[from] reqwest::Error),

    #[error("Unexpected HTTP status: {0}")]
    Status(u16),

    #[error("Error opening store: {0}")]
    Open(#[source] StoreError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl CollectError {
    /// Whether the failure points at the store's host rather than at the
    /// target or its payload.
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, CollectError::Open(_))
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
