//! Core types for the collector and its store.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Opaque identifier of one call-stack shape, used as the store key.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StackSignature(pub Vec<u8>);

impl StackSignature {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&str> for StackSignature {
    fn from(s: &str) -> Self {
        StackSignature(s.as_bytes().to_vec())
    }
}

impl From<String> for StackSignature {
    fn from(s: String) -> Self {
        StackSignature(s.into_bytes())
    }
}

impl From<Vec<u8>> for StackSignature {
    fn from(bytes: Vec<u8>) -> Self {
        StackSignature(bytes)
    }
}

impl AsRef<[u8]> for StackSignature {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for StackSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StackSignature({})", String::from_utf8_lossy(&self.0))
    }
}

/// Unix time in whole seconds.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(duration.as_secs() as i64)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single profiling endpoint: one worker process on one host.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    pub host: String,
    pub port: u16,
}

impl Target {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Endpoint URL, asking the target to reset its counters after replying.
    pub fn url(&self) -> String {
        format!("http://{}:{}/?reset=true", self.host, self.port)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A sample count exactly as the endpoint reported it.
///
/// Never parsed as a number; the bytes are stored as they arrived.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct SampleCount(pub Vec<u8>);

impl SampleCount {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&str> for SampleCount {
    fn from(s: &str) -> Self {
        SampleCount(s.as_bytes().to_vec())
    }
}

impl From<String> for SampleCount {
    fn from(s: String) -> Self {
        SampleCount(s.into_bytes())
    }
}

impl From<&[u8]> for SampleCount {
    fn from(bytes: &[u8]) -> Self {
        SampleCount(bytes.to_vec())
    }
}

impl From<Vec<u8>> for SampleCount {
    fn from(bytes: Vec<u8>) -> Self {
        SampleCount(bytes)
    }
}

impl fmt::Debug for SampleCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SampleCount({})", String::from_utf8_lossy(&self.0))
    }
}

/// One sample count for a signature, as seen on one target at one time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Observation {
    pub source_host: String,
    pub source_port: u16,
    pub timestamp: Timestamp,
    pub count: SampleCount,
}

impl Observation {
    pub fn new(target: &Target, timestamp: Timestamp, count: impl Into<SampleCount>) -> Self {
        Self {
            source_host: target.host.clone(),
            source_port: target.port,
            timestamp,
            count: count.into(),
        }
    }

    /// Serialized log record: `host:port:timestamp:count ` with a trailing space.
    /// The count bytes are copied as they are.
    pub fn encode(&self) -> Vec<u8> {
        let prefix = format!("{}:{}:{}:", self.source_host, self.source_port, self.timestamp);
        let mut buf = Vec::with_capacity(prefix.len() + self.count.0.len() + 1);
        buf.extend_from_slice(prefix.as_bytes());
        buf.extend_from_slice(&self.count.0);
        buf.push(b' ');
        buf
    }
}
