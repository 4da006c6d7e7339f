//! In-memory key index, rebuilt from the entry file on every open.

use super::log::EntryOp;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Where one key's value lives on disk.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KeyLocation {
    /// Offsets of the entries whose values, concatenated, form the value.
    pub fragments: Vec<u64>,

    /// Total value length in bytes.
    pub len: u64,
}

/// Index mapping keys to their fragment offsets.
pub struct KeyIndex {
    entries: RwLock<HashMap<Vec<u8>, KeyLocation>>,
}

impl KeyIndex {
    /// Create an empty index.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Record an entry written at `offset`.
    ///
    /// A `Put` starts the value over; an `Append` extends it, or starts it
    /// when the key is not known yet.
    pub fn apply(&self, op: EntryOp, key: &[u8], offset: u64, value_len: u64) {
        let mut entries = self.entries.write();
        match op {
            EntryOp::Put => {
                entries.insert(
                    key.to_vec(),
                    KeyLocation {
                        fragments: vec![offset],
                        len: value_len,
                    },
                );
            }
            EntryOp::Append => {
                let location = entries.entry(key.to_vec()).or_default();
                location.fragments.push(offset);
                location.len += value_len;
            }
        }
    }

    /// Whether the key exists.
    pub fn contains(&self, key: &[u8]) -> bool {
        self.entries.read().contains_key(key)
    }

    /// Location of a key's value.
    pub fn get(&self, key: &[u8]) -> Option<KeyLocation> {
        self.entries.read().get(key).cloned()
    }

    /// All keys, sorted.
    pub fn keys(&self) -> Vec<Vec<u8>> {
        let mut keys: Vec<_> = self.entries.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Number of keys.
    pub fn count(&self) -> usize {
        self.entries.read().len()
    }

    /// Number of entries on disk that make up all values.
    pub fn fragment_count(&self) -> usize {
        self.entries
            .read()
            .values()
            .map(|location| location.fragments.len())
            .sum()
    }

    /// Replace the whole index, after the file was rewritten.
    pub fn replace(&self, entries: HashMap<Vec<u8>, KeyLocation>) {
        *self.entries.write() = entries;
    }
}

impl Default for KeyIndex {
    fn default() -> Self {
        Self::new()
    }
}
