//! The signature store: a persistent map from stack signature to the
//! observation log recorded for it.

use crate::error::{Result, StoreError};
use crate::records::{EntryLog, EntryOp, KeyIndex, KeyLocation};
use crate::types::{Observation, StackSignature};
use fs2::FileExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, trace};

/// Default location of the store file.
pub const DEFAULT_DB_PATH: &str = "/var/lib/stackcollector/db";

/// How much of each observation log `reorganize` keeps.
///
/// Appends never trim. The default keeps everything.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionPolicy {
    /// Keep only the newest N observations per signature.
    pub max_observations: Option<usize>,
}

impl RetentionPolicy {
    /// Never trim.
    pub fn unbounded() -> Self {
        Self::default()
    }

    /// Keep the newest `max` observations per signature.
    pub fn keep_newest(max: usize) -> Self {
        Self {
            max_observations: Some(max),
        }
    }

    /// The tail of `log` this policy keeps.
    ///
    /// Every record in a log ends with a single space.
    pub fn trim<'a>(&self, log: &'a [u8]) -> &'a [u8] {
        let max = match self.max_observations {
            Some(max) => max,
            None => return log,
        };

        let mut seen = 0;
        for (i, &b) in log.iter().enumerate().rev() {
            if b == b' ' {
                if seen == max {
                    return &log[i + 1..];
                }
                seen += 1;
            }
        }
        log
    }
}

/// Store configuration.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Path of the store file.
    pub path: PathBuf,

    /// Whether to create the file (and its directory) if it doesn't exist.
    pub create_if_missing: bool,

    /// Pause between attempts while another handle holds the store.
    pub busy_backoff: Duration,

    /// Trimming applied by `reorganize`.
    pub retention: RetentionPolicy,
}

impl StoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_DB_PATH),
            create_if_missing: true,
            busy_backoff: Duration::ZERO,
            retention: RetentionPolicy::unbounded(),
        }
    }
}

/// Outcome of a `reorganize` pass.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReorganizeStats {
    pub keys: usize,
    pub entries_before: usize,
    pub entries_after: usize,
    pub bytes_before: u64,
    pub bytes_after: u64,
}

/// Run `attempt` until it returns anything other than a transient error.
///
/// There is no attempt limit: the store eventually frees up or fails for
/// some other reason.
pub fn retry_while_busy<T>(
    backoff: Duration,
    mut attempt: impl FnMut() -> Result<T>,
) -> Result<T> {
    let mut retries: u64 = 0;
    loop {
        match attempt() {
            Err(e) if e.is_transient() => {
                retries += 1;
                if retries == 1 {
                    debug!("Store busy, retrying");
                } else {
                    trace!(retries, "Store still busy");
                }
                if !backoff.is_zero() {
                    std::thread::sleep(backoff);
                }
            }
            result => {
                if retries > 0 {
                    debug!(retries, "Store acquired after busy retries");
                }
                return result;
            }
        }
    }
}

/// Handle on the signature store.
///
/// The handle holds an exclusive lock on the store file from open until it
/// is closed or dropped. Values are append-only: an append to a known key
/// concatenates onto its value, an append to an unknown key creates it.
pub struct StackStore {
    /// Store configuration.
    config: StoreConfig,

    /// Entry file; owns the locked file handle.
    log: EntryLog,

    /// Key index.
    index: KeyIndex,

    /// Serializes writers so check-then-append is atomic per key.
    write_lock: Mutex<()>,
}

impl StackStore {
    /// Open the store, waiting out any other handle that holds it.
    pub fn open(config: StoreConfig) -> Result<Self> {
        retry_while_busy(config.busy_backoff, || Self::try_open(&config))
    }

    /// Open the store at `path` with default settings.
    pub fn open_path(path: impl Into<PathBuf>) -> Result<Self> {
        Self::open(StoreConfig::new(path))
    }

    /// Single open attempt; `StoreError::Busy` if the store is held.
    pub fn try_open(config: &StoreConfig) -> Result<Self> {
        if !config.create_if_missing && !config.path.exists() {
            return Err(StoreError::NotInitialized(config.path.display().to_string()));
        }

        if config.create_if_missing {
            if let Some(parent) = config.path.parent() {
                if !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent)?;
                }
            }
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(config.create_if_missing)
            .open(&config.path)?;

        Self::acquire_lock(&file)?;

        // Lost a race with a reorganize that swapped the file under us.
        if !Self::is_current(&config.path, &file)? {
            return Err(StoreError::Busy);
        }

        let index = KeyIndex::new();
        let log = EntryLog::open(&config.path, file, |offset, head| {
            index.apply(head.op, &head.key, offset, head.value_len)
        })?;

        debug!(
            path = %config.path.display(),
            keys = index.count(),
            bytes = log.size(),
            "Store opened"
        );

        Ok(Self {
            config: config.clone(),
            log,
            index,
            write_lock: Mutex::new(()),
        })
    }

    // --- Observation Operations ---

    /// Append one observation to a signature's log.
    pub fn append(&self, signature: &StackSignature, observation: &Observation) -> Result<()> {
        self.append_raw(signature.as_bytes(), &observation.encode())
    }

    /// Append raw bytes to a key's value, creating the key if needed.
    pub fn append_raw(&self, key: &[u8], fragment: &[u8]) -> Result<()> {
        let _lock = self.write_lock.lock();

        let op = if self.index.contains(key) {
            EntryOp::Append
        } else {
            EntryOp::Put
        };

        let offset = self.log.append(op, key, fragment)?;
        self.index.apply(op, key, offset, fragment.len() as u64);

        Ok(())
    }

    /// Full value of a key.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match self.index.get(key) {
            Some(location) => Ok(Some(self.read_value(key, &location)?)),
            None => Ok(None),
        }
    }

    /// Whether a key exists.
    pub fn contains(&self, key: &[u8]) -> bool {
        self.index.contains(key)
    }

    /// All keys, sorted.
    pub fn keys(&self) -> Vec<Vec<u8>> {
        self.index.keys()
    }

    /// Number of keys.
    pub fn len(&self) -> usize {
        self.index.count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // --- Maintenance ---

    /// Rewrite the file with one entry per key, applying the retention policy.
    ///
    /// The new file is written next to the old one, locked, and renamed over
    /// it, so a crash leaves either the old or the new file in place.
    pub fn reorganize(&self) -> Result<ReorganizeStats> {
        let _lock = self.write_lock.lock();

        let entries_before = self.index.fragment_count();
        let bytes_before = self.log.size();

        let keys = self.index.keys();
        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            let location = match self.index.get(&key) {
                Some(location) => location,
                None => continue,
            };
            let value = self.read_value(&key, &location)?;
            let kept = self.config.retention.trim(&value).to_vec();
            values.push((key, kept));
        }

        let tmp_path = Self::reorganize_path(&self.config.path);
        let mut tmp = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        Self::acquire_lock(&tmp)?;

        let written = EntryLog::write_compacted(
            &mut tmp,
            values.iter().map(|(k, v)| (k.as_slice(), v.as_slice())),
        )
        .and_then(|written| {
            fs::rename(&tmp_path, &self.config.path)?;
            Ok(written)
        });
        let (offsets, bytes_after) = match written {
            Ok(written) => written,
            Err(e) => {
                let _ = fs::remove_file(&tmp_path);
                return Err(e);
            }
        };

        let mut entries = HashMap::with_capacity(values.len());
        for ((key, value), offset) in values.into_iter().zip(offsets) {
            entries.insert(
                key,
                KeyLocation {
                    fragments: vec![offset],
                    len: value.len() as u64,
                },
            );
        }
        let keys = entries.len();
        self.index.replace(entries);
        self.log.swap_file(tmp, bytes_after);

        debug!(
            path = %self.config.path.display(),
            keys,
            bytes_before,
            bytes_after,
            "Store reorganized"
        );

        Ok(ReorganizeStats {
            keys,
            entries_before,
            entries_after: keys,
            bytes_before,
            bytes_after,
        })
    }

    /// Flush pending writes to disk.
    pub fn sync(&self) -> Result<()> {
        self.log.sync()
    }

    /// Flush and release the store.
    pub fn close(self) -> Result<()> {
        self.sync()
        // The lock goes with the file handle on drop.
    }

    /// Size of the store file.
    pub fn size_on_disk(&self) -> u64 {
        self.log.size()
    }

    /// Get the store path.
    pub fn path(&self) -> &Path {
        self.log.path()
    }

    // --- Private Helpers ---

    fn read_value(&self, key: &[u8], location: &KeyLocation) -> Result<Vec<u8>> {
        let mut value = Vec::with_capacity(location.len as usize);
        for &offset in &location.fragments {
            let entry = self.log.read_at(offset)?;
            if entry.key != key {
                return Err(StoreError::Corruption(format!(
                    "entry at offset {} belongs to another key",
                    offset
                )));
            }
            value.extend_from_slice(&entry.value);
        }
        Ok(value)
    }

    fn acquire_lock(file: &File) -> Result<()> {
        file.try_lock_exclusive().map_err(|e| {
            if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() {
                StoreError::Busy
            } else {
                StoreError::Io(e)
            }
        })
    }

    /// Whether `file` is still the file at `path`.
    #[cfg(unix)]
    fn is_current(path: &Path, file: &File) -> Result<bool> {
        use std::os::unix::fs::MetadataExt;

        let on_disk = match fs::metadata(path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        let held = file.metadata()?;
        Ok(on_disk.dev() == held.dev() && on_disk.ino() == held.ino())
    }

    #[cfg(not(unix))]
    fn is_current(_path: &Path, _file: &File) -> Result<bool> {
        Ok(true)
    }

    fn reorganize_path(path: &Path) -> PathBuf {
        let mut name = path.as_os_str().to_owned();
        name.push(".reorg");
        PathBuf::from(name)
    }
}

impl Drop for StackStore {
    fn drop(&mut self) {
        // Best-effort sync on drop
        let _ = self.sync();
    }
}
