//! Append-only entry file.
//!
//! Layout: a 13-byte header (magic, version, synced length) followed by
//! entries of the form `[op u8][key_len u32][key][value_len u32][value][crc32 u32]`,
//! little endian. The checksum covers everything before it in the entry.
//!
//! The synced length is rewritten after every fsync. Entries below it are
//! indexed on open without reading their values; their checksums are checked
//! when they are read. Entries past it are fully verified on open, and a
//! damaged tail is cut off.

use crate::error::{Result, StoreError};
use parking_lot::RwLock;
use std::fs::File;
use std::io::{BufReader, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Magic bytes for the store file.
const LOG_MAGIC: &[u8; 4] = b"STK\0";

/// Current file format version.
const LOG_VERSION: u8 = 1;

/// Where the synced length lives in the header.
const SYNCED_LEN_OFFSET: u64 = 5;

/// Header size (magic + version + synced length).
pub const HEADER_SIZE: u64 = 13;

/// Largest accepted key; key lengths are stored as `u32`.
pub const MAX_KEY_LEN: usize = u32::MAX as usize;

/// Fixed bytes of an entry besides key and value: op + two lengths + checksum.
const ENTRY_OVERHEAD: u64 = 1 + 4 + 4 + 4;

/// What an entry does to its key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryOp {
    /// Sets the key's value, creating the key.
    Put,
    /// Concatenates onto the key's existing value.
    Append,
}

impl EntryOp {
    fn to_byte(self) -> u8 {
        match self {
            EntryOp::Put => 0,
            EntryOp::Append => 1,
        }
    }

    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(EntryOp::Put),
            1 => Some(EntryOp::Append),
            _ => None,
        }
    }
}

/// A decoded entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    pub op: EntryOp,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// What replay learns about an entry without reading its value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntryHead {
    pub op: EntryOp,
    pub key: Vec<u8>,
    pub value_len: u64,
}

impl EntryHead {
    fn encoded_len(&self) -> u64 {
        ENTRY_OVERHEAD + self.key.len() as u64 + self.value_len
    }
}

impl From<Entry> for EntryHead {
    fn from(entry: Entry) -> Self {
        EntryHead {
            op: entry.op,
            value_len: entry.value.len() as u64,
            key: entry.key,
        }
    }
}

/// Append-only entry file backing the store.
pub struct EntryLog {
    /// Path to the file.
    path: PathBuf,

    /// File handle. The caller owns the advisory lock on it.
    file: RwLock<File>,

    /// End of the last complete entry.
    file_size: RwLock<u64>,

    /// Whether anything was written since the last fsync.
    dirty: RwLock<bool>,
}

impl EntryLog {
    /// Wrap an opened file, writing the header if it is empty.
    ///
    /// `visit` is called with `(offset, head)` for every complete entry in
    /// file order. A torn or zero-filled tail past the synced length is cut
    /// off; damage anywhere else is reported as corruption.
    pub fn open(
        path: impl AsRef<Path>,
        mut file: File,
        mut visit: impl FnMut(u64, EntryHead),
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let len = file.metadata()?.len();

        let file_size = if len < HEADER_SIZE && Self::is_partial_header(&mut file, len)? {
            if len > 0 {
                warn!(path = %path.display(), len, "Discarding partial store header");
            }
            file.set_len(0)?;
            file.seek(SeekFrom::Start(0))?;
            file.write_all(&header(HEADER_SIZE))?;
            file.sync_all()?;
            HEADER_SIZE
        } else {
            let synced = Self::read_header(&mut file)?;
            Self::replay(&path, &mut file, len, synced, &mut visit)?
        };

        Ok(Self {
            path,
            file: RwLock::new(file),
            file_size: RwLock::new(file_size),
            dirty: RwLock::new(false),
        })
    }

    /// Append an entry; returns the offset it was written at.
    pub fn append(&self, op: EntryOp, key: &[u8], value: &[u8]) -> Result<u64> {
        let buf = encode_entry(op, key, value)?;

        let mut file = self.file.write();
        let offset = *self.file_size.read();

        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&buf)?;

        *self.file_size.write() = offset + buf.len() as u64;
        *self.dirty.write() = true;

        Ok(offset)
    }

    /// Read and verify the entry starting at `offset`.
    pub fn read_at(&self, offset: u64) -> Result<Entry> {
        let mut file = self.file.write();
        file.seek(SeekFrom::Start(offset))?;
        read_entry(&mut *file)
    }

    /// Force pending writes to disk, then record the synced length.
    pub fn sync(&self) -> Result<()> {
        let mut file = self.file.write();
        let mut dirty = self.dirty.write();
        if *dirty {
            file.sync_all()?;
            let synced = *self.file_size.read();
            file.seek(SeekFrom::Start(SYNCED_LEN_OFFSET))?;
            file.write_all(&synced.to_le_bytes())?;
            file.sync_all()?;
            *dirty = false;
        }
        Ok(())
    }

    /// Replace the backing file with `file`, whose content is a complete,
    /// synced log of `file_size` bytes already renamed over this log's path.
    pub fn swap_file(&self, file: File, file_size: u64) {
        *self.file.write() = file;
        *self.file_size.write() = file_size;
        *self.dirty.write() = false;
    }

    /// Write a fresh log holding one `Put` per `(key, value)` to `file`.
    ///
    /// Returns the offset of each entry, in input order, and the total size.
    /// The file is synced before returning.
    pub fn write_compacted<'a>(
        file: &mut File,
        entries: impl IntoIterator<Item = (&'a [u8], &'a [u8])>,
    ) -> Result<(Vec<u64>, u64)> {
        let mut writer = std::io::BufWriter::new(&mut *file);
        writer.write_all(&header(HEADER_SIZE))?;
        let mut size = HEADER_SIZE;
        let mut offsets = Vec::new();

        for (key, value) in entries {
            let buf = encode_entry(EntryOp::Put, key, value)?;
            writer.write_all(&buf)?;
            offsets.push(size);
            size += buf.len() as u64;
        }

        writer.flush()?;
        drop(writer);
        file.sync_all()?;
        file.seek(SeekFrom::Start(SYNCED_LEN_OFFSET))?;
        file.write_all(&size.to_le_bytes())?;
        file.sync_all()?;
        Ok((offsets, size))
    }

    /// Current file size.
    pub fn size(&self) -> u64 {
        *self.file_size.read()
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the first `len` bytes are the start of a fresh header, as
    /// left by a crash while the store was being created.
    fn is_partial_header(file: &mut File, len: u64) -> Result<bool> {
        let mut existing = Vec::new();
        file.seek(SeekFrom::Start(0))?;
        std::io::Read::by_ref(file).take(len).read_to_end(&mut existing)?;
        Ok(header(HEADER_SIZE).starts_with(&existing))
    }

    /// Check magic and version; returns the synced length.
    fn read_header(file: &mut File) -> Result<u64> {
        file.seek(SeekFrom::Start(0))?;

        let mut buf = [0u8; HEADER_SIZE as usize];
        file.read_exact(&mut buf)
            .map_err(|_| StoreError::InvalidFormat("Truncated header".into()))?;
        if &buf[..4] != LOG_MAGIC {
            return Err(StoreError::InvalidFormat("Invalid store magic".into()));
        }
        if buf[4] != LOG_VERSION {
            return Err(StoreError::InvalidFormat(format!(
                "Unsupported store version: {}",
                buf[4]
            )));
        }

        let mut synced = [0u8; 8];
        synced.copy_from_slice(&buf[SYNCED_LEN_OFFSET as usize..]);
        Ok(u64::from_le_bytes(synced))
    }

    /// Scan all entries; returns the offset just past the last good one.
    fn replay(
        path: &Path,
        file: &mut File,
        len: u64,
        synced: u64,
        visit: &mut impl FnMut(u64, EntryHead),
    ) -> Result<u64> {
        if synced < HEADER_SIZE || synced > len {
            return Err(StoreError::Corruption(format!(
                "synced length {} outside a {} byte store",
                synced, len
            )));
        }

        file.seek(SeekFrom::Start(HEADER_SIZE))?;
        let mut reader = BufReader::new(&mut *file);
        let mut offset = HEADER_SIZE;

        // Synced entries: index only, values are skipped.
        while offset < synced {
            let (op_byte, key, value_len) = read_head(&mut reader, None).map_err(|e| {
                StoreError::Corruption(format!("unreadable entry at offset {}: {}", offset, e))
            })?;
            let op = EntryOp::from_byte(op_byte).ok_or_else(|| {
                StoreError::Corruption(format!("unknown entry op {} at offset {}", op_byte, offset))
            })?;
            let head = EntryHead { op, key, value_len };
            let entry_len = head.encoded_len();
            if offset + entry_len > synced {
                return Err(StoreError::Corruption(format!(
                    "entry at offset {} runs past the synced length",
                    offset
                )));
            }

            reader.seek_relative(value_len as i64 + 4)?;
            visit(offset, head);
            offset += entry_len;
        }

        // Unsynced entries: fully verified.
        let damage = loop {
            if offset >= len {
                break None;
            }
            match read_entry(&mut reader) {
                Ok(entry) => {
                    let head = EntryHead::from(entry);
                    let entry_len = head.encoded_len();
                    visit(offset, head);
                    offset += entry_len;
                }
                Err(StoreError::Io(e)) if e.kind() == ErrorKind::UnexpectedEof => break None,
                Err(StoreError::ChecksumMismatch { .. }) if Self::is_tail(&mut reader, len)? => {
                    break None
                }
                Err(e) => break Some(e),
            }
        };

        drop(reader);
        if let Some(e) = damage {
            if !Self::is_zero_filled(file, offset, len)? {
                return Err(e);
            }
        }

        if offset < len {
            warn!(
                path = %path.display(),
                discarded = len - offset,
                "Discarding torn entry at end of store"
            );
            file.set_len(offset)?;
            file.sync_all()?;
        }

        Ok(offset)
    }

    /// Whether the reader stopped exactly at the end of the file.
    fn is_tail(reader: &mut BufReader<&mut File>, len: u64) -> Result<bool> {
        Ok(reader.stream_position()? >= len)
    }

    /// Whether every byte from `from` to `len` is zero, as when a crash
    /// extends the file before its data reaches the disk.
    fn is_zero_filled(file: &mut File, from: u64, len: u64) -> Result<bool> {
        file.seek(SeekFrom::Start(from))?;
        let mut rest = std::io::Read::by_ref(file).take(len - from);
        let mut buf = [0u8; 8192];
        loop {
            let n = rest.read(&mut buf)?;
            if n == 0 {
                return Ok(true);
            }
            if buf[..n].iter().any(|&b| b != 0) {
                return Ok(false);
            }
        }
    }
}

fn header(synced: u64) -> [u8; HEADER_SIZE as usize] {
    let mut buf = [0u8; HEADER_SIZE as usize];
    buf[..4].copy_from_slice(LOG_MAGIC);
    buf[4] = LOG_VERSION;
    buf[SYNCED_LEN_OFFSET as usize..].copy_from_slice(&synced.to_le_bytes());
    buf
}

fn encode_entry(op: EntryOp, key: &[u8], value: &[u8]) -> Result<Vec<u8>> {
    if key.len() > MAX_KEY_LEN {
        return Err(StoreError::KeyTooLarge(key.len()));
    }
    let value_len = u32::try_from(value.len())
        .map_err(|_| StoreError::Corruption(format!("value of {} bytes", value.len())))?;

    let mut buf = Vec::with_capacity(ENTRY_OVERHEAD as usize + key.len() + value.len());
    buf.push(op.to_byte());
    buf.extend_from_slice(&(key.len() as u32).to_le_bytes());
    buf.extend_from_slice(key);
    buf.extend_from_slice(&value_len.to_le_bytes());
    buf.extend_from_slice(value);
    let checksum = crc32fast::hash(&buf);
    buf.extend_from_slice(&checksum.to_le_bytes());
    Ok(buf)
}

/// Read `len` bytes without trusting `len` for the allocation.
fn read_bytes(reader: &mut impl Read, len: u64) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    reader.by_ref().take(len).read_to_end(&mut buf)?;
    if (buf.len() as u64) < len {
        return Err(std::io::Error::from(ErrorKind::UnexpectedEof).into());
    }
    Ok(buf)
}

/// Read op byte, key and value length, feeding them to `hasher` if given.
fn read_head(
    reader: &mut impl Read,
    mut hasher: Option<&mut crc32fast::Hasher>,
) -> Result<(u8, Vec<u8>, u64)> {
    let mut op_byte = [0u8; 1];
    reader.read_exact(&mut op_byte)?;

    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes)?;
    let key = read_bytes(reader, u32::from_le_bytes(len_bytes) as u64)?;

    let mut value_len_bytes = [0u8; 4];
    reader.read_exact(&mut value_len_bytes)?;

    if let Some(hasher) = hasher.as_mut() {
        hasher.update(&op_byte);
        hasher.update(&len_bytes);
        hasher.update(&key);
        hasher.update(&value_len_bytes);
    }

    Ok((op_byte[0], key, u32::from_le_bytes(value_len_bytes) as u64))
}

fn read_entry(reader: &mut impl Read) -> Result<Entry> {
    let mut hasher = crc32fast::Hasher::new();

    let (op_byte, key, value_len) = read_head(reader, Some(&mut hasher))?;
    let value = read_bytes(reader, value_len)?;
    hasher.update(&value);

    let mut checksum_bytes = [0u8; 4];
    reader.read_exact(&mut checksum_bytes)?;
    let stored = u32::from_le_bytes(checksum_bytes);
    let computed = hasher.finalize();
    if stored != computed {
        return Err(StoreError::ChecksumMismatch {
            expected: stored,
            got: computed,
        });
    }

    let op = EntryOp::from_byte(op_byte)
        .ok_or_else(|| StoreError::Corruption(format!("unknown entry op {}", op_byte)))?;

    Ok(Entry { op, key, value })
}
