//! On-disk engine for the signature store.
//!
//! Values live in an append-only entry file; a key index mapping each key
//! to the entries that make up its value is rebuilt on open.

mod index;
mod log;

pub use index::{KeyIndex, KeyLocation};
pub use log::{Entry, EntryHead, EntryLog, EntryOp, HEADER_SIZE, MAX_KEY_LEN};
