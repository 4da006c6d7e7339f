//! Error handling and edge case tests.

use stackcollector::{
    CollectError, CollectOutcome, Collector, StackSignature, StackStore, StoreConfig, StoreError,
    Target, Timestamp,
};
use std::fs;
use tempfile::TempDir;

fn payload(_: &Target) -> Result<Vec<u8>, CollectError> {
    Ok(b"h1\nh2\nabc 1\n".to_vec())
}

// --- Store Open Errors ---

#[test]
fn test_foreign_file_rejected() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("db");
    fs::write(&path, b"\x13\x57\x9a\xce not ours").unwrap();

    let result = StackStore::open_path(&path);
    assert!(matches!(result, Err(StoreError::InvalidFormat(_))));

    // The file is left alone.
    assert_eq!(fs::read(&path).unwrap(), b"\x13\x57\x9a\xce not ours");
}

#[test]
fn test_unsupported_version() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("db");
    fs::write(&path, b"STK\x09").unwrap();

    // Short, and not the start of a store header.
    assert!(matches!(
        StackStore::open_path(&path),
        Err(StoreError::InvalidFormat(_))
    ));

    let mut header = b"STK\0\x09".to_vec();
    header.extend_from_slice(&13u64.to_le_bytes());
    fs::write(&path, &header).unwrap();
    assert!(matches!(
        StackStore::open_path(&path),
        Err(StoreError::InvalidFormat(_))
    ));
}

#[test]
fn test_partial_header_recovered() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("db");

    // A crash while the store was first being created.
    fs::write(&path, b"STK\0").unwrap();

    let store = StackStore::open_path(&path).unwrap();
    assert!(store.is_empty());
    store.append_raw(b"k", b"a:1:1:1 ").unwrap();
    store.close().unwrap();

    let store = StackStore::open_path(&path).unwrap();
    assert_eq!(store.get(b"k").unwrap().unwrap(), b"a:1:1:1 ");
}

#[test]
fn test_missing_store_without_create() {
    let dir = TempDir::new().unwrap();
    let config = StoreConfig {
        create_if_missing: false,
        ..StoreConfig::new(dir.path().join("db"))
    };

    let result = StackStore::open(config);
    assert!(matches!(result, Err(StoreError::NotInitialized(_))));
    assert!(!dir.path().join("db").exists());
}

#[test]
fn test_long_key_accepted() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("db");
    let key = vec![b'x'; 70_000];

    {
        let store = StackStore::open_path(&path).unwrap();
        store.append_raw(&key, b"a:1:1:1 ").unwrap();
        store.append_raw(&key, b"a:1:2:1 ").unwrap();
        store.close().unwrap();
    }

    let store = StackStore::open_path(&path).unwrap();
    assert_eq!(store.get(&key).unwrap().unwrap(), b"a:1:1:1 a:1:2:1 ");
}

#[test]
fn test_corrupt_value_fails_read_not_open() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("db");

    {
        let store = StackStore::open_path(&path).unwrap();
        store.append_raw(b"a", b"a:1:1:1 ").unwrap();
        store.append_raw(b"b", b"b:1:1:1 ").unwrap();
        store.close().unwrap();
    }

    // Flip a value byte of the entry for "a".
    let mut bytes = fs::read(&path).unwrap();
    let value_start = 13 + 1 + 4 + 1 + 4;
    bytes[value_start] = b'z';
    fs::write(&path, &bytes).unwrap();

    let store = StackStore::open_path(&path).unwrap();
    assert!(matches!(
        store.get(b"a"),
        Err(StoreError::ChecksumMismatch { .. })
    ));
    assert_eq!(store.get(b"b").unwrap().unwrap(), b"b:1:1:1 ");
}

// --- Edge Cases ---

#[test]
fn test_binary_signature() {
    let dir = TempDir::new().unwrap();
    let store = StackStore::open_path(dir.path().join("db")).unwrap();
    let sig = StackSignature(vec![0, 159, 146, 150, 255]);

    store.append_raw(sig.as_bytes(), b"h:1:2:3 ").unwrap();
    assert_eq!(store.get(sig.as_bytes()).unwrap().unwrap(), b"h:1:2:3 ");
}

#[test]
fn test_empty_payload_still_opens_store() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("db");
    let target = Target::new("localhost", 16384);

    let source = |_: &Target| -> Result<Vec<u8>, CollectError> { Ok(Vec::new()) };
    let collector = Collector::new(StoreConfig::new(&db), vec![target.clone()], source);

    assert_eq!(
        collector.collect(&target),
        CollectOutcome::Collected { num_stacks: 0, saved: 0 }
    );
    assert!(db.exists());
    assert!(StackStore::open_path(&db).unwrap().is_empty());
}

#[test]
fn test_corrupt_store_fails_save_not_sweep() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("db");
    fs::write(&db, b"garbage!").unwrap();

    let targets = vec![Target::new("a", 16384), Target::new("b", 16384)];
    let collector = Collector::new(StoreConfig::new(&db), targets, payload);

    let report = collector.sweep();
    assert_eq!(report.attempted, 2);
    assert_eq!(report.save_failed, 2);

    let err = collector
        .save(&Target::new("a", 16384), &[], Timestamp(0))
        .unwrap_err();
    assert!(err.is_infrastructure());
}

#[test]
fn test_store_path_under_file_fails() {
    let dir = TempDir::new().unwrap();
    let blocker = dir.path().join("blocker");
    fs::write(&blocker, b"").unwrap();

    // The parent "directory" is a regular file.
    let result = StackStore::open_path(blocker.join("db"));
    assert!(matches!(result, Err(StoreError::Io(_))));
}
