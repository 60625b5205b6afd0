//! Tests for HashList
//!
//! These tests verify:
//! - Absent vs stored slots (including the all-zero hash)
//! - Range clearing and the capacity bound
//! - Snapshot save/load and corruption detection
//! - Readers never observe a half-written or resurrected hash

use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use tempfile::TempDir;
use vmstore::collections::HashList;
use vmstore::{Hash, StoreError, HASH_SIZE};

#[path = "../common/mod.rs"]
mod common;

use common::hash_of;

// =============================================================================
// Basic Operations
// =============================================================================

#[test]
fn test_get_unwritten_is_absent() {
    let list = HashList::with_chunk_size(8);
    assert_eq!(list.get(0), None);
    list.put(3, &hash_of(3)).unwrap();
    assert_eq!(list.get(2), None);
    assert_eq!(list.get(4), None);
}

#[test]
fn test_zero_hash_is_not_absent() {
    let list = HashList::with_chunk_size(8);
    let zero = Hash::new([0u8; HASH_SIZE]);
    list.put(1, &zero).unwrap();
    assert_eq!(list.get(1), Some(zero));
}

#[test]
fn test_put_get_across_chunks() {
    let list = HashList::with_chunk_size(8);
    for i in (0..100).step_by(7) {
        list.put(i, &hash_of(i)).unwrap();
    }
    for i in 0..100 {
        let expected = (i % 7 == 0).then(|| hash_of(i));
        assert_eq!(list.get(i), expected);
    }
    assert_eq!(list.size(), 99);
}

#[test]
fn test_overwrite_hash() {
    let list = HashList::new();
    list.put(5, &hash_of(1)).unwrap();
    list.put(5, &hash_of(2)).unwrap();
    assert_eq!(list.get(5), Some(hash_of(2)));
}

#[test]
fn test_clear_range() {
    let list = HashList::with_chunk_size(8);
    for i in 0..30 {
        list.put(i, &hash_of(i)).unwrap();
    }

    assert_eq!(list.clear_range(10..25), 15);
    for i in 0..30 {
        assert_eq!(list.get(i).is_some(), !(10..25).contains(&i), "index {}", i);
    }
    assert_eq!(list.clear_range(10..25), 0);
    assert_eq!(list.clear_range(100..200), 0);

    list.put(12, &hash_of(99)).unwrap();
    assert_eq!(list.get(12), Some(hash_of(99)));
    assert_eq!(list.entries().len(), 16);
}

#[test]
fn test_put_beyond_capacity_rejected() {
    let list = HashList::with_chunk_size(8);
    let err = list.put(i64::MAX as u64, &hash_of(1)).unwrap_err();
    assert!(err.is_precondition_violation());
    assert!(list.entries().is_empty());

    list.put(list.capacity() - 1, &hash_of(2)).unwrap();
    assert_eq!(list.get(list.capacity() - 1), Some(hash_of(2)));
}

// =============================================================================
// Snapshots
// =============================================================================

#[test]
fn test_snapshot_roundtrip() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("hashes.bin");

    let list = HashList::with_chunk_size(8);
    for i in [0u64, 1, 17, 63] {
        list.put(i, &hash_of(i)).unwrap();
    }
    assert_eq!(list.save_snapshot(&path).unwrap(), 4);

    let loaded = HashList::load_snapshot(&path, 16).unwrap();
    assert_eq!(loaded.entries(), list.entries());
    assert_eq!(loaded.get(17), Some(hash_of(17)));
    assert_eq!(loaded.get(2), None);
}

#[test]
fn test_snapshot_crc_mismatch_is_corruption() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("hashes.bin");

    let list = HashList::with_chunk_size(8);
    list.put(2, &hash_of(2)).unwrap();
    list.save_snapshot(&path).unwrap();

    let mut bytes = fs::read(&path).unwrap();
    bytes[16 + 10] ^= 0xFF;
    fs::write(&path, &bytes).unwrap();

    assert!(matches!(
        HashList::load_snapshot(&path, 8),
        Err(StoreError::Corruption(_))
    ));
}

#[test]
fn test_snapshot_bad_magic_is_corruption() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("hashes.bin");
    fs::write(&path, [0u8; 32]).unwrap();

    assert!(matches!(
        HashList::load_snapshot(&path, 8),
        Err(StoreError::Corruption(_))
    ));
}

// =============================================================================
// Concurrency
// =============================================================================

#[test]
fn test_readers_never_see_torn_hash() {
    let list = Arc::new(HashList::with_chunk_size(4));
    let done = Arc::new(AtomicBool::new(false));
    let candidates: Vec<Hash> = (0..50).map(hash_of).collect();

    let readers: Vec<_> = (0..3)
        .map(|_| {
            let list = Arc::clone(&list);
            let done = Arc::clone(&done);
            let candidates = candidates.clone();
            thread::spawn(move || {
                while !done.load(Ordering::Acquire) {
                    if let Some(h) = list.get(0) {
                        assert!(candidates.contains(&h), "torn hash {:?}", h);
                    }
                }
            })
        })
        .collect();

    for _ in 0..200 {
        for h in &candidates {
            list.put(0, h).unwrap();
        }
    }
    done.store(true, Ordering::Release);
    for reader in readers {
        reader.join().unwrap();
    }
}

#[test]
fn test_readers_see_whole_hash_or_nothing_while_clearing() {
    let list = Arc::new(HashList::with_chunk_size(4));
    let done = Arc::new(AtomicBool::new(false));
    let candidates: Vec<Hash> = (0..20).map(hash_of).collect();

    let reader = {
        let list = Arc::clone(&list);
        let done = Arc::clone(&done);
        let candidates = candidates.clone();
        thread::spawn(move || {
            while !done.load(Ordering::Acquire) {
                if let Some(h) = list.get(1) {
                    assert!(candidates.contains(&h), "torn hash {:?}", h);
                }
            }
        })
    };

    for _ in 0..500 {
        for h in &candidates {
            list.put(1, h).unwrap();
            list.clear_range(0..2);
        }
    }
    done.store(true, Ordering::Release);
    reader.join().unwrap();
    assert_eq!(list.get(1), None);
}
