//! Tests for HalfDiskHashMap
//!
//! These tests verify:
//! - Batch put / get with collisions inside buckets
//! - Later batches update existing keys
//! - Rewritten buckets drop entries for removed or reassigned paths
//! - Persistence of buckets and bucket count across reopen
//! - Single writer per map

use std::fs;

use tempfile::TempDir;
use vmstore::collections::HalfDiskHashMap;
use vmstore::storage::ValidRange;

// =============================================================================
// Helper Functions
// =============================================================================

fn open_map(temp: &TempDir, max_keys: u64) -> HalfDiskHashMap {
    HalfDiskHashMap::open(&temp.path().join("key_to_path"), "key_to_path", max_keys, 64).unwrap()
}

fn key(i: u64) -> Vec<u8> {
    format!("key-{:05}", i).into_bytes()
}

// =============================================================================
// Basic Operations
// =============================================================================

#[test]
fn test_get_on_empty_map() {
    let temp = TempDir::new().unwrap();
    let map = open_map(&temp, 1000);
    assert_eq!(map.get(b"missing").unwrap(), None);
    assert_eq!(map.num_buckets(), 32);
}

#[test]
fn test_put_is_invisible_until_end_writing() {
    let temp = TempDir::new().unwrap();
    let map = open_map(&temp, 1000);

    let mut batch = map.start_writing().unwrap();
    batch.put(b"alpha", 7);
    assert_eq!(map.get(b"alpha").unwrap(), None);
    batch.end_writing(ValidRange::all()).unwrap();

    assert_eq!(map.get(b"alpha").unwrap(), Some(7));
}

#[test]
fn test_many_keys_share_buckets() {
    let temp = TempDir::new().unwrap();
    // 1 bucket: every key collides
    let map = open_map(&temp, 10);
    assert_eq!(map.num_buckets(), 1);

    let mut batch = map.start_writing().unwrap();
    for i in 0..200 {
        batch.put(&key(i), i * 2);
    }
    batch.end_writing(ValidRange::all()).unwrap();

    for i in 0..200 {
        assert_eq!(map.get(&key(i)).unwrap(), Some(i * 2));
    }
    assert_eq!(map.get(&key(999)).unwrap(), None);
}

#[test]
fn test_later_batch_updates_and_keeps_other_keys() {
    let temp = TempDir::new().unwrap();
    let map = open_map(&temp, 64);

    let mut batch = map.start_writing().unwrap();
    for i in 0..50 {
        batch.put(&key(i), i);
    }
    batch.end_writing(ValidRange::all()).unwrap();

    let mut batch = map.start_writing().unwrap();
    batch.put(&key(10), 1010);
    batch.put(&key(10), 2020);
    batch.put(&key(60), 60);
    batch.end_writing(ValidRange::all()).unwrap();

    assert_eq!(map.get(&key(10)).unwrap(), Some(2020));
    assert_eq!(map.get(&key(11)).unwrap(), Some(11));
    assert_eq!(map.get(&key(60)).unwrap(), Some(60));
}

#[test]
fn test_rewritten_bucket_drops_paths_outside_leaf_range() {
    let temp = TempDir::new().unwrap();
    let map = open_map(&temp, 10);

    let mut batch = map.start_writing().unwrap();
    for i in 0..20 {
        batch.put(&key(i), i);
    }
    batch.end_writing(ValidRange::new(0, 19)).unwrap();
    let full = map.store().disk_bytes();

    // Tree shrank to paths 10..=19; the single bucket is rewritten
    let mut batch = map.start_writing().unwrap();
    batch.put(&key(15), 15);
    batch.end_writing(ValidRange::new(10, 19)).unwrap();

    for i in 0..10 {
        assert_eq!(map.get(&key(i)).unwrap(), None, "key {}", i);
    }
    for i in 10..20 {
        assert_eq!(map.get(&key(i)).unwrap(), Some(i));
    }
    let segments = map.store().segments();
    assert!(segments.last().unwrap().file_size < full);
}

#[test]
fn test_reassigned_path_drops_previous_key() {
    let temp = TempDir::new().unwrap();
    let map = open_map(&temp, 10);

    let mut batch = map.start_writing().unwrap();
    batch.put(b"old", 4);
    batch.put(b"stays", 5);
    batch.end_writing(ValidRange::all()).unwrap();

    let mut batch = map.start_writing().unwrap();
    batch.put(b"new", 4);
    batch.end_writing(ValidRange::all()).unwrap();

    assert_eq!(map.get(b"new").unwrap(), Some(4));
    assert_eq!(map.get(b"old").unwrap(), None);
    assert_eq!(map.get(b"stays").unwrap(), Some(5));
}

#[test]
fn test_key_churn_keeps_bucket_bounded() {
    let temp = TempDir::new().unwrap();
    let map = open_map(&temp, 10);

    // Each round the leaves 0..8 are held by a fresh set of keys
    for round in 0..50u64 {
        let mut batch = map.start_writing().unwrap();
        for path in 0..8 {
            batch.put(&key(round * 8 + path), path);
        }
        batch.end_writing(ValidRange::new(0, 7)).unwrap();
    }

    for path in 0..8 {
        assert_eq!(map.get(&key(49 * 8 + path)).unwrap(), Some(path));
        assert_eq!(map.get(&key(path)).unwrap(), None);
    }
    // One bucket of 8 entries, not 400
    let newest = map.store().segments().last().unwrap().file_size;
    assert!(newest < 1024, "bucket grew to {} bytes", newest);
}

#[test]
fn test_second_writer_is_rejected() {
    let temp = TempDir::new().unwrap();
    let map = open_map(&temp, 64);

    let _batch = map.start_writing().unwrap();
    let err = map.start_writing().err().unwrap();
    assert!(err.is_precondition_violation());
}

#[test]
fn test_dropped_batch_changes_nothing() {
    let temp = TempDir::new().unwrap();
    let map = open_map(&temp, 64);
    {
        let mut batch = map.start_writing().unwrap();
        batch.put(b"ghost", 1);
    }
    assert_eq!(map.get(b"ghost").unwrap(), None);

    // The writer slot is free again
    let mut batch = map.start_writing().unwrap();
    batch.put(b"real", 2);
    batch.end_writing(ValidRange::all()).unwrap();
    assert_eq!(map.get(b"real").unwrap(), Some(2));
}

// =============================================================================
// Persistence
// =============================================================================

#[test]
fn test_reopen_keeps_mappings_and_bucket_count() {
    let temp = TempDir::new().unwrap();
    {
        let map = open_map(&temp, 1000);
        let mut batch = map.start_writing().unwrap();
        for i in 0..100 {
            batch.put(&key(i), i + 1);
        }
        batch.end_writing(ValidRange::all()).unwrap();
        map.close().unwrap();
    }

    // A different size hint must not re-bucket existing data
    let map = open_map(&temp, 1_000_000);
    assert_eq!(map.num_buckets(), 32);
    for i in 0..100 {
        assert_eq!(map.get(&key(i)).unwrap(), Some(i + 1));
    }
}

#[test]
fn test_layout_written_without_leftover_temp_file() {
    let temp = TempDir::new().unwrap();
    let dir = temp.path().join("key_to_path");
    {
        let map = open_map(&temp, 1000);
        map.close().unwrap();
    }

    assert!(dir.join("hashmap.meta").is_file());
    assert!(!dir.join("hashmap.meta.tmp").exists());

    // A stale temp file from an interrupted write is ignored
    fs::write(dir.join("hashmap.meta.tmp"), b"").unwrap();
    let map = open_map(&temp, 1000);
    assert_eq!(map.num_buckets(), 32);
}
