//! Tests for internal hash routing
//!
//! These tests verify:
//! - Paths below the threshold live in RAM, the rest on disk
//! - The all-RAM and all-disk extremes
//! - Hashes beyond the internal range are dropped in either tier
//! - The RAM tier snapshot written on close

use tempfile::TempDir;
use vmstore::{
    Config, DataSize, HashTier, InternalHashRouter, VirtualDataSource, ALL_INTERNAL_HASHES_IN_RAM,
    ALL_INTERNAL_HASHES_ON_DISK,
};

#[path = "../common/mod.rs"]
mod common;

use common::{hash_of, internal, long_leaf, BytesValue, LongKey};

// =============================================================================
// Helper Functions
// =============================================================================

fn open_source(temp: &TempDir, threshold: u64) -> VirtualDataSource<LongKey, BytesValue> {
    let config = Config::builder()
        .storage_dir(temp.path())
        .key_size(DataSize::Fixed(8))
        .ram_to_disk_threshold(threshold)
        .index_chunk_size(32)
        .merging_enabled(false)
        .build();
    VirtualDataSource::open(config).unwrap()
}

// =============================================================================
// Routing Through the Data Source
// =============================================================================

#[test]
fn test_threshold_routing() {
    let temp = TempDir::new().unwrap();
    let source = open_source(&temp, 100);

    let a = hash_of(50);
    let b = hash_of(150);
    source
        .save_records(
            200,
            200,
            &[vmstore::InternalRecord::new(50, a), vmstore::InternalRecord::new(150, b)],
            &[long_leaf(200, 1, "leaf")],
        )
        .unwrap();

    assert_eq!(source.load_internal_hash(50).unwrap(), Some(a));
    assert_eq!(source.load_internal_hash(150).unwrap(), Some(b));

    let router = source.internal_hashes();
    assert_eq!(router.tier_for(50), HashTier::Ram);
    assert_eq!(router.tier_for(150), HashTier::Disk);
    assert_eq!(router.load_from_ram(50), Some(a));
    assert_eq!(router.load_from_disk(50).unwrap(), None);
    assert_eq!(router.load_from_disk(150).unwrap(), Some(b));
    assert_eq!(router.load_from_ram(150), None);
}

#[test]
fn test_every_path_stored_in_its_tier() {
    let temp = TempDir::new().unwrap();
    let threshold = 37;
    let source = open_source(&temp, threshold);

    let internals: Vec<_> = (0..80).map(internal).collect();
    source.save_records(80, 80, &internals, &[long_leaf(80, 5, "x")]).unwrap();

    let router = source.internal_hashes();
    for record in &internals {
        assert_eq!(source.load_internal_hash(record.path as i64).unwrap(), Some(record.hash));
        if record.path < threshold {
            assert_eq!(router.load_from_ram(record.path), Some(record.hash));
        } else {
            assert_eq!(router.load_from_disk(record.path).unwrap(), Some(record.hash));
        }
    }
}

#[test]
fn test_all_in_ram() {
    let temp = TempDir::new().unwrap();
    let source = open_source(&temp, ALL_INTERNAL_HASHES_IN_RAM);

    source.save_records(3, 3, &[internal(0), internal(2)], &[]).unwrap();

    let router = source.internal_hashes();
    assert!(router.disk_store().is_none());
    assert!(!temp.path().join(InternalHashRouter::DISK_DIR).exists());
    assert_eq!(router.tier_for(u64::MAX - 1), HashTier::Ram);
    assert_eq!(source.load_internal_hash(2).unwrap(), Some(hash_of(2)));
    assert_eq!(source.load_internal_hash(1).unwrap(), None);
}

#[test]
fn test_all_on_disk() {
    let temp = TempDir::new().unwrap();
    let source = open_source(&temp, ALL_INTERNAL_HASHES_ON_DISK);

    source.save_records(3, 3, &[internal(0), internal(2)], &[]).unwrap();

    let router = source.internal_hashes();
    assert_eq!(router.tier_for(0), HashTier::Disk);
    assert_eq!(router.load_from_ram(0), None);
    assert_eq!(router.load_from_disk(0).unwrap(), Some(hash_of(0)));
    assert_eq!(source.load_internal_hash(2).unwrap(), Some(hash_of(2)));
}

#[test]
fn test_disk_hashes_beyond_internal_range_dropped() {
    let temp = TempDir::new().unwrap();
    let source = open_source(&temp, 0);

    let internals: Vec<_> = (0..6).map(internal).collect();
    source.save_records(6, 12, &internals, &[]).unwrap();
    assert_eq!(source.load_internal_hash(5).unwrap(), Some(hash_of(5)));

    // Tree shrinks: only paths 0..2 are internal now
    source.save_records(2, 4, &[internal(0), internal(1)], &[]).unwrap();
    assert_eq!(source.load_internal_hash(1).unwrap(), Some(hash_of(1)));
    assert_eq!(source.load_internal_hash(5).unwrap(), None);
}

#[test]
fn test_ram_hashes_beyond_internal_range_dropped() {
    for threshold in [ALL_INTERNAL_HASHES_IN_RAM, 3, ALL_INTERNAL_HASHES_ON_DISK] {
        let temp = TempDir::new().unwrap();
        let source = open_source(&temp, threshold);

        let internals: Vec<_> = (0..6).map(internal).collect();
        source.save_records(6, 12, &internals, &[]).unwrap();

        source.save_records(2, 4, &[internal(0), internal(1)], &[]).unwrap();
        for path in 0..2 {
            assert_eq!(source.load_internal_hash(path).unwrap(), Some(hash_of(path as u64)));
        }
        for path in 2..6 {
            assert_eq!(source.load_internal_hash(path).unwrap(), None, "threshold {} path {}", threshold, path);
        }
    }
}

#[test]
fn test_pruned_ram_hashes_stay_gone_after_reopen() {
    let temp = TempDir::new().unwrap();
    {
        let source = open_source(&temp, ALL_INTERNAL_HASHES_IN_RAM);
        let internals: Vec<_> = (0..6).map(internal).collect();
        source.save_records(6, 12, &internals, &[]).unwrap();
        source.save_records(2, 4, &[internal(0), internal(1)], &[]).unwrap();
        source.close().unwrap();
    }

    let source = open_source(&temp, ALL_INTERNAL_HASHES_IN_RAM);
    assert_eq!(source.load_internal_hash(1).unwrap(), Some(hash_of(1)));
    assert_eq!(source.load_internal_hash(5).unwrap(), None);
    assert_eq!(source.internal_hashes().load_from_ram(5), None);
}

#[test]
fn test_empty_tree_drops_ram_hashes() {
    let temp = TempDir::new().unwrap();
    let source = open_source(&temp, ALL_INTERNAL_HASHES_IN_RAM);

    source.save_records(3, 3, &[internal(0), internal(2)], &[]).unwrap();
    source.save_records(-1, -1, &[], &[]).unwrap();
    assert_eq!(source.load_internal_hash(0).unwrap(), None);
    assert_eq!(source.load_internal_hash(2).unwrap(), None);
}

// =============================================================================
// Router Lifecycle
// =============================================================================

#[test]
fn test_ram_snapshot_round_trip() {
    let temp = TempDir::new().unwrap();
    {
        let router = InternalHashRouter::open(temp.path(), 10, 32).unwrap();
        router.save_batch(Some(20), &(0..20).map(internal).collect::<Vec<_>>()).unwrap();
        router.close().unwrap();
    }
    assert!(temp.path().join(InternalHashRouter::RAM_SNAPSHOT).exists());

    let router = InternalHashRouter::open(temp.path(), 10, 32).unwrap();
    for path in 0..20 {
        assert_eq!(router.get(path).unwrap(), Some(hash_of(path)));
    }
}

#[test]
fn test_snapshot_dropped_on_first_write_after_open() {
    let temp = TempDir::new().unwrap();
    {
        let router = InternalHashRouter::open(temp.path(), ALL_INTERNAL_HASHES_IN_RAM, 32).unwrap();
        router.save_batch(Some(4), &(0..4).map(internal).collect::<Vec<_>>()).unwrap();
        router.close().unwrap();
    }

    let router = InternalHashRouter::open(temp.path(), ALL_INTERNAL_HASHES_IN_RAM, 32).unwrap();
    let snapshot = temp.path().join(InternalHashRouter::RAM_SNAPSHOT);
    assert!(snapshot.exists());

    router.save_batch(Some(4), &[internal(1)]).unwrap();
    assert!(!snapshot.exists());

    router.close().unwrap();
    assert!(snapshot.exists());
}

#[test]
fn test_negative_internal_path_rejected() {
    let temp = TempDir::new().unwrap();
    let source = open_source(&temp, 100);
    let err = source.load_internal_hash(-1).unwrap_err();
    assert!(err.is_precondition_violation());
}
