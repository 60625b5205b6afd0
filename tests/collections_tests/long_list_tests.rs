//! Tests for LongList
//!
//! These tests verify:
//! - Reads of never-written slots are absent
//! - Lazy growth across chunks
//! - Compare-and-swap updates
//! - Range clearing
//! - Capacity bound
//! - Concurrent readers against one writer

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use proptest::prelude::*;
use vmstore::collections::LongList;

// =============================================================================
// Basic Operations
// =============================================================================

#[test]
fn test_empty_list_reads_absent() {
    let list = LongList::with_chunk_size(16);
    assert_eq!(list.get(0), None);
    assert_eq!(list.get(1_000_000), None);
    assert_eq!(list.size(), 0);
    assert_eq!(list.allocated_bytes(), 0);
}

#[test]
fn test_put_and_get() {
    let list = LongList::with_chunk_size(16);
    list.put(3, 42).unwrap();
    list.put(0, 0).unwrap();

    assert_eq!(list.get(3), Some(42));
    assert_eq!(list.get(0), Some(0));
    assert_eq!(list.get(1), None);
    assert_eq!(list.size(), 4);
}

#[test]
fn test_overwrite() {
    let list = LongList::new();
    list.put(7, 1).unwrap();
    list.put(7, 2).unwrap();
    assert_eq!(list.get(7), Some(2));
}

#[test]
fn test_put_beyond_capacity_rejected() {
    let list = LongList::with_chunk_size(16);
    let capacity = list.capacity();
    assert!(capacity > 0);

    let err = list.put(i64::MAX as u64, 1).unwrap_err();
    assert!(err.is_precondition_violation());
    assert!(list.put(capacity, 1).unwrap_err().is_precondition_violation());
    assert_eq!(list.size(), 0);
    assert_eq!(list.allocated_bytes(), 0);

    list.put(capacity - 1, 7).unwrap();
    assert_eq!(list.get(capacity - 1), Some(7));
    assert_eq!(list.get(u64::MAX - 1), None);
}

#[test]
fn test_growth_allocates_only_touched_chunks() {
    let list = LongList::with_chunk_size(16);
    list.put(5, 1).unwrap();
    list.put(16 * 10 + 2, 2).unwrap();

    assert_eq!(list.get(5), Some(1));
    assert_eq!(list.get(162), Some(2));
    assert_eq!(list.get(100), None);
    assert_eq!(list.size(), 163);
    assert_eq!(list.allocated_bytes(), 2 * 16 * 8);
}

#[test]
fn test_remove() {
    let list = LongList::with_chunk_size(16);
    list.put(9, 90).unwrap();
    assert_eq!(list.remove(9), Some(90));
    assert_eq!(list.remove(9), None);
    assert_eq!(list.get(9), None);
    assert_eq!(list.remove(500), None);
}

// =============================================================================
// Compare-and-Swap
// =============================================================================

#[test]
fn test_put_if_equal_succeeds_on_match() {
    let list = LongList::with_chunk_size(16);
    list.put(4, 10).unwrap();
    assert!(list.put_if_equal(4, 10, 11));
    assert_eq!(list.get(4), Some(11));
}

#[test]
fn test_put_if_equal_keeps_newer_value() {
    let list = LongList::with_chunk_size(16);
    list.put(4, 10).unwrap();
    list.put(4, 12).unwrap();
    assert!(!list.put_if_equal(4, 10, 11));
    assert_eq!(list.get(4), Some(12));
}

#[test]
fn test_put_if_equal_on_unallocated_chunk_fails() {
    let list = LongList::with_chunk_size(16);
    assert!(!list.put_if_equal(100, 0, 1));
    assert_eq!(list.get(100), None);
}

// =============================================================================
// Range Clearing
// =============================================================================

#[test]
fn test_clear_range_across_chunks() {
    let list = LongList::with_chunk_size(4);
    for i in 0..20 {
        list.put(i, i + 100).unwrap();
    }
    list.clear_range(3..13);

    for i in 0..20 {
        let expected = if (3..13).contains(&i) { None } else { Some(i + 100) };
        assert_eq!(list.get(i), expected, "index {}", i);
    }
}

#[test]
fn test_clear_empty_range_is_noop() {
    let list = LongList::with_chunk_size(4);
    list.put(2, 5).unwrap();
    list.clear_range(2..2);
    list.clear_range(5..1);
    assert_eq!(list.get(2), Some(5));
}

#[test]
fn test_entries_in_index_order() {
    let list = LongList::with_chunk_size(4);
    list.put(9, 1).unwrap();
    list.put(1, 2).unwrap();
    list.put(5, 3).unwrap();
    assert_eq!(list.entries(), vec![(1, 2), (5, 3), (9, 1)]);
}

// =============================================================================
// Concurrency
// =============================================================================

#[test]
fn test_readers_see_whole_values_while_writer_grows() {
    let list = Arc::new(LongList::with_chunk_size(32));
    let done = Arc::new(AtomicBool::new(false));

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let list = Arc::clone(&list);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                while !done.load(Ordering::Acquire) {
                    for i in 0..2_000u64 {
                        if let Some(v) = list.get(i) {
                            // Writer only ever stores i * 3 or i * 3 + 1
                            assert!(v == i * 3 || v == i * 3 + 1, "torn value {} at {}", v, i);
                        }
                    }
                }
            })
        })
        .collect();

    for i in 0..2_000u64 {
        list.put(i, i * 3).unwrap();
    }
    for i in 0..2_000u64 {
        list.put(i, i * 3 + 1).unwrap();
    }
    done.store(true, Ordering::Release);

    for reader in readers {
        reader.join().unwrap();
    }
    assert_eq!(list.get(1_999), Some(1_999 * 3 + 1));
}

// =============================================================================
// Model Check
// =============================================================================

#[derive(Debug, Clone)]
enum Op {
    Put(u64, u64),
    Remove(u64),
    Clear(u64, u64),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u64..300, 0u64..1_000_000).prop_map(|(i, v)| Op::Put(i, v)),
        (0u64..300).prop_map(Op::Remove),
        (0u64..300, 0u64..40).prop_map(|(s, len)| Op::Clear(s, s + len)),
    ]
}

proptest! {
    #[test]
    fn prop_matches_btreemap(ops in prop::collection::vec(op(), 1..200)) {
        let list = LongList::with_chunk_size(8);
        let mut model = BTreeMap::new();

        for op in ops {
            match op {
                Op::Put(i, v) => {
                    list.put(i, v).unwrap();
                    model.insert(i, v);
                }
                Op::Remove(i) => {
                    prop_assert_eq!(list.remove(i), model.remove(&i));
                }
                Op::Clear(start, end) => {
                    list.clear_range(start..end);
                    model.retain(|k, _| !(start..end).contains(k));
                }
            }
        }

        for i in 0..340 {
            prop_assert_eq!(list.get(i), model.get(&i).copied());
        }
        prop_assert_eq!(list.entries(), model.into_iter().collect::<Vec<_>>());
    }
}
