//! Off-heap list of u64 values
//!
//! Densely packed `AtomicU64` slots in lazily allocated chunks. Used for the
//! long-key → path map and as the index of every segment-backed store
//! (locator → packed data location).
//!
//! ## Concurrency
//! - One writer, any number of concurrent readers.
//! - Every slot update is a single atomic store, so a reader sees either the
//!   old or the new value of a slot, never a mix.
//! - `put_if_equal` is a compare-and-swap, which lets the merge thread move
//!   entries without overwriting a newer value the writer just stored.

use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::Result;

use super::chunks::ChunkDirectory;

/// Slot value meaning "nothing stored here"
const NOT_SET: u64 = u64::MAX;

/// Default slots per chunk (512 KiB of u64s)
pub const DEFAULT_LONG_CHUNK_SIZE: usize = 64 * 1024;

struct LongChunk {
    slots: Box<[AtomicU64]>,
}

impl LongChunk {
    fn new(size: usize) -> Self {
        let slots = (0..size).map(|_| AtomicU64::new(NOT_SET)).collect();
        Self { slots }
    }
}

/// Growable off-heap list of u64 values addressed by index
pub struct LongList {
    chunks: ChunkDirectory<LongChunk>,

    /// One past the highest index ever written
    size: AtomicU64,
}

impl LongList {
    pub fn new() -> Self {
        Self::with_chunk_size(DEFAULT_LONG_CHUNK_SIZE)
    }

    pub fn with_chunk_size(chunk_size: usize) -> Self {
        Self {
            chunks: ChunkDirectory::new(chunk_size),
            size: AtomicU64::new(0),
        }
    }

    /// Read the value at `index`
    pub fn get(&self, index: u64) -> Option<u64> {
        let (chunk, slot) = self.chunks.locate(index);
        self.chunks
            .with_chunk(chunk, |c| c.slots[slot].load(Ordering::Acquire))
            .filter(|&v| v != NOT_SET)
    }

    /// Store `value` at `index`, growing capacity as needed
    ///
    /// `u64::MAX` is reserved as the empty marker and cannot be stored.
    /// Fails with a precondition violation if `index >= capacity()`.
    pub fn put(&self, index: u64, value: u64) -> Result<()> {
        debug_assert_ne!(value, NOT_SET, "u64::MAX is reserved");
        self.chunks.check_index(index)?;
        let (chunk, slot) = self.chunks.locate(index);
        let chunk = self.chunks.chunk_or_create(chunk, LongChunk::new)?;
        chunk.slots[slot].store(value, Ordering::Release);
        self.size.fetch_max(index + 1, Ordering::AcqRel);
        Ok(())
    }

    /// Replace the value at `index` only if it currently equals `expected`
    pub fn put_if_equal(&self, index: u64, expected: u64, value: u64) -> bool {
        debug_assert_ne!(value, NOT_SET, "u64::MAX is reserved");
        let (chunk, slot) = self.chunks.locate(index);
        self.chunks
            .with_chunk(chunk, |c| {
                c.slots[slot]
                    .compare_exchange(expected, value, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            })
            .unwrap_or(false)
    }

    /// Clear the slot at `index`, returning what was there
    pub fn remove(&self, index: u64) -> Option<u64> {
        let (chunk, slot) = self.chunks.locate(index);
        self.chunks
            .with_chunk(chunk, |c| c.slots[slot].swap(NOT_SET, Ordering::AcqRel))
            .filter(|&v| v != NOT_SET)
    }

    /// Clear every slot in `range`; unallocated chunks are skipped
    pub fn clear_range(&self, range: Range<u64>) {
        if range.start >= range.end {
            return;
        }
        let chunk_size = self.chunks.chunk_size() as u64;
        for (chunk_index, chunk) in self.chunks.allocated() {
            let chunk_start = chunk_index as u64 * chunk_size;
            let chunk_end = chunk_start + chunk_size;
            let start = range.start.max(chunk_start);
            let end = range.end.min(chunk_end);
            for index in start..end {
                chunk.slots[(index - chunk_start) as usize].store(NOT_SET, Ordering::Release);
            }
        }
    }

    /// One past the highest index this list can hold
    pub fn capacity(&self) -> u64 {
        self.chunks.capacity()
    }

    /// One past the highest index ever written
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    /// Approximate off-heap footprint in bytes
    pub fn allocated_bytes(&self) -> usize {
        self.chunks.allocated_count() * self.chunks.chunk_size() * std::mem::size_of::<u64>()
    }

    /// Snapshot of every set (index, value) pair in index order
    pub fn entries(&self) -> Vec<(u64, u64)> {
        let chunk_size = self.chunks.chunk_size() as u64;
        let mut out = Vec::new();
        for (chunk_index, chunk) in self.chunks.allocated() {
            let base = chunk_index as u64 * chunk_size;
            for (slot, value) in chunk.slots.iter().enumerate() {
                let v = value.load(Ordering::Acquire);
                if v != NOT_SET {
                    out.push((base + slot as u64, v));
                }
            }
        }
        out
    }
}

impl Default for LongList {
    fn default() -> Self {
        Self::new()
    }
}
