//! Lazily allocated chunk directory shared by the off-heap lists
//!
//! A list is an arena of fixed-size chunks addressed by `index / chunk_size`.
//! The directory (the vector of chunk pointers) is published through
//! `ArcSwap`, so readers load it without locking. Growing the directory
//! copies the pointer vector, never the chunks: a chunk, once allocated,
//! lives for as long as the list and is shared by every directory snapshot.
//!
//! A directory holds at most `MAX_CHUNKS` chunks, which caps a list at
//! `chunk_size * MAX_CHUNKS` slots.

use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;

use crate::error::{Result, StoreError};

/// Upper bound on chunks per list
pub(crate) const MAX_CHUNKS: usize = 1 << 20;

pub(crate) struct ChunkDirectory<C> {
    /// Slots per chunk
    chunk_size: usize,

    /// Published chunk pointers; `None` = never written
    chunks: ArcSwap<Vec<Option<Arc<C>>>>,

    /// Serializes directory growth
    grow_lock: Mutex<()>,
}

impl<C> ChunkDirectory<C> {
    pub(crate) fn new(chunk_size: usize) -> Self {
        assert!(chunk_size > 0, "chunk size must be positive");
        Self {
            chunk_size,
            chunks: ArcSwap::from_pointee(Vec::new()),
            grow_lock: Mutex::new(()),
        }
    }

    pub(crate) fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// One past the highest index the list can hold
    pub(crate) fn capacity(&self) -> u64 {
        (self.chunk_size as u64).saturating_mul(MAX_CHUNKS as u64)
    }

    /// Fail if `index` is beyond the list's capacity
    pub(crate) fn check_index(&self, index: u64) -> Result<()> {
        if index >= self.capacity() {
            return Err(StoreError::precondition(format!(
                "index {} is beyond list capacity {}",
                index,
                self.capacity()
            )));
        }
        Ok(())
    }

    /// Split a list index into (chunk index, slot within chunk)
    pub(crate) fn locate(&self, index: u64) -> (usize, usize) {
        let chunk_size = self.chunk_size as u64;
        ((index / chunk_size) as usize, (index % chunk_size) as usize)
    }

    /// Run `f` against an allocated chunk; `None` if the chunk does not exist
    pub(crate) fn with_chunk<R>(&self, chunk_index: usize, f: impl FnOnce(&C) -> R) -> Option<R> {
        let chunks = self.chunks.load();
        match chunks.get(chunk_index) {
            Some(Some(chunk)) => Some(f(chunk)),
            _ => None,
        }
    }

    /// Fetch a chunk, allocating it (and growing the directory) if needed
    pub(crate) fn chunk_or_create(&self, chunk_index: usize, make: impl FnOnce(usize) -> C) -> Result<Arc<C>> {
        if chunk_index >= MAX_CHUNKS {
            return Err(StoreError::precondition(format!(
                "chunk {} is beyond the {} chunk limit",
                chunk_index, MAX_CHUNKS
            )));
        }
        if let Some(Some(chunk)) = self.chunks.load().get(chunk_index) {
            return Ok(Arc::clone(chunk));
        }

        let _guard = self.grow_lock.lock();

        // Another writer may have allocated it while we waited
        let current = self.chunks.load_full();
        if let Some(Some(chunk)) = current.get(chunk_index) {
            return Ok(Arc::clone(chunk));
        }

        let chunk = Arc::new(make(self.chunk_size));
        let mut next: Vec<Option<Arc<C>>> = (*current).clone();
        if next.len() <= chunk_index {
            next.resize(chunk_index + 1, None);
        }
        next[chunk_index] = Some(Arc::clone(&chunk));
        self.chunks.store(Arc::new(next));
        Ok(chunk)
    }

    /// Snapshot of allocated chunks as (chunk index, chunk)
    pub(crate) fn allocated(&self) -> Vec<(usize, Arc<C>)> {
        self.chunks
            .load()
            .iter()
            .enumerate()
            .filter_map(|(i, c)| c.as_ref().map(|c| (i, Arc::clone(c))))
            .collect()
    }

    /// Number of allocated chunks
    pub(crate) fn allocated_count(&self) -> usize {
        self.chunks.load().iter().filter(|c| c.is_some()).count()
    }
}
