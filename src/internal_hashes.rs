//! Internal Hash Router
//!
//! Internal node hashes are split by path: shallow levels (few nodes, read
//! constantly) stay in a RAM list, deep levels go to a segment store.
//!
//! ```text
//!            path < threshold          path >= threshold
//!   get/put ──────────────────► RAM   ──────────────────► disk
//!                          (HashList)              (IndexedStore)
//! ```
//!
//! The split never moves for the lifetime of a data source. A threshold of
//! `0` disables the RAM tier; `u64::MAX` disables the disk tier. Both tiers
//! drop hashes at or beyond the first leaf path of each saved round, so the
//! answer for a path never depends on which tier holds it.
//!
//! The RAM tier is written to `internal_hashes_ram.bin` on close and loaded
//! back on open. The snapshot is deleted on the first RAM write after open,
//! so an unclean shutdown leaves shallow hashes absent rather than stale.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::BufMut;

use crate::collections::{HashList, DEFAULT_HASH_CHUNK_SIZE};
use crate::error::Result;
use crate::record::{Hash, InternalRecord, HASH_SIZE};
use crate::storage::{IndexedStore, ValidRange};

/// Which sub-store serves a path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashTier {
    Ram,
    Disk,
}

/// Routes internal hash reads and writes between RAM and disk
pub struct InternalHashRouter {
    /// First path served from disk
    threshold: u64,

    /// Shallow hashes, present unless the threshold is 0
    ram: Option<HashList>,

    /// Deep hashes, present unless the threshold is `u64::MAX`
    disk: Option<Arc<IndexedStore>>,

    /// Where the RAM tier is persisted on close
    snapshot_path: PathBuf,

    /// Set once the on-disk snapshot no longer matches the RAM tier
    snapshot_invalidated: AtomicBool,
}

impl InternalHashRouter {
    pub const DISK_DIR: &'static str = "internal_hashes";
    pub const RAM_SNAPSHOT: &'static str = "internal_hashes_ram.bin";

    /// Open both tiers under `root`
    pub fn open(root: &Path, threshold: u64, index_chunk_size: usize) -> Result<Self> {
        let snapshot_path = root.join(Self::RAM_SNAPSHOT);

        let ram = if threshold > 0 {
            if snapshot_path.exists() {
                let list = HashList::load_snapshot(&snapshot_path, DEFAULT_HASH_CHUNK_SIZE)?;
                tracing::info!(hashes = list.entries().len(), "Loaded RAM internal hashes");
                Some(list)
            } else {
                Some(HashList::new())
            }
        } else {
            None
        };

        let disk = if threshold < u64::MAX {
            Some(Arc::new(IndexedStore::open(
                &root.join(Self::DISK_DIR),
                Self::DISK_DIR,
                index_chunk_size,
            )?))
        } else {
            None
        };

        Ok(Self {
            threshold,
            ram,
            disk,
            snapshot_path,
            snapshot_invalidated: AtomicBool::new(false),
        })
    }

    /// The tier that owns `path`
    pub fn tier_for(&self, path: u64) -> HashTier {
        if path < self.threshold {
            HashTier::Ram
        } else {
            HashTier::Disk
        }
    }

    /// Read the hash stored for `path`
    pub fn get(&self, path: u64) -> Result<Option<Hash>> {
        match self.tier_for(path) {
            HashTier::Ram => Ok(self.load_from_ram(path)),
            HashTier::Disk => self.load_from_disk(path),
        }
    }

    /// Read straight from the RAM tier, regardless of the threshold
    pub fn load_from_ram(&self, path: u64) -> Option<Hash> {
        self.ram.as_ref().and_then(|ram| ram.get(path))
    }

    /// Read straight from the disk tier, regardless of the threshold
    pub fn load_from_disk(&self, path: u64) -> Result<Option<Hash>> {
        let Some(disk) = &self.disk else {
            return Ok(None);
        };
        match disk.get(path)? {
            Some(bytes) => Ok(Some(Hash::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Store one round of internal hashes
    ///
    /// `first_leaf_path` bounds the internal paths of the new tree: both
    /// tiers keep `[0, first_leaf_path)` and drop the rest. `None` means the
    /// tree is empty.
    pub fn save_batch(&self, first_leaf_path: Option<u64>, records: &[InternalRecord]) -> Result<()> {
        // Step 1: RAM tier, visible as soon as each slot is written
        if let Some(ram) = &self.ram {
            let internal_end = first_leaf_path.unwrap_or(0);
            let shallow: Vec<&InternalRecord> = records
                .iter()
                .filter(|r| self.tier_for(r.path) == HashTier::Ram)
                .collect();
            if !shallow.is_empty() || ram.size() > internal_end {
                self.invalidate_snapshot()?;
            }
            let dropped = ram.clear_range(internal_end..ram.size());
            if dropped > 0 {
                tracing::debug!(dropped, internal_end, "Pruned RAM internal hashes");
            }
            for record in shallow {
                ram.put(record.path, &record.hash)?;
            }
        }

        // Step 2: disk tier, one segment for the whole round
        if let Some(disk) = &self.disk {
            let mut batch = disk.start_writing()?;
            for record in records.iter().filter(|r| self.tier_for(r.path) == HashTier::Disk) {
                batch
                    .start_streaming_put(record.path, HASH_SIZE)?
                    .put_slice(record.hash.as_bytes());
                batch.end_streaming_put()?;
            }
            let range = match first_leaf_path {
                Some(first) if first > 0 => ValidRange::new(0, first - 1),
                _ => ValidRange::empty(),
            };
            batch.end_writing(range)?;
        }
        Ok(())
    }

    fn invalidate_snapshot(&self) -> Result<()> {
        if !self.snapshot_invalidated.swap(true, Ordering::AcqRel) && self.snapshot_path.exists() {
            fs::remove_file(&self.snapshot_path)?;
        }
        Ok(())
    }

    /// Persist the RAM tier and close the disk tier
    pub fn close(&self) -> Result<()> {
        if let Some(ram) = &self.ram {
            let saved = ram.save_snapshot(&self.snapshot_path)?;
            self.snapshot_invalidated.store(false, Ordering::Release);
            tracing::debug!(hashes = saved, "Saved RAM internal hashes");
        }
        if let Some(disk) = &self.disk {
            disk.close()?;
        }
        Ok(())
    }

    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    /// One past the highest path both tiers can hold
    pub fn capacity(&self) -> u64 {
        let ram = self.ram.as_ref().map_or(u64::MAX, HashList::capacity);
        let disk = self.disk.as_ref().map_or(u64::MAX, |d| d.capacity());
        ram.min(disk)
    }

    /// The disk tier, if any
    pub fn disk_store(&self) -> Option<&Arc<IndexedStore>> {
        self.disk.as_ref()
    }
}
