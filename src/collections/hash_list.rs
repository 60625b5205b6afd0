//! Off-heap list of fixed-width hashes
//!
//! Holds shallow internal-node hashes. Each slot is seven `AtomicU64` words:
//! a sequence word followed by the 48-byte digest. The sequence works as a
//! per-slot seqlock:
//!
//! ```text
//! bits 63..2  update counter (bumped by every put and clear)
//! bit 1       CLEARED: slot holds nothing
//! bit 0       BUSY: writer is mid-update
//! ```
//!
//! A zero word means the slot was never written. Readers detect "absent" and
//! "being rewritten" without taking a lock, and the counter keeps a clear
//! followed by a put from looking unchanged to a reader caught in between.
//!
//! ## Snapshot File Format
//! ```text
//! ┌────────────┬────────────┬─────────────┬─────────────┐
//! │ Magic (4)  │ Version(2) │ Reserved(2) │ Count (8)   │
//! ├────────────┴────────────┴─────────────┴─────────────┤
//! │ [Index: u64][Hash: 48 bytes]  ... Count times       │
//! ├─────────────────────────────────────────────────────┤
//! │ CRC32 of entries (4)                                │
//! └─────────────────────────────────────────────────────┘
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::ops::Range;
use std::path::Path;
use std::sync::atomic::{fence, AtomicU64, Ordering};

use crate::error::{Result, StoreError};
use crate::record::{Hash, HASH_SIZE};

use super::chunks::ChunkDirectory;

/// Words per digest
const HASH_WORDS: usize = HASH_SIZE / 8;

/// Sequence word + digest words
const SLOT_WORDS: usize = HASH_WORDS + 1;

const SEQ_BUSY: u64 = 1;
const SEQ_CLEARED: u64 = 2;
const SEQ_STEP: u64 = 4;

/// Default slots per chunk
pub const DEFAULT_HASH_CHUNK_SIZE: usize = 16 * 1024;

const SNAPSHOT_MAGIC: &[u8; 4] = b"VMRH";
const SNAPSHOT_VERSION: u16 = 1;
const SNAPSHOT_HEADER_SIZE: usize = 16;

struct HashChunk {
    words: Box<[AtomicU64]>,
}

impl HashChunk {
    fn new(slots: usize) -> Self {
        let words = (0..slots * SLOT_WORDS).map(|_| AtomicU64::new(0)).collect();
        Self { words }
    }

    fn slot(&self, slot: usize) -> &[AtomicU64] {
        &self.words[slot * SLOT_WORDS..(slot + 1) * SLOT_WORDS]
    }
}

/// Growable off-heap list of hashes addressed by index
pub struct HashList {
    chunks: ChunkDirectory<HashChunk>,

    /// One past the highest index ever written
    size: AtomicU64,
}

impl HashList {
    pub fn new() -> Self {
        Self::with_chunk_size(DEFAULT_HASH_CHUNK_SIZE)
    }

    pub fn with_chunk_size(chunk_size: usize) -> Self {
        Self {
            chunks: ChunkDirectory::new(chunk_size),
            size: AtomicU64::new(0),
        }
    }

    /// Read the hash at `index`
    pub fn get(&self, index: u64) -> Option<Hash> {
        let (chunk, slot) = self.chunks.locate(index);
        self.chunks
            .with_chunk(chunk, |c| read_slot(c.slot(slot)))
            .flatten()
    }

    /// Store `hash` at `index`, growing capacity as needed
    ///
    /// Single writer only: the seqlock protects readers, not other writers.
    /// Fails with a precondition violation if `index >= capacity()`.
    pub fn put(&self, index: u64, hash: &Hash) -> Result<()> {
        self.chunks.check_index(index)?;
        let (chunk, slot) = self.chunks.locate(index);
        let chunk = self.chunks.chunk_or_create(chunk, HashChunk::new)?;
        let words = chunk.slot(slot);

        let next = next_sequence(words[0].load(Ordering::Relaxed));
        words[0].store(next | SEQ_BUSY, Ordering::Relaxed);
        fence(Ordering::Release);

        for (i, word) in hash.as_bytes().chunks_exact(8).enumerate() {
            let mut w = [0u8; 8];
            w.copy_from_slice(word);
            words[i + 1].store(u64::from_le_bytes(w), Ordering::Relaxed);
        }

        words[0].store(next, Ordering::Release);
        self.size.fetch_max(index + 1, Ordering::AcqRel);
        Ok(())
    }

    /// Clear every slot in `range`; returns how many held a hash
    pub fn clear_range(&self, range: Range<u64>) -> u64 {
        if range.start >= range.end {
            return 0;
        }
        let chunk_size = self.chunks.chunk_size() as u64;
        let mut cleared = 0;
        for (chunk_index, chunk) in self.chunks.allocated() {
            let chunk_start = chunk_index as u64 * chunk_size;
            let start = range.start.max(chunk_start);
            let end = range.end.min(chunk_start + chunk_size);
            for index in start..end {
                let seq = &chunk.slot((index - chunk_start) as usize)[0];
                let current = seq.load(Ordering::Relaxed);
                if is_absent(current) {
                    continue;
                }
                seq.store(next_sequence(current) | SEQ_CLEARED, Ordering::Release);
                cleared += 1;
            }
        }
        cleared
    }

    /// One past the highest index this list can hold
    pub fn capacity(&self) -> u64 {
        self.chunks.capacity()
    }

    /// One past the highest index ever written
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    /// Snapshot of every stored (index, hash) pair in index order
    pub fn entries(&self) -> Vec<(u64, Hash)> {
        let chunk_size = self.chunks.chunk_size() as u64;
        let mut out = Vec::new();
        for (chunk_index, chunk) in self.chunks.allocated() {
            let base = chunk_index as u64 * chunk_size;
            for slot in 0..chunk_size as usize {
                if let Some(hash) = read_slot(chunk.slot(slot)) {
                    out.push((base + slot as u64, hash));
                }
            }
        }
        out
    }

    // =========================================================================
    // Snapshots
    // =========================================================================

    /// Write every stored hash to `path` (temp file + rename)
    pub fn save_snapshot(&self, path: &Path) -> Result<usize> {
        let entries = self.entries();
        let tmp_path = path.with_extension("tmp");

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        let mut writer = BufWriter::new(file);

        writer.write_all(SNAPSHOT_MAGIC)?;
        writer.write_all(&SNAPSHOT_VERSION.to_le_bytes())?;
        writer.write_all(&[0u8; 2])?;
        writer.write_all(&(entries.len() as u64).to_le_bytes())?;

        let mut hasher = crc32fast::Hasher::new();
        for (index, hash) in &entries {
            let index_bytes = index.to_le_bytes();
            writer.write_all(&index_bytes)?;
            writer.write_all(hash.as_bytes())?;
            hasher.update(&index_bytes);
            hasher.update(hash.as_bytes());
        }
        writer.write_all(&hasher.finalize().to_le_bytes())?;
        writer.flush()?;

        let file = writer
            .into_inner()
            .map_err(|e| StoreError::Storage(format!("Failed to flush hash snapshot: {}", e)))?;
        file.sync_all()?;
        drop(file);

        fs::rename(&tmp_path, path)?;
        Ok(entries.len())
    }

    /// Load a snapshot written by `save_snapshot`
    pub fn load_snapshot(path: &Path, chunk_size: usize) -> Result<Self> {
        let list = Self::with_chunk_size(chunk_size);
        let mut reader = BufReader::new(File::open(path)?);

        let mut header = [0u8; SNAPSHOT_HEADER_SIZE];
        reader.read_exact(&mut header)?;
        if &header[0..4] != SNAPSHOT_MAGIC {
            return Err(StoreError::Corruption(format!(
                "Invalid hash snapshot magic: {:?}",
                &header[0..4]
            )));
        }
        let version = u16::from_le_bytes([header[4], header[5]]);
        if version != SNAPSHOT_VERSION {
            return Err(StoreError::Corruption(format!(
                "Unsupported hash snapshot version: {}",
                version
            )));
        }
        let mut count_bytes = [0u8; 8];
        count_bytes.copy_from_slice(&header[8..16]);
        let count = u64::from_le_bytes(count_bytes);

        let mut hasher = crc32fast::Hasher::new();
        let mut entry = [0u8; 8 + HASH_SIZE];
        for _ in 0..count {
            reader.read_exact(&mut entry)?;
            hasher.update(&entry);
            let mut index_bytes = [0u8; 8];
            index_bytes.copy_from_slice(&entry[0..8]);
            let hash = Hash::from_slice(&entry[8..])?;
            list.put(u64::from_le_bytes(index_bytes), &hash)?;
        }

        let mut crc = [0u8; 4];
        reader.read_exact(&mut crc)?;
        if u32::from_le_bytes(crc) != hasher.finalize() {
            return Err(StoreError::Corruption(format!(
                "Hash snapshot {} failed CRC check",
                path.display()
            )));
        }

        Ok(list)
    }
}

impl Default for HashList {
    fn default() -> Self {
        Self::new()
    }
}

fn is_absent(seq: u64) -> bool {
    seq == 0 || seq & SEQ_CLEARED != 0
}

/// Counter value for the next update of a slot, flags cleared
fn next_sequence(seq: u64) -> u64 {
    (seq & !(SEQ_BUSY | SEQ_CLEARED)).wrapping_add(SEQ_STEP)
}

/// Seqlock read of one slot
fn read_slot(words: &[AtomicU64]) -> Option<Hash> {
    loop {
        let before = words[0].load(Ordering::Acquire);
        if before & SEQ_BUSY != 0 {
            std::hint::spin_loop();
            continue;
        }
        if is_absent(before) {
            return None;
        }

        let mut bytes = [0u8; HASH_SIZE];
        for i in 0..HASH_WORDS {
            let w = words[i + 1].load(Ordering::Relaxed);
            bytes[i * 8..(i + 1) * 8].copy_from_slice(&w.to_le_bytes());
        }

        fence(Ordering::Acquire);
        if words[0].load(Ordering::Relaxed) == before {
            return Some(Hash::new(bytes));
        }
    }
}
