//! Disk-backed hash map: key bytes → path
//!
//! Keys are hashed (xxh3) into a fixed number of buckets. The bucket index
//! (bucket → location of its newest copy) lives in an off-heap list; bucket
//! contents live in segments. A write batch rewrites each touched bucket
//! once, merging the batch's updates into the bucket's current contents.
//! While a bucket is rewritten, entries whose path left the leaf range or
//! was taken over by another key in the same batch are dropped, so buckets
//! track the live key set instead of every key ever stored.
//!
//! ## Bucket Layout
//! ```text
//! ┌────────────┬──────────────────────────────────────────────────────┐
//! │ Count (4)  │ [KeyHash: u64][Path: u64][KeyLen: u32][Key] × Count   │
//! └────────────┴──────────────────────────────────────────────────────┘
//! ```

use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::xxh3_64;

use crate::error::{Result, StoreError};
use crate::storage::{save_durably, IndexedStore, ValidRange, WriteBatch};

/// Average bucket fill the bucket count is sized for
const GOOD_AVERAGE_BUCKET_ENTRY_COUNT: u64 = 32;

const LAYOUT_FILENAME: &str = "hashmap.meta";

/// Bucket count is fixed when the map is created
#[derive(Debug, Serialize, Deserialize)]
struct MapLayout {
    num_buckets: u64,
}

#[derive(Debug, Clone, PartialEq)]
struct BucketEntry {
    hash: u64,
    path: u64,
    key: Bytes,
}

/// Maps arbitrary key bytes to tree paths
pub struct HalfDiskHashMap {
    num_buckets: u64,
    store: Arc<IndexedStore>,
}

impl HalfDiskHashMap {
    /// Open or create a map sized for `max_keys` distinct keys
    pub fn open(dir: &Path, name: &str, max_keys: u64, index_chunk_size: usize) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let wanted = bucket_count_for(max_keys);
        let num_buckets = match load_layout(dir)? {
            Some(layout) => {
                if layout.num_buckets != wanted {
                    tracing::warn!(
                        map = name,
                        stored = layout.num_buckets,
                        requested = wanted,
                        "Keeping the bucket count the map was created with"
                    );
                }
                layout.num_buckets
            }
            None => {
                save_layout(dir, &MapLayout { num_buckets: wanted })?;
                wanted
            }
        };

        let store = Arc::new(IndexedStore::open(dir, name, index_chunk_size)?);
        if num_buckets > store.capacity() {
            return Err(StoreError::Config(format!(
                "{} buckets exceed the bucket index capacity {}",
                num_buckets,
                store.capacity()
            )));
        }
        Ok(Self { num_buckets, store })
    }

    /// Look up the path stored for `key`
    pub fn get(&self, key: &[u8]) -> Result<Option<u64>> {
        let hash = xxh3_64(key);
        let Some(bytes) = self.store.get(self.bucket_of(hash))? else {
            return Ok(None);
        };
        let entries = decode_bucket(&bytes)?;
        Ok(entries
            .iter()
            .find(|e| e.hash == hash && e.key.as_ref() == key)
            .map(|e| e.path))
    }

    /// Open the single write session of this map
    pub fn start_writing(&self) -> Result<HashMapBatch<'_>> {
        Ok(HashMapBatch {
            map: self,
            batch: self.store.start_writing()?,
            pending: BTreeMap::new(),
            written_paths: HashSet::new(),
        })
    }

    fn bucket_of(&self, hash: u64) -> u64 {
        hash & (self.num_buckets - 1)
    }

    fn read_bucket(&self, bucket: u64) -> Result<Vec<BucketEntry>> {
        match self.store.get(bucket)? {
            Some(bytes) => decode_bucket(&bytes),
            None => Ok(Vec::new()),
        }
    }

    pub fn num_buckets(&self) -> u64 {
        self.num_buckets
    }

    /// The segment store holding the buckets
    pub fn store(&self) -> &Arc<IndexedStore> {
        &self.store
    }

    pub fn close(&self) -> Result<()> {
        self.store.close()
    }
}

/// The open write session of a `HalfDiskHashMap`
pub struct HashMapBatch<'a> {
    map: &'a HalfDiskHashMap,
    batch: WriteBatch<'a>,
    /// bucket → staged (hash, key, path) updates
    pending: BTreeMap<u64, Vec<BucketEntry>>,
    /// Paths assigned a key in this batch
    written_paths: HashSet<u64>,
}

impl HashMapBatch<'_> {
    /// Stage `key → path`; a later put for the same key wins
    pub fn put(&mut self, key: &[u8], path: u64) {
        let hash = xxh3_64(key);
        self.written_paths.insert(path);
        let staged = self.pending.entry(self.map.bucket_of(hash)).or_default();
        upsert(
            staged,
            BucketEntry {
                hash,
                path,
                key: Bytes::copy_from_slice(key),
            },
        );
    }

    /// Rewrite every touched bucket and publish them
    ///
    /// `live_paths` is the leaf range of the round; stored entries outside
    /// it are dropped from the buckets being rewritten.
    pub fn end_writing(mut self, live_paths: ValidRange) -> Result<()> {
        let buckets = self.pending.len();
        let mut dropped = 0;
        for (bucket, updates) in std::mem::take(&mut self.pending) {
            let mut entries = self.map.read_bucket(bucket)?;
            let before = entries.len();
            entries.retain(|e| live_paths.contains(e.path) && !self.written_paths.contains(&e.path));
            dropped += before - entries.len();
            for update in updates {
                upsert(&mut entries, update);
            }
            let bytes = encode_bucket(&entries);
            self.batch.put(bucket, &bytes)?;
        }
        self.batch
            .end_writing(ValidRange::new(0, self.map.num_buckets - 1))?;
        tracing::debug!(store = %self.map.store.name(), buckets, dropped, "Committed hash map batch");
        Ok(())
    }
}

// =============================================================================
// Private Helpers
// =============================================================================

fn bucket_count_for(max_keys: u64) -> u64 {
    (max_keys / GOOD_AVERAGE_BUCKET_ENTRY_COUNT)
        .max(1)
        .next_power_of_two()
}

fn upsert(entries: &mut Vec<BucketEntry>, entry: BucketEntry) {
    match entries
        .iter_mut()
        .find(|e| e.hash == entry.hash && e.key == entry.key)
    {
        Some(existing) => existing.path = entry.path,
        None => entries.push(entry),
    }
}

fn encode_bucket(entries: &[BucketEntry]) -> Bytes {
    let size = 4 + entries.iter().map(|e| 20 + e.key.len()).sum::<usize>();
    let mut buf = BytesMut::with_capacity(size);
    buf.put_u32_le(entries.len() as u32);
    for e in entries {
        buf.put_u64_le(e.hash);
        buf.put_u64_le(e.path);
        buf.put_u32_le(e.key.len() as u32);
        buf.put_slice(&e.key);
    }
    buf.freeze()
}

fn decode_bucket(bytes: &Bytes) -> Result<Vec<BucketEntry>> {
    let mut buf = bytes.clone();
    if buf.remaining() < 4 {
        return Err(bucket_truncated());
    }
    let count = buf.get_u32_le() as usize;
    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        if buf.remaining() < 20 {
            return Err(bucket_truncated());
        }
        let hash = buf.get_u64_le();
        let path = buf.get_u64_le();
        let key_len = buf.get_u32_le() as usize;
        if buf.remaining() < key_len {
            return Err(bucket_truncated());
        }
        let key = buf.split_to(key_len);
        entries.push(BucketEntry { hash, path, key });
    }
    Ok(entries)
}

fn bucket_truncated() -> StoreError {
    StoreError::Corruption("hash map bucket is truncated".to_string())
}

fn layout_path(dir: &Path) -> PathBuf {
    dir.join(LAYOUT_FILENAME)
}

fn load_layout(dir: &Path) -> Result<Option<MapLayout>> {
    let path = layout_path(dir);
    if !path.exists() {
        return Ok(None);
    }
    let layout: MapLayout = bincode::deserialize_from(BufReader::new(File::open(path)?))?;
    if layout.num_buckets == 0 || !layout.num_buckets.is_power_of_two() {
        return Err(StoreError::Corruption(format!(
            "invalid bucket count {} in {}",
            layout.num_buckets,
            dir.display()
        )));
    }
    Ok(Some(layout))
}

fn save_layout(dir: &Path, layout: &MapLayout) -> Result<()> {
    save_durably(&layout_path(dir), layout)
}
