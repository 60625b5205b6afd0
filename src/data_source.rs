//! Virtual Data Source
//!
//! The facade the merkle tree talks to. Composes three stores:
//!
//! ```text
//! {storage_dir}/
//!   ├── path_to_leaf/     path → [key, hash, value]   IndexedStore
//!   ├── key_to_path/      key  → path                 HalfDiskHashMap (object keys)
//!   │                                                 LongList in RAM (long keys)
//!   └── internal_hashes/  path → hash (deep levels)   InternalHashRouter
//! ```
//!
//! ## Commit Protocol
//! `save_records` validates the whole round, then writes the three stores in
//! parallel and returns only after all three have committed. That barrier
//! is the only cross-store consistency point: once it returns the round is
//! durable and visible; if it fails the round must be treated as lost.
//!
//! ## Concurrency Model
//! - Reads: any thread, no locks, never wait for writers or merges
//! - Writes: one `save_records` at a time (`write_lock`)
//! - Merges: one background thread, at most one merge per store

use std::marker::PhantomData;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::collections::{HalfDiskHashMap, LongList};
use crate::config::Config;
use crate::error::{Result, StoreError};
use crate::internal_hashes::InternalHashRouter;
use crate::merge::{merge_stores, MergeScheduler, MergeTier};
use crate::record::{Hash, InternalRecord, LeafCodec, LeafRecord, StoreKey, StoreValue};
use crate::storage::{IndexedStore, MergeStats, ValidRange};

/// Single-record entry points that no longer exist
///
/// Records are only ever written a whole round at a time through
/// `save_records`; these are kept so old call sites fail loudly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegacyOperation {
    LoadLeafValue,
    LoadLeafKey,
    LoadLeafPath,
    SaveInternal,
    UpdateLeaf,
    AddLeaf,
    StartTransaction,
    CommitTransaction,
}

/// key → path index, chosen by key layout
enum KeyIndex {
    /// Keys are u64 values below `max_key_count`
    Long(LongList),
    /// Arbitrary keys
    Hashed(HalfDiskHashMap),
}

/// One leaf record prepared for writing
struct EncodedLeaf {
    path: u64,
    record: Bytes,
    key: EncodedKey,
}

enum EncodedKey {
    Long(u64),
    Bytes(Bytes),
}

/// Storage engine for a virtual merkle tree
pub struct VirtualDataSource<K, V> {
    config: Config,
    codec: LeafCodec,

    /// path → leaf record
    leaves: Arc<IndexedStore>,

    /// key → path
    key_index: KeyIndex,

    /// path → internal hash
    hashes: InternalHashRouter,

    /// None when merging is disabled or after close
    scheduler: Option<MergeScheduler>,

    /// Serializes save_records
    write_lock: Mutex<()>,

    _records: PhantomData<fn() -> (K, V)>,
}

impl<K: StoreKey, V: StoreValue> VirtualDataSource<K, V> {
    // =========================================================================
    // Internal Path Constants
    // =========================================================================
    const LEAF_DIR: &'static str = "path_to_leaf";
    const KEY_DIR: &'static str = "key_to_path";

    /// Open or create a data source
    ///
    /// On startup:
    /// 1. Validate the config and create the storage root
    /// 2. Open the leaf store (rebuilds its index from segments)
    /// 3. Open the key index; long keys are rebuilt from the live leaves
    /// 4. Open the internal hash tiers
    /// 5. Start the merge scheduler if enabled
    pub fn open(config: Config) -> Result<Self> {
        // Step 1: Validate and create root
        config.validate()?;
        std::fs::create_dir_all(&config.storage_dir)?;
        let codec = LeafCodec::new(config.key_size, config.value_size);

        // Step 2: Leaf store
        let leaves = Arc::new(IndexedStore::open(
            &config.storage_dir.join(Self::LEAF_DIR),
            Self::LEAF_DIR,
            config.index_chunk_size,
        )?);

        // Step 3: Key index
        let key_index = if config.is_long_key_mode() {
            let list = LongList::with_chunk_size(config.index_chunk_size);
            if config.max_key_count > list.capacity() {
                return Err(StoreError::Config(format!(
                    "max_key_count {} exceeds long key index capacity {}",
                    config.max_key_count,
                    list.capacity()
                )));
            }
            let rebuilt = leaves.for_each_live(|path, bytes| {
                let key: K = codec.decode_key_only(bytes)?;
                let long = long_key(&key, config.max_key_count)?;
                list.put(long, path)
            })?;
            tracing::info!(keys = rebuilt, "Rebuilt long key index");
            KeyIndex::Long(list)
        } else {
            KeyIndex::Hashed(HalfDiskHashMap::open(
                &config.storage_dir.join(Self::KEY_DIR),
                Self::KEY_DIR,
                config.max_key_count,
                config.index_chunk_size,
            )?)
        };

        // Step 4: Internal hashes
        let hashes = InternalHashRouter::open(
            &config.storage_dir,
            config.ram_to_disk_threshold,
            config.index_chunk_size,
        )?;

        let mut source = Self {
            config,
            codec,
            leaves,
            key_index,
            hashes,
            scheduler: None,
            write_lock: Mutex::new(()),
            _records: PhantomData,
        };

        // Step 5: Background merging
        if source.config.merging_enabled {
            source.scheduler = Some(MergeScheduler::start(
                source.merge_targets(),
                source.config.merge.clone(),
            )?);
        }

        tracing::info!(
            dir = %source.config.storage_dir.display(),
            long_keys = source.config.is_long_key_mode(),
            threshold = source.config.ram_to_disk_threshold,
            "Opened virtual data source"
        );
        Ok(source)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Load the leaf currently holding `key`
    pub fn load_leaf_record_by_key(&self, key: &K) -> Result<Option<LeafRecord<K, V>>> {
        let path = match &self.key_index {
            KeyIndex::Long(list) => match key.as_long() {
                Some(long) if long < self.config.max_key_count => list.get(long),
                _ => None,
            },
            KeyIndex::Hashed(map) => map.get(&self.codec.key_bytes(key)?)?,
        };
        let Some(path) = path else {
            return Ok(None);
        };

        // The key may have moved since its index entry was written
        Ok(self
            .read_leaf(path)?
            .filter(|record| &record.key == key))
    }

    /// Load the leaf at `path`
    pub fn load_leaf_record(&self, path: i64) -> Result<Option<LeafRecord<K, V>>> {
        let path = check_path(path)?;
        self.read_leaf(path)
    }

    /// Load only the hash of the leaf at `path`
    pub fn load_leaf_hash(&self, path: i64) -> Result<Option<Hash>> {
        let path = check_path(path)?;
        match self.leaves.get(path)? {
            Some(bytes) => Ok(Some(self.codec.decode_hash(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Load the hash of the internal node at `path`
    pub fn load_internal_hash(&self, path: i64) -> Result<Option<Hash>> {
        let path = check_path(path)?;
        self.hashes.get(path)
    }

    fn read_leaf(&self, path: u64) -> Result<Option<LeafRecord<K, V>>> {
        match self.leaves.get(path)? {
            Some(bytes) => Ok(Some(self.codec.decode(path, &bytes)?)),
            None => Ok(None),
        }
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Commit one round
    ///
    /// `first_leaf_path..=last_leaf_path` is the new leaf frontier; both are
    /// `-1` for an empty tree. Leaves outside the frontier and internal
    /// hashes at or beyond `first_leaf_path` stop being served.
    pub fn save_records(
        &self,
        first_leaf_path: i64,
        last_leaf_path: i64,
        internal_records: &[InternalRecord],
        leaf_records: &[LeafRecord<K, V>],
    ) -> Result<()> {
        // Step 1: Validate everything before any I/O
        let leaf_range = leaf_range(first_leaf_path, last_leaf_path)?;
        if !leaf_range.is_empty() && leaf_range.high() >= self.path_capacity() {
            return Err(StoreError::precondition(format!(
                "last leaf path {} is beyond path capacity {}",
                last_leaf_path,
                self.path_capacity()
            )));
        }
        let first_leaf = (!leaf_range.is_empty()).then(|| leaf_range.low());
        for record in internal_records {
            if first_leaf.map_or(true, |first| record.path >= first) {
                return Err(StoreError::precondition(format!(
                    "internal record path {} is not below first leaf path {}",
                    record.path, first_leaf_path
                )));
            }
        }
        let encoded = self.encode_leaves(&leaf_range, leaf_records)?;

        let _guard = self.write_lock.lock();

        // Step 2: Fan out, join all three
        let (internal_result, key_result, leaf_result) = thread::scope(|s| {
            let internal = s.spawn(|| self.hashes.save_batch(first_leaf, internal_records));
            let keys = s.spawn(|| self.save_key_index(leaf_range, &encoded));
            let leaves = self.save_leaves(leaf_range, &encoded);
            (join_writer(internal, "internal hash"), join_writer(keys, "key index"), leaves)
        });

        // Step 3: Any failed path fails the round
        internal_result?;
        key_result?;
        leaf_result?;

        tracing::debug!(
            first_leaf_path,
            last_leaf_path,
            internal = internal_records.len(),
            leaves = leaf_records.len(),
            "Saved round"
        );
        Ok(())
    }

    fn encode_leaves(&self, range: &ValidRange, records: &[LeafRecord<K, V>]) -> Result<Vec<EncodedLeaf>> {
        records
            .iter()
            .map(|record| {
                if !range.contains(record.path) {
                    return Err(StoreError::precondition(format!(
                        "leaf record path {} is outside the leaf range",
                        record.path
                    )));
                }
                let key = match &self.key_index {
                    KeyIndex::Long(_) => {
                        EncodedKey::Long(long_key(&record.key, self.config.max_key_count)?)
                    }
                    KeyIndex::Hashed(_) => EncodedKey::Bytes(self.codec.key_bytes(&record.key)?),
                };
                Ok(EncodedLeaf {
                    path: record.path,
                    record: self.codec.encode(record)?,
                    key,
                })
            })
            .collect()
    }

    fn save_leaves(&self, range: ValidRange, leaves: &[EncodedLeaf]) -> Result<()> {
        let mut batch = self.leaves.start_writing()?;
        for leaf in leaves {
            batch.put(leaf.path, &leaf.record)?;
        }
        batch.end_writing(range)
    }

    fn save_key_index(&self, range: ValidRange, leaves: &[EncodedLeaf]) -> Result<()> {
        match &self.key_index {
            KeyIndex::Long(list) => {
                for leaf in leaves {
                    if let EncodedKey::Long(key) = leaf.key {
                        list.put(key, leaf.path)?;
                    }
                }
                Ok(())
            }
            KeyIndex::Hashed(map) => {
                let mut batch = map.start_writing()?;
                for leaf in leaves {
                    if let EncodedKey::Bytes(key) = &leaf.key {
                        batch.put(key, leaf.path);
                    }
                }
                batch.end_writing(range)
            }
        }
    }

    /// One past the highest path every store can index
    fn path_capacity(&self) -> u64 {
        self.leaves.capacity().min(self.hashes.capacity())
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Run one merge of every disk store right now
    pub fn merge_now(&self, tier: MergeTier) -> Result<Vec<MergeStats>> {
        let never = AtomicBool::new(false);
        merge_stores(&self.merge_targets(), tier, &self.config.merge, &never)
            .into_iter()
            .map(|(_, result)| result)
            .collect()
    }

    /// Stores whose segments get compacted
    fn merge_targets(&self) -> Vec<Arc<IndexedStore>> {
        let mut stores = vec![Arc::clone(&self.leaves)];
        if let KeyIndex::Hashed(map) = &self.key_index {
            stores.push(Arc::clone(map.store()));
        }
        if let Some(disk) = self.hashes.disk_store() {
            stores.push(Arc::clone(disk));
        }
        stores
    }

    /// Every removed single-record operation fails
    pub fn legacy(&self, op: LegacyOperation) -> Result<()> {
        Err(StoreError::precondition(format!(
            "{:?} is not supported, records are written a round at a time with save_records",
            op
        )))
    }

    /// Close the data source
    ///
    /// Stops the merge scheduler (bounded by `shutdown_timeout`), then closes
    /// every store. A timeout is returned as `ShutdownTimeout` and the stores
    /// are left untouched.
    pub fn close(mut self) -> Result<()> {
        if let Some(mut scheduler) = self.scheduler.take() {
            scheduler.shutdown(self.config.shutdown_timeout)?;
        }

        self.hashes.close()?;
        if let KeyIndex::Hashed(map) = &self.key_index {
            map.close()?;
        }
        self.leaves.close()?;

        tracing::info!(dir = %self.config.storage_dir.display(), "Closed virtual data source");
        Ok(())
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn storage_dir(&self) -> &Path {
        &self.config.storage_dir
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn is_long_key_mode(&self) -> bool {
        matches!(self.key_index, KeyIndex::Long(_))
    }

    /// (store name, readable segments) for every disk store
    pub fn segment_counts(&self) -> Vec<(String, usize)> {
        self.merge_targets()
            .iter()
            .map(|s| (s.name().to_string(), s.segment_count()))
            .collect()
    }

    /// The internal hash router (tier inspection)
    pub fn internal_hashes(&self) -> &InternalHashRouter {
        &self.hashes
    }

    /// True while the background merge thread is alive
    pub fn is_merging(&self) -> bool {
        self.scheduler.as_ref().is_some_and(MergeScheduler::is_running)
    }
}

// =============================================================================
// Private Helpers
// =============================================================================

fn check_path(path: i64) -> Result<u64> {
    u64::try_from(path).map_err(|_| StoreError::precondition(format!("path must not be negative, got {}", path)))
}

fn leaf_range(first: i64, last: i64) -> Result<ValidRange> {
    if first == -1 && last == -1 {
        return Ok(ValidRange::empty());
    }
    let low = check_path(first)?;
    let high = check_path(last)?;
    if low > high {
        return Err(StoreError::precondition(format!(
            "first leaf path {} is after last leaf path {}",
            first, last
        )));
    }
    Ok(ValidRange::new(low, high))
}

fn long_key<K: StoreKey>(key: &K, max_key_count: u64) -> Result<u64> {
    match key.as_long() {
        Some(long) if long < max_key_count => Ok(long),
        Some(long) => Err(StoreError::precondition(format!(
            "long key {} is not below max_key_count {}",
            long, max_key_count
        ))),
        None => Err(StoreError::precondition(format!(
            "key {:?} has no long form, required when key_size is 8 bytes",
            key
        ))),
    }
}

fn join_writer(handle: thread::ScopedJoinHandle<'_, Result<()>>, what: &str) -> Result<()> {
    handle
        .join()
        .unwrap_or_else(|_| Err(StoreError::Storage(format!("{} writer panicked", what))))
}
