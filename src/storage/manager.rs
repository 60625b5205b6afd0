//! Segment Manager
//!
//! Owns the segment files of one store and publishes the set of readable
//! segments.
//!
//! ## Responsibilities
//! - Discover existing segments on startup, drop leftovers of interrupted
//!   batches
//! - Hand out segment ids and batch sequences
//! - Publish and retire segments with a single atomic list swap
//! - Resolve a data location to bytes

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use bytes::Bytes;

use crate::error::{Result, StoreError};
use crate::segment::{
    parse_segment_id, DataLocation, SegmentReader, SegmentWriter, MAX_SEGMENT_ID, TMP_EXTENSION,
};

/// Published segments, ordered oldest → newest by (sequence, id)
pub type SegmentList = Vec<Arc<SegmentReader>>;

/// Manages the segment files of one store
///
/// ## Concurrency:
/// - `segments`: ArcSwap snapshot; readers never block, publishers swap
///   the whole list
/// - `next_segment_id` / `next_sequence`: atomic counters (lock-free)
/// - All methods use `&self`
pub struct SegmentManager {
    /// Directory where segments are stored
    dir: PathBuf,

    /// Readable segments
    segments: ArcSwap<SegmentList>,

    /// Next id for creating new segments
    next_segment_id: AtomicU64,

    /// Next sequence for a write batch
    next_sequence: AtomicU64,
}

impl SegmentManager {
    /// Open or create segment storage in the given directory
    ///
    /// On startup:
    /// 1. Create directory if it doesn't exist
    /// 2. Delete `.tmp` files left by interrupted writes
    /// 3. Open a reader per segment, dropping any whose sequence is beyond
    ///    `committed_sequence`
    /// 4. Order by (sequence, id)
    pub fn open(dir: &Path, committed_sequence: Option<u64>) -> Result<Self> {
        fs::create_dir_all(dir)?;

        let mut readers = Vec::new();
        let mut max_id = 0;
        let mut max_sequence = 0;

        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }

            if path.extension().is_some_and(|ext| ext == TMP_EXTENSION) {
                tracing::warn!(file = %path.display(), "Removing leftover temporary file");
                fs::remove_file(&path)?;
                continue;
            }

            let Some(id) = parse_segment_id(&path) else {
                continue;
            };
            max_id = max_id.max(id);

            let reader = SegmentReader::open(&path)?;
            if committed_sequence.is_some_and(|committed| reader.sequence() > committed) {
                tracing::warn!(
                    segment = id,
                    sequence = reader.sequence(),
                    "Discarding segment from an uncommitted batch"
                );
                reader.mark_for_deletion();
                continue;
            }
            max_sequence = max_sequence.max(reader.sequence());
            readers.push(Arc::new(reader));
        }

        readers.sort_by_key(|r| (r.sequence(), r.id()));

        let next_sequence = committed_sequence.unwrap_or(0).max(max_sequence) + 1;

        Ok(Self {
            dir: dir.to_path_buf(),
            segments: ArcSwap::from_pointee(readers),
            next_segment_id: AtomicU64::new(max_id + 1),
            next_sequence: AtomicU64::new(next_sequence),
        })
    }

    /// Start a segment for a new write batch
    pub fn new_batch_writer(&self) -> Result<SegmentWriter> {
        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        self.new_writer(sequence)
    }

    /// Start a segment carrying an explicit sequence (merge output)
    pub fn new_writer(&self, sequence: u64) -> Result<SegmentWriter> {
        let id = self.next_segment_id.fetch_add(1, Ordering::SeqCst);
        if id > MAX_SEGMENT_ID {
            return Err(StoreError::Storage(format!(
                "segment id space exhausted in {}",
                self.dir.display()
            )));
        }
        SegmentWriter::create(&self.dir, id, sequence)
    }

    /// Make a finished segment readable
    pub fn publish(&self, reader: Arc<SegmentReader>) {
        self.segments.rcu(|current| {
            let mut next: SegmentList = (**current).clone();
            let key = (reader.sequence(), reader.id());
            let pos = next.partition_point(|r| (r.sequence(), r.id()) < key);
            next.insert(pos, Arc::clone(&reader));
            next
        });
    }

    /// Remove segments from the readable set; their files go away when the
    /// last in-flight reader lets go of them
    pub fn retire(&self, ids: &[u64]) {
        let previous = self.segments.rcu(|current| {
            current
                .iter()
                .filter(|r| !ids.contains(&r.id()))
                .cloned()
                .collect::<SegmentList>()
        });
        for reader in previous.iter().filter(|r| ids.contains(&r.id())) {
            reader.mark_for_deletion();
        }
    }

    /// Current readable segments
    pub fn snapshot(&self) -> Arc<SegmentList> {
        self.segments.load_full()
    }

    /// Find a readable segment by id
    pub fn find(&self, id: u64) -> Option<Arc<SegmentReader>> {
        self.segments.load().iter().find(|r| r.id() == id).cloned()
    }

    /// Read the record at `location`; `None` if its segment is no longer published
    pub fn read(&self, location: DataLocation) -> Result<Option<(u64, Bytes)>> {
        match self.find(location.segment_id()) {
            Some(reader) => reader.read(location.offset()).map(Some),
            None => Ok(None),
        }
    }

    /// Get the number of readable segments
    pub fn segment_count(&self) -> usize {
        self.segments.load().len()
    }

    /// Total size of readable segments in bytes
    pub fn total_bytes(&self) -> u64 {
        self.segments.load().iter().map(|r| r.info().file_size).sum()
    }

    /// Get the segment directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}
