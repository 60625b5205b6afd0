//! Index-backed key/value store
//!
//! Pairs a segment manager with an off-heap index mapping a locator (tree
//! path or bucket index) to the packed location of its newest record.
//!
//! ## Write Protocol
//! ```text
//! start_writing() ──► start_streaming_put(locator) ─► write bytes ─► end_streaming_put()
//!                          ▲                                              │
//!                          └──────────────────────────────────────────────┘
//!                 ──► end_writing(valid_range)
//!                       1. finish + fsync + rename the segment
//!                       2. write store.meta (commit point)
//!                       3. publish the segment (one list swap)
//!                       4. point index slots at the new records
//!                       5. clear slots that fell out of the valid range
//!                       6. advance the in-memory committed sequence
//! ```
//!
//! If step 2 fails the segment is deleted and nothing was published, so a
//! failed batch can never be replayed on a later open.
//!
//! ## Merge Protocol
//! Only segments at or below the in-memory committed sequence are merge
//! candidates: a segment published by a batch still in steps 3-6 has index
//! slots that do not point at it yet, and must not be mistaken for dead.
//! Live records (index slot == record's own location) from the selected
//! segments are copied into one new segment, which is published before any
//! index slot is redirected. Slots are redirected with compare-and-swap, so a
//! slot the writer changed meanwhile keeps the writer's value. The inputs are
//! retired last.

use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;

use crate::collections::LongList;
use crate::error::{Result, StoreError};
use crate::segment::{DataLocation, SegmentFilter, SegmentInfo, SegmentReader, SegmentWriter};

use super::manager::SegmentManager;
use super::metadata::{StoreMetadata, ValidRange};
use super::MergeStats;

/// A segment-backed store with an off-heap locator index
pub struct IndexedStore {
    /// Store name for logging
    name: String,

    /// Segment files
    segments: SegmentManager,

    /// locator → packed DataLocation
    index: LongList,

    /// Locators currently served
    valid_range: ArcSwap<ValidRange>,

    /// Sequence of the last batch whose index updates are complete
    committed_sequence: AtomicU64,

    /// Set while a write batch is open
    writing: AtomicBool,

    /// Held for the duration of a merge
    merge_lock: Mutex<()>,
}

impl IndexedStore {
    /// Open or create a store in `dir`, rebuilding the index from its segments
    pub fn open(dir: &Path, name: &str, index_chunk_size: usize) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let metadata = StoreMetadata::load(dir)?;
        let segments =
            SegmentManager::open(dir, metadata.as_ref().map(|m| m.committed_sequence))?;
        let valid_range = metadata
            .as_ref()
            .map(|m| m.valid_range)
            .unwrap_or_else(ValidRange::all);
        let committed_sequence = match &metadata {
            Some(m) => m.committed_sequence,
            None => segments
                .snapshot()
                .iter()
                .map(|s| s.sequence())
                .max()
                .unwrap_or(0),
        };

        let store = Self {
            name: name.to_string(),
            segments,
            index: LongList::with_chunk_size(index_chunk_size),
            valid_range: ArcSwap::from_pointee(ValidRange::all()),
            committed_sequence: AtomicU64::new(committed_sequence),
            writing: AtomicBool::new(false),
            merge_lock: Mutex::new(()),
        };

        let records = store.rebuild_index()?;
        store.apply_valid_range(valid_range);

        tracing::info!(
            store = %store.name,
            segments = store.segments.segment_count(),
            records,
            "Opened store"
        );
        Ok(store)
    }

    /// Replay every segment oldest → newest; the newest record per locator wins
    fn rebuild_index(&self) -> Result<u64> {
        let mut records = 0;
        for segment in self.segments.snapshot().iter() {
            for entry in segment.iter()? {
                let entry = entry?;
                let location = DataLocation::new(segment.id(), entry.offset);
                self.index.put(entry.locator, location.raw())?;
                records += 1;
            }
        }
        Ok(records)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Read the payload stored for `locator`
    pub fn get(&self, locator: u64) -> Result<Option<Bytes>> {
        if !self.valid_range.load().contains(locator) {
            return Ok(None);
        }

        loop {
            let Some(raw) = self.index.get(locator) else {
                return Ok(None);
            };
            let location = DataLocation::from_raw(raw);

            match self.segments.read(location)? {
                Some((stored_locator, payload)) => {
                    if stored_locator != locator {
                        return Err(StoreError::Corruption(format!(
                            "{}: index entry for {} points at a record for {}",
                            self.name, locator, stored_locator
                        )));
                    }
                    return Ok(Some(payload));
                }
                None => {
                    // A merge retired the segment after we read the index;
                    // the slot must have moved, look again
                    if self.index.get(locator) == Some(raw) {
                        return Err(StoreError::Corruption(format!(
                            "{}: index entry for {} points at missing segment {}",
                            self.name,
                            locator,
                            location.segment_id()
                        )));
                    }
                }
            }
        }
    }

    /// Where the newest record for `locator` lives
    pub fn location_of(&self, locator: u64) -> Option<DataLocation> {
        if !self.valid_range.load().contains(locator) {
            return None;
        }
        self.index.get(locator).map(DataLocation::from_raw)
    }

    /// Visit every live record, oldest segment first
    pub fn for_each_live(&self, mut f: impl FnMut(u64, &[u8]) -> Result<()>) -> Result<u64> {
        let mut visited = 0;
        for segment in self.segments.snapshot().iter() {
            for entry in segment.iter()? {
                let entry = entry?;
                let location = DataLocation::new(segment.id(), entry.offset);
                if self.location_of(entry.locator) == Some(location) {
                    f(entry.locator, &entry.payload)?;
                    visited += 1;
                }
            }
        }
        Ok(visited)
    }

    /// Re-read every record of every segment, checking CRCs
    pub fn verify(&self) -> Result<u64> {
        let mut records = 0;
        for segment in self.segments.snapshot().iter() {
            for entry in segment.iter()? {
                entry?;
                records += 1;
            }
        }
        Ok(records)
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Open the single write session of this store
    pub fn start_writing(&self) -> Result<WriteBatch<'_>> {
        if self
            .writing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(StoreError::precondition(format!(
                "{}: a write batch is already open",
                self.name
            )));
        }
        Ok(WriteBatch {
            store: self,
            writer: None,
            sink: RecordSink::default(),
            current: None,
            delta: Vec::new(),
            finished: false,
        })
    }

    /// Narrow (or widen) the served range, clearing slots that fell out
    fn apply_valid_range(&self, next: ValidRange) {
        let current = **self.valid_range.load();
        self.valid_range.store(Arc::new(next));
        for (start, end) in current.removed_by(&next, self.index.size()) {
            self.index.clear_range(start..end);
        }
    }

    // =========================================================================
    // Merge
    // =========================================================================

    /// Compact the segments `filter` selects into one new segment
    pub fn merge(&self, filter: &SegmentFilter, cancel: &AtomicBool) -> Result<MergeStats> {
        let _guard = self.merge_lock.lock();

        // Segments of a batch still being committed are not candidates
        let committed = self.committed_sequence.load(Ordering::Acquire);
        let snapshot: Vec<Arc<SegmentReader>> = self
            .segments
            .snapshot()
            .iter()
            .filter(|s| s.sequence() <= committed)
            .cloned()
            .collect();
        let candidates = filter.select(&snapshot);
        if candidates.len() < 2 {
            return Ok(MergeStats::default());
        }

        let mut stats = MergeStats {
            segments_in: candidates.len(),
            bytes_in: candidates.iter().map(|s| s.info().file_size).sum(),
            ..MergeStats::default()
        };

        // Merged output must sort no later than any batch written meanwhile
        let sequence = candidates.iter().map(|s| s.sequence()).max().unwrap_or(0);
        let mut writer = self.segments.new_writer(sequence)?;
        let mut moved: Vec<(u64, DataLocation, u64)> = Vec::new();

        for segment in &candidates {
            if cancel.load(Ordering::Acquire) {
                writer.abort()?;
                stats.cancelled = true;
                tracing::info!(store = %self.name, "Merge cancelled");
                return Ok(stats);
            }
            if let Err(e) = self.copy_live_records(segment, &mut writer, &mut moved) {
                if let Err(abort_err) = writer.abort() {
                    tracing::warn!(store = %self.name, error = %abort_err, "Failed to remove merge output");
                }
                return Err(e);
            }
        }

        let retired: Vec<u64> = candidates.iter().map(|s| s.id()).collect();

        if moved.is_empty() {
            writer.abort()?;
        } else {
            let info: SegmentInfo = writer.finish()?;
            let reader = Arc::new(SegmentReader::open(&info.path)?);
            self.segments.publish(reader);
            stats.segments_out = 1;
            stats.bytes_out = info.file_size;

            for (locator, old, new_offset) in moved {
                let new = DataLocation::new(info.id, new_offset);
                if self.index.put_if_equal(locator, old.raw(), new.raw()) {
                    stats.records_moved += 1;
                }
            }
        }

        self.segments.retire(&retired);

        tracing::info!(
            store = %self.name,
            segments_in = stats.segments_in,
            records_moved = stats.records_moved,
            bytes_in = stats.bytes_in,
            bytes_out = stats.bytes_out,
            "Merge finished"
        );
        Ok(stats)
    }

    fn copy_live_records(
        &self,
        segment: &SegmentReader,
        writer: &mut SegmentWriter,
        moved: &mut Vec<(u64, DataLocation, u64)>,
    ) -> Result<()> {
        for entry in segment.iter()? {
            let entry = entry?;
            let location = DataLocation::new(segment.id(), entry.offset);
            if self.index.get(entry.locator) == Some(location.raw()) {
                let offset = writer.append(entry.locator, &entry.payload)?;
                moved.push((entry.locator, location, offset));
            }
        }
        Ok(())
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Close the store; fails if a write batch is still open
    pub fn close(&self) -> Result<()> {
        if self.writing.load(Ordering::Acquire) {
            return Err(StoreError::precondition(format!(
                "{}: cannot close while a write batch is open",
                self.name
            )));
        }
        let _guard = self.merge_lock.lock();
        tracing::info!(store = %self.name, segments = self.segments.segment_count(), "Closed store");
        Ok(())
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dir(&self) -> &Path {
        self.segments.dir()
    }

    pub fn valid_range(&self) -> ValidRange {
        **self.valid_range.load()
    }

    /// One past the highest locator the index can hold
    pub fn capacity(&self) -> u64 {
        self.index.capacity()
    }

    /// Get the number of readable segments
    pub fn segment_count(&self) -> usize {
        self.segments.segment_count()
    }

    /// Metadata for every readable segment, oldest first
    pub fn segments(&self) -> Vec<SegmentInfo> {
        self.segments
            .snapshot()
            .iter()
            .map(|s| s.info().clone())
            .collect()
    }

    /// Total bytes across readable segments
    pub fn disk_bytes(&self) -> u64 {
        self.segments.total_bytes()
    }
}

// =============================================================================
// Write Batch
// =============================================================================

/// Buffer a single record is streamed into
#[derive(Debug, Default)]
pub struct RecordSink {
    buf: BytesMut,
}

impl Deref for RecordSink {
    type Target = BytesMut;

    fn deref(&self) -> &BytesMut {
        &self.buf
    }
}

impl DerefMut for RecordSink {
    fn deref_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }
}

impl std::io::Write for RecordSink {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// The open write session of an `IndexedStore`
///
/// Records become visible only when `end_writing` returns. Dropping the
/// batch without ending it throws the written segment away.
pub struct WriteBatch<'a> {
    store: &'a IndexedStore,

    /// Created on the first record, so empty batches touch no files
    writer: Option<SegmentWriter>,

    /// Reused for every streamed record
    sink: RecordSink,

    /// Locator of the record currently being streamed
    current: Option<u64>,

    /// Index updates published at end_writing
    delta: Vec<(u64, u64)>,

    finished: bool,
}

impl WriteBatch<'_> {
    /// Begin a record for `locator`; write its bytes into the returned sink
    pub fn start_streaming_put(&mut self, locator: u64, size_hint: usize) -> Result<&mut RecordSink> {
        if let Some(open) = self.current {
            return Err(StoreError::precondition(format!(
                "{}: record for {} was not ended before starting {}",
                self.store.name, open, locator
            )));
        }
        if locator >= self.store.capacity() {
            return Err(StoreError::precondition(format!(
                "{}: locator {} is beyond index capacity {}",
                self.store.name,
                locator,
                self.store.capacity()
            )));
        }
        self.sink.clear();
        self.sink.reserve(size_hint);
        self.current = Some(locator);
        Ok(&mut self.sink)
    }

    /// Finish the streamed record and stage its index update
    pub fn end_streaming_put(&mut self) -> Result<DataLocation> {
        let locator = self.current.take().ok_or_else(|| {
            StoreError::precondition(format!("{}: no record is being streamed", self.store.name))
        })?;

        let writer = match self.writer.take() {
            Some(writer) => writer,
            None => self.store.segments.new_batch_writer()?,
        };
        let writer = self.writer.insert(writer);
        let offset = writer.append(locator, &self.sink)?;
        let location = DataLocation::new(writer.id(), offset);
        self.delta.push((locator, location.raw()));
        Ok(location)
    }

    /// Write one complete record
    pub fn put(&mut self, locator: u64, payload: &[u8]) -> Result<DataLocation> {
        self.start_streaming_put(locator, payload.len())?
            .extend_from_slice(payload);
        self.end_streaming_put()
    }

    /// Records staged so far
    pub fn record_count(&self) -> usize {
        self.delta.len()
    }

    /// Commit the batch and publish it
    pub fn end_writing(mut self, valid_range: ValidRange) -> Result<()> {
        if let Some(open) = self.current {
            return Err(StoreError::precondition(format!(
                "{}: record for {} was not ended",
                self.store.name, open
            )));
        }

        let store = self.store;

        // Step 1: Seal the segment
        let sealed = match self.writer.take() {
            Some(writer) => {
                let info = writer.finish()?;
                match SegmentReader::open(&info.path) {
                    Ok(reader) => Some(Arc::new(reader)),
                    Err(e) => {
                        let _ = std::fs::remove_file(&info.path);
                        return Err(e);
                    }
                }
            }
            // No records: nothing to write, but the range still moves
            None => None,
        };
        let sequence = match &sealed {
            Some(reader) => reader.sequence(),
            None => store.committed_sequence.load(Ordering::Acquire),
        };

        // Step 2: Commit point
        if let Err(e) = StoreMetadata::new(sequence, valid_range).save(store.dir()) {
            if let Some(reader) = sealed {
                reader.mark_for_deletion();
            }
            return Err(e);
        }

        // Step 3: Publish
        if let Some(reader) = sealed {
            store.segments.publish(reader);
        }
        for &(locator, location) in &self.delta {
            store.index.put(locator, location)?;
        }
        store.apply_valid_range(valid_range);
        store.committed_sequence.store(sequence, Ordering::Release);
        self.finished = true;

        tracing::debug!(
            store = %store.name,
            records = self.delta.len(),
            sequence,
            low = valid_range.low(),
            high = valid_range.high(),
            "Committed write batch"
        );
        Ok(())
    }
}

impl Drop for WriteBatch<'_> {
    fn drop(&mut self) {
        if !self.finished {
            if let Some(writer) = self.writer.take() {
                if let Err(e) = writer.abort() {
                    tracing::warn!(store = %self.store.name, error = %e, "Failed to discard aborted batch");
                }
            }
            if !self.delta.is_empty() {
                tracing::warn!(
                    store = %self.store.name,
                    records = self.delta.len(),
                    "Write batch dropped without end_writing"
                );
            }
        }
        self.store.writing.store(false, Ordering::Release);
    }
}
