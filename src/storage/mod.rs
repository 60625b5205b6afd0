//! Storage Module
//!
//! Segment-backed stores addressed through an in-memory index.
//!
//! ## Responsibilities
//! - Batch writes into one new segment per batch (single writer per store)
//! - Publish a batch with one segment-list swap plus atomic index slots
//! - Random-access reads: index lookup, then one positional file read
//! - Background compaction of superseded records
//!
//! ## Directory Layout (one store)
//! ```text
//! {store_dir}/
//!   ├── seg_000001.vms      (immutable segments)
//!   ├── seg_000002.vms
//!   ├── seg_000003.vms.tmp  (batch in progress, removed on restart)
//!   └── store.meta          (committed sequence + valid range)
//! ```

mod indexed_store;
mod manager;
mod metadata;

pub use indexed_store::{IndexedStore, RecordSink, WriteBatch};
pub use manager::{SegmentList, SegmentManager};
pub use metadata::{StoreMetadata, ValidRange};
pub(crate) use metadata::save_durably;

/// Outcome of one merge over one store
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeStats {
    /// Segments consumed
    pub segments_in: usize,
    /// Segments produced (0 if every input record was dead)
    pub segments_out: usize,
    /// Live records redirected to the merged segment
    pub records_moved: u64,
    /// Size of the consumed segments
    pub bytes_in: u64,
    /// Size of the produced segment
    pub bytes_out: u64,
    /// Stopped early because shutdown was requested
    pub cancelled: bool,
}

impl MergeStats {
    /// True if the merge had nothing to do
    pub fn is_noop(&self) -> bool {
        self.segments_in == 0
    }

    /// Bytes given back to the filesystem
    pub fn bytes_reclaimed(&self) -> u64 {
        if self.cancelled {
            0
        } else {
            self.bytes_in.saturating_sub(self.bytes_out)
        }
    }
}
