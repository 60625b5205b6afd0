//! Segment Module
//!
//! Immutable append-only files, one per write batch (or merge).
//!
//! ## File Format
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ Header (32 bytes)                                            │
//! │   Magic: "VMSG" (4) | Version: u16 (2) | Reserved (2)        │
//! │   SegmentId: u64 (8) | Sequence: u64 (8) | Count: u64 (8)    │
//! ├──────────────────────────────────────────────────────────────┤
//! │ Records (variable)                                           │
//! │   [Locator: u64][Len: u32][CRC32: u32][Payload: Len bytes]   │
//! │   ... repeated for each record ...                           │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The locator is the logical address the record was written under (a tree
//! path, or a bucket index). Storing it lets a merge or an index rebuild
//! decide whether a record is still the live one for its address.
//!
//! Files are written as `seg_NNNNNN.vms.tmp` and renamed on finish; a
//! `.tmp` file found at startup belongs to an interrupted batch.

mod iterator;
mod reader;
mod writer;

use std::path::{Path, PathBuf};
use std::sync::Arc;

pub use iterator::{SegmentEntry, SegmentIterator};
pub use reader::SegmentReader;
pub use writer::SegmentWriter;

// =============================================================================
// Shared Constants (used by writer, reader, iterator)
// =============================================================================

/// Magic bytes identifying a segment file
pub(crate) const MAGIC: &[u8; 4] = b"VMSG";

/// Current segment format version
pub(crate) const VERSION: u16 = 1;

/// Header size: Magic (4) + Version (2) + Reserved (2) + Id (8) + Sequence (8) + Count (8)
pub(crate) const HEADER_SIZE: u64 = 32;

/// Offset of the record count inside the header
pub(crate) const COUNT_OFFSET: u64 = 24;

/// Record header: Locator (8) + Len (4) + CRC (4)
pub(crate) const RECORD_HEADER_SIZE: u64 = 16;

/// Segment file extension
pub(crate) const SEGMENT_EXTENSION: &str = "vms";

/// Extension appended while a segment is still being written
pub(crate) const TMP_EXTENSION: &str = "tmp";

const OFFSET_BITS: u32 = 40;
const OFFSET_MASK: u64 = (1 << OFFSET_BITS) - 1;

/// Largest segment id a data location can address
pub const MAX_SEGMENT_ID: u64 = (1 << (64 - OFFSET_BITS)) - 1;

/// Largest byte offset a data location can address
pub const MAX_SEGMENT_OFFSET: u64 = OFFSET_MASK;

// =============================================================================
// Data Location
// =============================================================================

/// (segment id, byte offset) packed into one u64 so an index slot can be
/// swapped atomically
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DataLocation(u64);

impl DataLocation {
    pub fn new(segment_id: u64, offset: u64) -> Self {
        debug_assert!(segment_id <= MAX_SEGMENT_ID);
        debug_assert!(offset <= MAX_SEGMENT_OFFSET);
        Self((segment_id << OFFSET_BITS) | (offset & OFFSET_MASK))
    }

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }

    pub fn segment_id(&self) -> u64 {
        self.0 >> OFFSET_BITS
    }

    pub fn offset(&self) -> u64 {
        self.0 & OFFSET_MASK
    }
}

// =============================================================================
// Segment Metadata
// =============================================================================

/// Metadata about one finished segment
#[derive(Debug, Clone)]
pub struct SegmentInfo {
    /// Path to the segment file
    pub path: PathBuf,
    /// Unique id, also used in the file name
    pub id: u64,
    /// Ordering key for index rebuild; merges inherit their newest input's
    pub sequence: u64,
    /// Number of records in this segment
    pub record_count: u64,
    /// File size in bytes
    pub file_size: u64,
}

/// File name for a finished segment
pub(crate) fn segment_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("seg_{:06}.{}", id, SEGMENT_EXTENSION))
}

/// Parse a segment id from a file name
/// "seg_000042.vms" → Some(42)
pub(crate) fn parse_segment_id(path: &Path) -> Option<u64> {
    if path.extension()? != SEGMENT_EXTENSION {
        return None;
    }
    let name = path.file_stem()?.to_string_lossy();
    name.strip_prefix("seg_")?.parse().ok()
}

// =============================================================================
// Segment Selection
// =============================================================================

/// Chooses which published segments a merge should consume
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentFilter {
    /// Every published segment
    All,

    /// The contiguous run of newest segments each smaller than the bound
    NewestSmallerThan(u64),
}

impl SegmentFilter {
    /// `segments` must be ordered oldest → newest
    pub fn select(&self, segments: &[Arc<SegmentReader>]) -> Vec<Arc<SegmentReader>> {
        match *self {
            SegmentFilter::All => segments.to_vec(),
            SegmentFilter::NewestSmallerThan(bound) => {
                let mut picked: Vec<Arc<SegmentReader>> = segments
                    .iter()
                    .rev()
                    .take_while(|s| s.info().file_size < bound)
                    .cloned()
                    .collect();
                picked.reverse();
                picked
            }
        }
    }
}
