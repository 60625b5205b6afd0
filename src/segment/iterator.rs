//! Segment Iterator
//!
//! Sequential iteration over all records in a segment, in write order.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};

use bytes::Bytes;

use crate::error::{Result, StoreError};

use super::{SegmentInfo, HEADER_SIZE, RECORD_HEADER_SIZE};

/// One record as found on disk
#[derive(Debug, Clone)]
pub struct SegmentEntry {
    /// Logical address the record was written under
    pub locator: u64,
    /// Byte offset of the record inside the segment
    pub offset: u64,
    /// Record payload
    pub payload: Bytes,
}

/// Iterator over segment records; every payload is CRC-checked
pub struct SegmentIterator {
    file: BufReader<File>,
    segment_id: u64,
    /// Records still to read (from the header count)
    remaining: u64,
    /// Offset of the next record
    current_offset: u64,
    /// Stop after the first error
    failed: bool,
}

impl SegmentIterator {
    pub(super) fn open(info: &SegmentInfo) -> Result<Self> {
        // A separate handle keeps this cursor away from concurrent positional reads
        let mut file = File::open(&info.path)?;
        file.seek(SeekFrom::Start(HEADER_SIZE))?;
        Ok(Self {
            file: BufReader::new(file),
            segment_id: info.id,
            remaining: info.record_count,
            current_offset: HEADER_SIZE,
            failed: false,
        })
    }

    fn read_entry(&mut self) -> Result<SegmentEntry> {
        let mut header = [0u8; RECORD_HEADER_SIZE as usize];
        self.file.read_exact(&mut header)?;

        let mut locator = [0u8; 8];
        locator.copy_from_slice(&header[0..8]);
        let locator = u64::from_le_bytes(locator);
        let len = u32::from_le_bytes([header[8], header[9], header[10], header[11]]) as usize;
        let crc = u32::from_le_bytes([header[12], header[13], header[14], header[15]]);

        let mut payload = vec![0u8; len];
        self.file.read_exact(&mut payload)?;

        if crc32fast::hash(&payload) != crc {
            return Err(StoreError::Corruption(format!(
                "CRC mismatch for record at {} in segment {}",
                self.current_offset, self.segment_id
            )));
        }

        let offset = self.current_offset;
        self.current_offset += RECORD_HEADER_SIZE + len as u64;

        Ok(SegmentEntry {
            locator,
            offset,
            payload: Bytes::from(payload),
        })
    }
}

impl Iterator for SegmentIterator {
    type Item = Result<SegmentEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 || self.failed {
            return None;
        }
        self.remaining -= 1;

        let entry = self.read_entry();
        if entry.is_err() {
            self.failed = true;
        }
        Some(entry)
    }
}
