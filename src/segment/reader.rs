//! Segment Reader
//!
//! Random-access reads by offset. Uses positional reads, so any number of
//! threads can read one segment through a shared handle without seeking.

use std::fs::{self, File};
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;

use crate::error::{Result, StoreError};

use super::iterator::SegmentIterator;
use super::{parse_segment_id, SegmentInfo, HEADER_SIZE, MAGIC, RECORD_HEADER_SIZE, VERSION};

/// Open handle on a finished segment
pub struct SegmentReader {
    info: SegmentInfo,
    file: File,
    /// Set when a merge has superseded this segment; the file is unlinked
    /// once the last handle goes away
    delete_on_drop: AtomicBool,
}

impl SegmentReader {
    /// Open a segment and validate its header
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let file_size = file.metadata()?.len();

        if file_size < HEADER_SIZE {
            return Err(StoreError::Corruption(format!(
                "Segment {} is shorter than its header",
                path.display()
            )));
        }

        let mut header = [0u8; HEADER_SIZE as usize];
        read_exact_at(&file, &mut header, 0)?;

        if &header[0..4] != MAGIC {
            return Err(StoreError::Corruption(format!(
                "Invalid segment magic: expected VMSG, got {:?}",
                &header[0..4]
            )));
        }

        let version = u16::from_le_bytes([header[4], header[5]]);
        if version != VERSION {
            return Err(StoreError::Corruption(format!(
                "Unsupported segment version: {}",
                version
            )));
        }

        let id = le_u64(&header[8..16]);
        let sequence = le_u64(&header[16..24]);
        let record_count = le_u64(&header[24..32]);

        if parse_segment_id(path) != Some(id) {
            return Err(StoreError::Corruption(format!(
                "Segment {} carries id {} in its header",
                path.display(),
                id
            )));
        }

        Ok(Self {
            info: SegmentInfo {
                path: path.to_path_buf(),
                id,
                sequence,
                record_count,
                file_size,
            },
            file,
            delete_on_drop: AtomicBool::new(false),
        })
    }

    pub fn info(&self) -> &SegmentInfo {
        &self.info
    }

    pub fn id(&self) -> u64 {
        self.info.id
    }

    pub fn sequence(&self) -> u64 {
        self.info.sequence
    }

    /// Read the record at `offset`, returning (locator, payload)
    pub fn read(&self, offset: u64) -> Result<(u64, Bytes)> {
        if offset < HEADER_SIZE || offset + RECORD_HEADER_SIZE > self.info.file_size {
            return Err(StoreError::Corruption(format!(
                "Offset {} is outside segment {}",
                offset, self.info.id
            )));
        }

        let mut header = [0u8; RECORD_HEADER_SIZE as usize];
        read_exact_at(&self.file, &mut header, offset)?;

        let locator = le_u64(&header[0..8]);
        let len = u32::from_le_bytes([header[8], header[9], header[10], header[11]]) as u64;
        let crc = u32::from_le_bytes([header[12], header[13], header[14], header[15]]);

        let payload_offset = offset + RECORD_HEADER_SIZE;
        if payload_offset + len > self.info.file_size {
            return Err(StoreError::Corruption(format!(
                "Record at {} in segment {} runs past end of file",
                offset, self.info.id
            )));
        }

        let mut payload = vec![0u8; len as usize];
        read_exact_at(&self.file, &mut payload, payload_offset)?;

        if crc32fast::hash(&payload) != crc {
            return Err(StoreError::Corruption(format!(
                "CRC mismatch for record at {} in segment {}",
                offset, self.info.id
            )));
        }

        Ok((locator, Bytes::from(payload)))
    }

    /// Sequential iteration over every record (merge, rebuild, verify)
    pub fn iter(&self) -> Result<SegmentIterator> {
        SegmentIterator::open(&self.info)
    }

    /// Unlink the file once no one holds this reader any more
    pub fn mark_for_deletion(&self) {
        self.delete_on_drop.store(true, Ordering::Release);
    }
}

impl Drop for SegmentReader {
    fn drop(&mut self) {
        if self.delete_on_drop.load(Ordering::Acquire) {
            match fs::remove_file(&self.info.path) {
                Ok(()) => tracing::debug!(segment = self.info.id, "Deleted merged segment"),
                Err(e) => tracing::warn!(
                    segment = self.info.id,
                    error = %e,
                    "Failed to delete merged segment"
                ),
            }
        }
    }
}

impl std::fmt::Debug for SegmentReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentReader").field("info", &self.info).finish()
    }
}

fn le_u64(bytes: &[u8]) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(b)
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_read(buf, offset) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "failed to fill whole buffer",
                ))
            }
            Ok(n) => {
                buf = &mut std::mem::take(&mut buf)[n..];
                offset += n as u64;
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
