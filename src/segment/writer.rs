//! Segment Writer
//!
//! Appends framed records to a new segment file.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{Result, StoreError};

use super::{
    segment_path, SegmentInfo, COUNT_OFFSET, HEADER_SIZE, MAGIC, MAX_SEGMENT_OFFSET,
    RECORD_HEADER_SIZE, TMP_EXTENSION, VERSION,
};

/// Writes one segment; call `append()` per record, then `finish()`
pub struct SegmentWriter {
    /// Segment id
    id: u64,
    /// Ordering key written into the header
    sequence: u64,
    /// Where the file lives while it is being written
    tmp_path: PathBuf,
    /// Where the file lands on `finish()`
    final_path: PathBuf,
    /// Buffered writer for performance
    writer: BufWriter<File>,
    /// Number of records written
    record_count: u64,
    /// Current write position (next record's offset)
    current_offset: u64,
}

impl SegmentWriter {
    /// Create a new segment file and write its header
    pub fn create(dir: &Path, id: u64, sequence: u64) -> Result<Self> {
        let final_path = segment_path(dir, id);
        let mut tmp_name = final_path.as_os_str().to_owned();
        tmp_name.push(".");
        tmp_name.push(TMP_EXTENSION);
        let tmp_path = PathBuf::from(tmp_name);

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;

        let mut writer = BufWriter::new(file);

        // Record count is a placeholder, patched in finish()
        writer.write_all(MAGIC)?;
        writer.write_all(&VERSION.to_le_bytes())?;
        writer.write_all(&[0u8; 2])?;
        writer.write_all(&id.to_le_bytes())?;
        writer.write_all(&sequence.to_le_bytes())?;
        writer.write_all(&0u64.to_le_bytes())?;

        Ok(Self {
            id,
            sequence,
            tmp_path,
            final_path,
            writer,
            record_count: 0,
            current_offset: HEADER_SIZE,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn record_count(&self) -> u64 {
        self.record_count
    }

    /// Append one record, returning the offset it was written at
    pub fn append(&mut self, locator: u64, payload: &[u8]) -> Result<u64> {
        let offset = self.current_offset;
        if offset > MAX_SEGMENT_OFFSET {
            return Err(StoreError::Storage(format!(
                "segment {} exceeds the addressable size",
                self.id
            )));
        }
        let len: u32 = payload.len().try_into().map_err(|_| {
            StoreError::Serialization(format!("record of {} bytes is too large", payload.len()))
        })?;

        self.writer.write_all(&locator.to_le_bytes())?;
        self.writer.write_all(&len.to_le_bytes())?;
        self.writer.write_all(&crc32fast::hash(payload).to_le_bytes())?;
        self.writer.write_all(payload)?;

        self.current_offset += RECORD_HEADER_SIZE + payload.len() as u64;
        self.record_count += 1;
        Ok(offset)
    }

    /// Flush, fsync, and move the file to its final name
    pub fn finish(mut self) -> Result<SegmentInfo> {
        self.writer.flush()?;

        let mut file = self.writer.into_inner().map_err(|e| {
            StoreError::Storage(format!("Failed to flush segment: {}", e))
        })?;
        file.seek(SeekFrom::Start(COUNT_OFFSET))?;
        file.write_all(&self.record_count.to_le_bytes())?;
        file.sync_all()?;
        let file_size = file.metadata()?.len();
        drop(file);

        fs::rename(&self.tmp_path, &self.final_path)?;
        if let Some(dir) = self.final_path.parent() {
            sync_dir(dir)?;
        }

        Ok(SegmentInfo {
            path: self.final_path,
            id: self.id,
            sequence: self.sequence,
            record_count: self.record_count,
            file_size,
        })
    }

    /// Throw the partially written file away
    pub fn abort(self) -> Result<()> {
        let SegmentWriter { writer, tmp_path, .. } = self;
        drop(writer);
        match fs::remove_file(&tmp_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Persist a rename by syncing the parent directory
#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}
