//! Store metadata
//!
//! A tiny bincode file per store, rewritten (temp + rename) at the end of
//! every write batch. Writing it is the commit point of a batch: segments
//! whose sequence is newer than `committed_sequence` belong to a batch that
//! never committed and are discarded on open.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};

const METADATA_FILENAME: &str = "store.meta";
const METADATA_VERSION: u32 = 1;

/// Inclusive range of locators a store currently serves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidRange {
    low: u64,
    high: u64,
}

impl ValidRange {
    /// `[low, high]`; an inverted pair is the empty range
    pub fn new(low: u64, high: u64) -> Self {
        if low > high {
            Self::empty()
        } else {
            Self { low, high }
        }
    }

    pub fn empty() -> Self {
        Self { low: 1, high: 0 }
    }

    pub fn all() -> Self {
        Self {
            low: 0,
            high: u64::MAX,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.low > self.high
    }

    pub fn contains(&self, locator: u64) -> bool {
        self.low <= locator && locator <= self.high
    }

    pub fn low(&self) -> u64 {
        self.low
    }

    pub fn high(&self) -> u64 {
        self.high
    }

    /// Half-open spans (clamped to `limit`) that are in `self` but not in `next`
    pub(crate) fn removed_by(&self, next: &ValidRange, limit: u64) -> Vec<(u64, u64)> {
        if self.is_empty() {
            return Vec::new();
        }
        let old_end = self.high.saturating_add(1).min(limit);
        let old_start = self.low.min(old_end);
        if next.is_empty() {
            return vec![(old_start, old_end)];
        }

        let mut spans = Vec::with_capacity(2);
        let below_end = next.low.min(old_end);
        if old_start < below_end {
            spans.push((old_start, below_end));
        }
        let above_start = next.high.saturating_add(1).max(old_start);
        if above_start < old_end {
            spans.push((above_start, old_end));
        }
        spans
    }
}

/// Persisted per-store state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreMetadata {
    pub format_version: u32,
    /// Sequence of the newest committed batch
    pub committed_sequence: u64,
    /// Locators outside this range are not served
    pub valid_range: ValidRange,
}

impl StoreMetadata {
    pub fn new(committed_sequence: u64, valid_range: ValidRange) -> Self {
        Self {
            format_version: METADATA_VERSION,
            committed_sequence,
            valid_range,
        }
    }

    pub fn path(dir: &Path) -> PathBuf {
        dir.join(METADATA_FILENAME)
    }

    /// Load the metadata file; `None` if the store was never committed to
    pub fn load(dir: &Path) -> Result<Option<Self>> {
        let path = Self::path(dir);
        if !path.exists() {
            return Ok(None);
        }
        let meta: StoreMetadata = bincode::deserialize_from(BufReader::new(File::open(&path)?))?;
        if meta.format_version != METADATA_VERSION {
            return Err(StoreError::Corruption(format!(
                "Unsupported store metadata version {} in {}",
                meta.format_version,
                path.display()
            )));
        }
        Ok(Some(meta))
    }

    /// Durably replace the metadata file
    pub fn save(&self, dir: &Path) -> Result<()> {
        save_durably(&Self::path(dir), self)
    }
}

/// Replace `path` with the bincode encoding of `value`
///
/// Written to `<path>.tmp`, fsynced, then renamed over `path`, so a crash
/// leaves either the old file or the new one.
pub(crate) fn save_durably<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);

    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&tmp_path)?;
    let mut writer = BufWriter::new(file);
    bincode::serialize_into(&mut writer, value)?;
    writer.flush()?;
    let file = writer
        .into_inner()
        .map_err(|e| StoreError::Storage(format!("Failed to flush {}: {}", path.display(), e)))?;
    file.sync_all()?;
    drop(file);

    fs::rename(&tmp_path, path)?;
    Ok(())
}
