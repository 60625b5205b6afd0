//! Configuration for vmstore
//!
//! Centralized construction-time configuration with sensible defaults.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, StoreError};

/// Threshold value that keeps every internal hash in RAM
pub const ALL_INTERNAL_HASHES_IN_RAM: u64 = u64::MAX;

/// Threshold value that puts every internal hash on disk
pub const ALL_INTERNAL_HASHES_ON_DISK: u64 = 0;

/// Serialized width of keys or values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSize {
    /// Every serialized instance is exactly this many bytes
    Fixed(usize),

    /// Serialized instances vary in length
    Variable,
}

impl DataSize {
    pub fn is_variable(&self) -> bool {
        matches!(self, DataSize::Variable)
    }
}

/// Main configuration for a virtual data source
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Storage Configuration
    // -------------------------------------------------------------------------
    /// Root directory for all stores
    /// Internal structure:
    ///   {storage_dir}/
    ///     ├── path_to_leaf/            (path → key, hash, value segments)
    ///     ├── key_to_path/             (disk hash map buckets, object keys only)
    ///     ├── internal_hashes/         (deep internal node hashes)
    ///     └── internal_hashes_ram.bin  (snapshot of shallow hashes, written on close)
    pub storage_dir: PathBuf,

    // -------------------------------------------------------------------------
    // Record Layout
    // -------------------------------------------------------------------------
    /// Serialized key width. `Fixed(8)` selects long-key mode.
    pub key_size: DataSize,

    /// Serialized value width
    pub value_size: DataSize,

    // -------------------------------------------------------------------------
    // Index Configuration
    // -------------------------------------------------------------------------
    /// Expected upper bound on distinct keys, sizes the key → path hash map
    pub max_key_count: u64,

    /// Path at which internal hashes move from RAM to disk.
    /// `0` puts everything on disk, `u64::MAX` keeps everything in RAM.
    pub ram_to_disk_threshold: u64,

    /// Slots per lazily allocated chunk of the off-heap indexes
    pub index_chunk_size: usize,

    // -------------------------------------------------------------------------
    // Background Work
    // -------------------------------------------------------------------------
    /// Run the background merge scheduler
    pub merging_enabled: bool,

    /// Merge cadence and tier boundaries
    pub merge: MergeConfig,

    /// Upper bound on waiting for background work during close
    pub shutdown_timeout: Duration,
}

/// Merge scheduler settings
#[derive(Debug, Clone)]
pub struct MergeConfig {
    /// Delay before the first tick
    pub initial_delay: Duration,

    /// Time between ticks
    pub period: Duration,

    /// Minimum time between full compactions
    pub full_period: Duration,

    /// Minimum time between medium compactions
    pub medium_period: Duration,

    /// Medium tier only considers segments smaller than this (bytes)
    pub medium_size_bound: u64,

    /// Light tier only considers segments smaller than this (bytes)
    pub small_size_bound: u64,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(60),
            period: Duration::from_secs(5 * 60),
            full_period: Duration::from_secs(2 * 60 * 60),
            medium_period: Duration::from_secs(30 * 60),
            medium_size_bound: 10 * 1024 * 1024 * 1024, // 10 GiB
            small_size_bound: 2 * 1024 * 1024 * 1024,   // 2 GiB
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_dir: PathBuf::from("./vmstore_data"),
            key_size: DataSize::Fixed(8),
            value_size: DataSize::Variable,
            max_key_count: 1_000_000,
            ram_to_disk_threshold: ALL_INTERNAL_HASHES_IN_RAM,
            index_chunk_size: 64 * 1024,
            merging_enabled: true,
            merge: MergeConfig::default(),
            shutdown_timeout: Duration::from_secs(5 * 60),
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Keys that serialize to exactly one u64 use the off-heap list for key → path
    pub fn is_long_key_mode(&self) -> bool {
        self.key_size == DataSize::Fixed(8)
    }

    /// Reject settings that cannot produce a working data source
    pub fn validate(&self) -> Result<()> {
        if self.key_size == DataSize::Fixed(0) {
            return Err(StoreError::Config("key_size must not be zero".to_string()));
        }
        if self.value_size == DataSize::Fixed(0) {
            return Err(StoreError::Config("value_size must not be zero".to_string()));
        }
        if self.max_key_count == 0 {
            return Err(StoreError::Config("max_key_count must be positive".to_string()));
        }
        if self.index_chunk_size == 0 {
            return Err(StoreError::Config("index_chunk_size must be positive".to_string()));
        }
        if self.merge.period.is_zero() {
            return Err(StoreError::Config("merge period must be positive".to_string()));
        }
        Ok(())
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the storage directory (root for all stores)
    pub fn storage_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.storage_dir = path.into();
        self
    }

    /// Set the serialized key width
    pub fn key_size(mut self, size: DataSize) -> Self {
        self.config.key_size = size;
        self
    }

    /// Set the serialized value width
    pub fn value_size(mut self, size: DataSize) -> Self {
        self.config.value_size = size;
        self
    }

    /// Set the expected maximum number of keys
    pub fn max_key_count(mut self, count: u64) -> Self {
        self.config.max_key_count = count;
        self
    }

    /// Set the RAM/disk split for internal hashes
    pub fn ram_to_disk_threshold(mut self, path: u64) -> Self {
        self.config.ram_to_disk_threshold = path;
        self
    }

    /// Set the number of slots per index chunk
    pub fn index_chunk_size(mut self, slots: usize) -> Self {
        self.config.index_chunk_size = slots;
        self
    }

    /// Enable or disable the background merge scheduler
    pub fn merging_enabled(mut self, enabled: bool) -> Self {
        self.config.merging_enabled = enabled;
        self
    }

    /// Replace the merge settings
    pub fn merge(mut self, merge: MergeConfig) -> Self {
        self.config.merge = merge;
        self
    }

    /// Set the close() wait bound
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_timeout = timeout;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
