//! # vmstore
//!
//! Hybrid RAM/disk storage engine for a virtual binary merkle tree:
//! - Off-heap chunked indexes (path → location, key → path, path → hash)
//! - Append-only, immutable segment files, one per store per round
//! - Single-writer / multi-reader commit protocol with lock-free reads
//! - Tiered background compaction
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    VirtualDataSource                         │
//! │        load_* (any thread)   save_records (one round)        │
//! └───────┬──────────────────────┬──────────────────────┬───────┘
//!         │                      │                      │
//!         ▼                      ▼                      ▼
//!  ┌─────────────┐      ┌────────────────┐     ┌────────────────┐
//!  │ Leaf Store  │      │   Key Index    │     │ Internal Hash  │
//!  │ path → leaf │      │  key → path    │     │     Router     │
//!  └──────┬──────┘      │ LongList or    │     │ RAM │ disk     │
//!         │             │ HalfDiskHashMap│     └──┬──┴───┬──────┘
//!         │             └───────┬────────┘        │      │
//!         ▼                     ▼                 ▼      ▼
//!  ┌─────────────────────────────────────┐  ┌─────────┐ ┌──────────────┐
//!  │   IndexedStore (LongList index +    │  │HashList │ │ IndexedStore │
//!  │   SegmentManager, ArcSwap publish)  │  └─────────┘ └──────────────┘
//!  └─────────────────┬───────────────────┘
//!                    ▲
//!           ┌────────┴────────┐
//!           │ MergeScheduler  │
//!           │ (background)    │
//!           └─────────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod config;
pub mod error;
pub mod record;

pub mod collections;
pub mod segment;
pub mod storage;

pub mod data_source;
pub mod internal_hashes;
pub mod merge;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use config::{Config, DataSize, MergeConfig, ALL_INTERNAL_HASHES_IN_RAM, ALL_INTERNAL_HASHES_ON_DISK};
pub use data_source::{LegacyOperation, VirtualDataSource};
pub use error::{Result, StoreError};
pub use internal_hashes::{HashTier, InternalHashRouter};
pub use merge::{MergeScheduler, MergeTier};
pub use record::{Hash, InternalRecord, LeafRecord, StoreKey, StoreValue, HASH_SIZE};
pub use storage::{IndexedStore, MergeStats, ValidRange};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of vmstore
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
