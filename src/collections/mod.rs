//! Collections Module
//!
//! Index structures that keep huge maps outside ordinary heap allocations.
//!
//! ## Responsibilities
//! - `LongList`: u64 slots addressed by index (key → path, locator → location)
//! - `HashList`: 48-byte digest slots addressed by path (shallow internal hashes)
//! - `HalfDiskHashMap`: key bytes → path with the bucket index off-heap and
//!   bucket contents on disk
//!
//! ## Memory Layout
//! ```text
//! directory (ArcSwap<Vec<Option<Arc<Chunk>>>>)
//!   ├── [0] ─► chunk: slots 0 .. chunk_size
//!   ├── [1] ─► None (never written, never allocated)
//!   └── [2] ─► chunk: slots 2*chunk_size .. 3*chunk_size
//! ```

mod chunks;
mod half_disk_map;
mod hash_list;
mod long_list;

pub use half_disk_map::{HalfDiskHashMap, HashMapBatch};
pub use hash_list::{HashList, DEFAULT_HASH_CHUNK_SIZE};
pub use long_list::{LongList, DEFAULT_LONG_CHUNK_SIZE};
