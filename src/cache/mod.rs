//! Response cache used as a read-through fallback while offline.
//!
//! - One entry per logical request key, last write wins
//! - Entries carry a last-modified time and a category tag
//! - Old entries are pruned by retention window

mod layer;
mod storage;
mod traits;

pub use layer::CacheLayer;
pub use storage::{CacheStore, MemoryCacheStore, SqliteCacheStore};
pub use traits::{request_key, CacheEntry, CacheResult, CacheSource};
