//! Durable local cache for fetched documents
//!
//! Each key is stored as one JSON file holding the value, the time it was
//! written, and its TTL. Lookups distinguish a miss, an expired entry, and a
//! corrupt entry, and the cache keeps running hit/miss/size counters.

mod entry;
mod error;
mod manager;
mod stats;

pub use entry::{entry_path, is_expired, CacheEntry, ENTRY_EXTENSION};
pub use error::CacheError;
pub use manager::Cache;
pub use stats::CacheStats;
