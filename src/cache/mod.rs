//! Tiered response cache for offline support.
//!
//! This module provides the interception layer's caching mechanism:
//! - Named tiers, each with one freshness strategy, max age and entry ceiling
//! - Network-first, stale-while-revalidate and cache-first strategies
//! - Lazy expiration and insertion-order eviction after every write
//! - SQLite persistence shared with the write queue and bundle manifest

pub mod lifecycle;
mod layer;
mod storage;
pub mod tier;
mod traits;

pub use layer::CacheLayer;
pub use storage::SqliteStorage;
pub use tier::{TierName, TierPolicy, TierTable, TiersConfig};
pub use traits::{CacheEntry, CacheKey, CacheResult, CacheSource, CacheStorage};
