//! Freshness cache with explicit staleness and pluggable storage.
//!
//! Reads never hide how old their data is: [`FreshnessCache::get_with_metadata`]
//! returns a [`CacheLookup`] carrying `fetched_at` and an `is_stale` flag
//! computed against the caller's [`Freshness`]. Stale entries are still
//! served; deciding to refresh is the caller's job.
//!
//! # Keys
//!
//! [`CacheKey`] is built only through namespace constructors, so search
//! queries are normalized identically on every path.
//!
//! # Expiry
//!
//! TTL expiry happens at the storage layer. Backends drop an entry lazily
//! the first time it is read after `fetched_at + ttl`.

pub mod freshness;
pub mod key;
pub mod lmdb_backend;
pub mod memory;
pub mod store;
pub mod traits;

pub use freshness::{CacheEntry, CacheLookup, Freshness};
pub use key::{CacheKey, CacheNamespace};
pub use lmdb_backend::{LmdbCacheBackend, LmdbCacheError};
pub use memory::InMemoryCacheBackend;
pub use store::{open_backend, CacheBackendKind, CacheConfig, FreshnessCache};
pub use traits::{BackendStats, CacheBackend, CacheStats, StoredEntry};
