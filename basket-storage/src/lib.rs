//! BASKET Storage
//!
//! The freshness cache sitting in front of every search. Reads report how
//! old the data is; writes stamp it. Two backends ship: an in-process map
//! for single-node deployments and tests, and LMDB for a cache that
//! survives restarts.

pub mod cache;

pub use cache::{
    open_backend, BackendStats, CacheBackend, CacheBackendKind, CacheConfig, CacheEntry,
    CacheKey, CacheLookup, CacheNamespace, CacheStats, FreshnessCache, Freshness,
    InMemoryCacheBackend, LmdbCacheBackend, LmdbCacheError, StoredEntry,
};
