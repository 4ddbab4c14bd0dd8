//! The freshness cache: typed reads and writes over a [`CacheBackend`].

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use basket_core::constants::{
    DEFAULT_FRESHNESS_THRESHOLD_MINUTES, DEFAULT_LMDB_MAX_SIZE_MB, DEFAULT_SEARCH_TTL_SECS,
};
use basket_core::{CacheError, CacheSource, ConfigError, SharedClock};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::freshness::{CacheEntry, CacheLookup, Freshness};
use super::key::CacheKey;
use super::lmdb_backend::LmdbCacheBackend;
use super::memory::InMemoryCacheBackend;
use super::traits::{CacheBackend, CacheStats, StoredEntry};

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheBackendKind {
    #[default]
    Memory,
    Lmdb,
}

impl std::str::FromStr for CacheBackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "lmdb" => Ok(Self::Lmdb),
            other => Err(ConfigError::InvalidValue {
                field: "BASKET_CACHE_BACKEND".to_string(),
                value: other.to_string(),
                reason: "expected 'memory' or 'lmdb'".to_string(),
            }),
        }
    }
}

/// Configuration for the freshness cache.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    /// Age after which search results are served stale and refreshed.
    pub freshness_threshold_minutes: u64,
    /// Storage TTL for search results.
    pub search_ttl_secs: u64,
    pub backend: CacheBackendKind,
    pub lmdb_path: PathBuf,
    pub lmdb_max_size_mb: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            freshness_threshold_minutes: DEFAULT_FRESHNESS_THRESHOLD_MINUTES,
            search_ttl_secs: DEFAULT_SEARCH_TTL_SECS,
            backend: CacheBackendKind::Memory,
            lmdb_path: PathBuf::from("./data/cache"),
            lmdb_max_size_mb: DEFAULT_LMDB_MAX_SIZE_MB,
        }
    }
}

impl CacheConfig {
    /// Environment variables:
    /// - `BASKET_FRESHNESS_THRESHOLD_MINUTES` (default: 120)
    /// - `BASKET_SEARCH_TTL_SECS` (default: 86400)
    /// - `BASKET_CACHE_BACKEND`: `memory` or `lmdb` (default: memory)
    /// - `BASKET_LMDB_PATH` (default: ./data/cache)
    /// - `BASKET_LMDB_MAX_SIZE_MB` (default: 1024)
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let backend = match std::env::var("BASKET_CACHE_BACKEND") {
            Ok(raw) => raw.parse()?,
            Err(_) => defaults.backend,
        };

        Ok(Self {
            freshness_threshold_minutes: std::env::var("BASKET_FRESHNESS_THRESHOLD_MINUTES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.freshness_threshold_minutes),
            search_ttl_secs: std::env::var("BASKET_SEARCH_TTL_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.search_ttl_secs),
            backend,
            lmdb_path: std::env::var("BASKET_LMDB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.lmdb_path),
            lmdb_max_size_mb: std::env::var("BASKET_LMDB_MAX_SIZE_MB")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.lmdb_max_size_mb),
        })
    }

    pub fn with_freshness_threshold_minutes(mut self, minutes: u64) -> Self {
        self.freshness_threshold_minutes = minutes;
        self
    }

    pub fn with_search_ttl_secs(mut self, secs: u64) -> Self {
        self.search_ttl_secs = secs;
        self
    }

    pub fn with_lmdb(mut self, path: impl Into<PathBuf>) -> Self {
        self.backend = CacheBackendKind::Lmdb;
        self.lmdb_path = path.into();
        self
    }

    pub fn freshness(&self) -> Freshness {
        Freshness::minutes(self.freshness_threshold_minutes)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backend == CacheBackendKind::Lmdb && self.lmdb_max_size_mb == 0 {
            return Err(ConfigError::InvalidValue {
                field: "BASKET_LMDB_MAX_SIZE_MB".to_string(),
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

/// Build the backend selected by `config`.
pub fn open_backend(config: &CacheConfig) -> Result<Arc<dyn CacheBackend>, CacheError> {
    match config.backend {
        CacheBackendKind::Memory => Ok(Arc::new(InMemoryCacheBackend::new())),
        CacheBackendKind::Lmdb => {
            let backend = LmdbCacheBackend::new(&config.lmdb_path, config.lmdb_max_size_mb)?;
            tracing::info!(path = %config.lmdb_path.display(), "Opened LMDB cache");
            Ok(Arc::new(backend))
        }
    }
}

// ============================================================================
// FRESHNESS CACHE
// ============================================================================

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    stale_hits: AtomicU64,
    read_errors: AtomicU64,
    write_errors: AtomicU64,
}

/// Typed cache with staleness metadata on every read.
///
/// Reads fail open: a backend error or an undecodable payload is logged and
/// reported as a miss so the caller falls through to a fresh fetch. Writes
/// surface their errors.
pub struct FreshnessCache {
    backend: Arc<dyn CacheBackend>,
    clock: SharedClock,
    counters: Counters,
}

impl std::fmt::Debug for FreshnessCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FreshnessCache")
            .field("counters", &self.counters)
            .finish_non_exhaustive()
    }
}

impl FreshnessCache {
    pub fn new(backend: Arc<dyn CacheBackend>, clock: SharedClock) -> Self {
        Self {
            backend,
            clock,
            counters: Counters::default(),
        }
    }

    async fn read<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<(StoredEntry, T)> {
        let now = self.clock.now();
        let stored = match self.backend.get(key, now).await {
            Ok(Some(stored)) => stored,
            Ok(None) => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(key = %key, "Cache miss");
                return None;
            }
            Err(e) => {
                self.counters.read_errors.fetch_add(1, Ordering::Relaxed);
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(key = %key, error = %e, "Cache read failed, treating as miss");
                return None;
            }
        };

        match serde_json::from_value::<T>(stored.payload.clone()) {
            Ok(payload) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                Some((stored, payload))
            }
            Err(e) => {
                self.counters.read_errors.fetch_add(1, Ordering::Relaxed);
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(key = %key, error = %e, "Cache payload undecodable, treating as miss");
                None
            }
        }
    }

    /// Entry for `key`, or `None` when absent, expired or unreadable.
    pub async fn get<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<CacheEntry<T>> {
        let (stored, payload) = self.read(key).await?;
        Some(CacheEntry {
            key: key.encode(),
            payload,
            source: stored.source,
            fetched_at: stored.fetched_at,
            ttl_seconds: stored.ttl_secs,
        })
    }

    /// Entry for `key` with its staleness under `freshness`.
    pub async fn get_with_metadata<T: DeserializeOwned>(
        &self,
        key: &CacheKey,
        freshness: Freshness,
    ) -> Option<CacheLookup<T>> {
        let (stored, data) = self.read(key).await?;
        let is_stale = freshness.is_stale(stored.fetched_at, self.clock.now());
        if is_stale {
            self.counters.stale_hits.fetch_add(1, Ordering::Relaxed);
        }

        Some(CacheLookup {
            data,
            source: stored.source,
            fetched_at: stored.fetched_at,
            is_stale,
        })
    }

    /// Store `payload` under `key`, stamped with the current time.
    pub async fn set<T: Serialize>(
        &self,
        key: &CacheKey,
        payload: &T,
        ttl_secs: u64,
        source: CacheSource,
    ) -> Result<(), CacheError> {
        let payload = serde_json::to_value(payload).map_err(|e| CacheError::Serialization {
            reason: e.to_string(),
        })?;
        let entry = StoredEntry {
            payload,
            source,
            fetched_at: self.clock.now(),
            ttl_secs,
        };

        self.backend.put(key, entry).await.inspect_err(|e| {
            self.counters.write_errors.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(key = %key, error = %e, "Cache write failed");
        })
    }

    /// Remove `key` immediately. Returns whether an entry existed.
    pub async fn invalidate(&self, key: &CacheKey) -> Result<bool, CacheError> {
        let removed = self.backend.delete(key).await?;
        tracing::debug!(key = %key, removed, "Cache entry invalidated");
        Ok(removed)
    }

    pub async fn stats(&self) -> CacheStats {
        let backend = self.backend.stats().await.unwrap_or_default();
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            stale_hits: self.counters.stale_hits.load(Ordering::Relaxed),
            read_errors: self.counters.read_errors.load(Ordering::Relaxed),
            write_errors: self.counters.write_errors.load(Ordering::Relaxed),
            entry_count: backend.entry_count,
            expired: backend.expired,
        }
    }
}
