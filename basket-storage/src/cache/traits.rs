//! Cache backend trait and the entry format every backend stores.

use async_trait::async_trait;
use basket_core::{CacheError, CacheSource, Timestamp};
use serde::{Deserialize, Serialize};

use super::key::CacheKey;

/// What a backend persists for one key.
///
/// The payload is kept as JSON so backends stay untyped; the freshness
/// cache handles (de)serialization of the caller's type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEntry {
    pub payload: serde_json::Value,
    pub source: CacheSource,
    pub fetched_at: Timestamp,
    /// Zero disables expiry.
    pub ttl_secs: u64,
}

impl StoredEntry {
    pub fn expires_at(&self) -> Option<Timestamp> {
        if self.ttl_secs == 0 {
            return None;
        }
        let secs = i64::try_from(self.ttl_secs).ok()?;
        let ttl = chrono::Duration::try_seconds(secs)?;
        self.fetched_at.checked_add_signed(ttl)
    }

    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.expires_at().is_some_and(|at| now >= at)
    }

    /// Keep `fetched_at` non-decreasing per key: if an incoming entry is
    /// stamped earlier than what is stored, it inherits the stored stamp.
    pub fn stamped_after(mut self, previous: Option<&StoredEntry>) -> Self {
        if let Some(previous) = previous {
            if previous.fetched_at > self.fetched_at {
                self.fetched_at = previous.fetched_at;
            }
        }
        self
    }
}

/// Backend-level counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendStats {
    pub entry_count: u64,
    /// Entries dropped on read because their TTL had passed.
    pub expired: u64,
    /// Approximate stored size, when the backend can tell.
    pub size_bytes: u64,
}

/// Pluggable storage behind the freshness cache.
///
/// Implementations must:
/// - treat an entry whose TTL has passed as absent on `get`, and drop it
/// - keep `fetched_at` monotonic per key on `put` (see [`StoredEntry::stamped_after`])
/// - be safe for concurrent use
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Fetch an unexpired entry.
    async fn get(&self, key: &CacheKey, now: Timestamp) -> Result<Option<StoredEntry>, CacheError>;

    /// Store an entry, replacing any previous value for the key.
    async fn put(&self, key: &CacheKey, entry: StoredEntry) -> Result<(), CacheError>;

    /// Remove an entry. Returns whether anything was removed.
    async fn delete(&self, key: &CacheKey) -> Result<bool, CacheError>;

    async fn stats(&self) -> Result<BackendStats, CacheError>;
}

/// Read-side statistics reported by the freshness cache.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Hits that were past the requested staleness threshold.
    pub stale_hits: u64,
    pub read_errors: u64,
    pub write_errors: u64,
    pub entry_count: u64,
    pub expired: u64,
}

impl CacheStats {
    /// Hits over total reads, 0.0 when nothing was read.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
