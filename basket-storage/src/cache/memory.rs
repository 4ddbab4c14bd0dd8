//! In-process cache backend.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use basket_core::{CacheError, Timestamp};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::key::CacheKey;
use super::traits::{BackendStats, CacheBackend, StoredEntry};

/// `DashMap`-backed cache. Contents are lost on restart.
#[derive(Debug, Default)]
pub struct InMemoryCacheBackend {
    entries: DashMap<String, StoredEntry>,
    expired: AtomicU64,
}

impl InMemoryCacheBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl CacheBackend for InMemoryCacheBackend {
    async fn get(&self, key: &CacheKey, now: Timestamp) -> Result<Option<StoredEntry>, CacheError> {
        let encoded = key.encode();
        let found = self.entries.get(&encoded).map(|e| e.value().clone());

        match found {
            Some(entry) if entry.is_expired(now) => {
                // Only drop the entry we looked at; a concurrent put may have replaced it.
                if self
                    .entries
                    .remove_if(&encoded, |_, current| current.is_expired(now))
                    .is_some()
                {
                    self.expired.fetch_add(1, Ordering::Relaxed);
                }
                Ok(None)
            }
            other => Ok(other),
        }
    }

    async fn put(&self, key: &CacheKey, entry: StoredEntry) -> Result<(), CacheError> {
        match self.entries.entry(key.encode()) {
            Entry::Occupied(mut occupied) => {
                let stamped = entry.stamped_after(Some(occupied.get()));
                occupied.insert(stamped);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(entry);
            }
        }
        Ok(())
    }

    async fn delete(&self, key: &CacheKey) -> Result<bool, CacheError> {
        Ok(self.entries.remove(&key.encode()).is_some())
    }

    async fn stats(&self) -> Result<BackendStats, CacheError> {
        Ok(BackendStats {
            entry_count: self.entries.len() as u64,
            expired: self.expired.load(Ordering::Relaxed),
            size_bytes: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use basket_core::CacheSource;
    use chrono::{TimeZone, Utc};

    fn t0() -> Timestamp {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
    }

    fn entry(at: Timestamp, ttl_secs: u64) -> StoredEntry {
        StoredEntry {
            payload: serde_json::json!({"n": 1}),
            source: CacheSource::Fresh,
            fetched_at: at,
            ttl_secs,
        }
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let backend = InMemoryCacheBackend::new();
        let key = CacheKey::search("tv");

        backend.put(&key, entry(t0(), 60)).await.unwrap();
        let got = backend.get(&key, t0()).await.unwrap();
        assert_eq!(got, Some(entry(t0(), 60)));

        assert!(backend.delete(&key).await.unwrap());
        assert!(!backend.delete(&key).await.unwrap());
        assert_eq!(backend.get(&key, t0()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_expired_entry_is_dropped_on_read() {
        let backend = InMemoryCacheBackend::new();
        let key = CacheKey::search("tv");
        backend.put(&key, entry(t0(), 60)).await.unwrap();

        let later = t0() + chrono::Duration::seconds(61);
        assert_eq!(backend.get(&key, later).await.unwrap(), None);
        assert!(backend.is_empty());

        let stats = backend.stats().await.unwrap();
        assert_eq!(stats.expired, 1);
        assert_eq!(stats.entry_count, 0);
    }

    #[tokio::test]
    async fn test_put_keeps_fetched_at_monotonic() {
        let backend = InMemoryCacheBackend::new();
        let key = CacheKey::search("tv");
        let later = t0() + chrono::Duration::minutes(5);

        backend.put(&key, entry(later, 0)).await.unwrap();
        backend.put(&key, entry(t0(), 0)).await.unwrap();

        let got = backend.get(&key, later).await.unwrap().unwrap();
        assert_eq!(got.fetched_at, later);
    }
}
