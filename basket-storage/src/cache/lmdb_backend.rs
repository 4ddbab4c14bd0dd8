//! LMDB-backed cache implementation.
//!
//! Uses the heed crate (Rust bindings for LMDB) so the freshness cache
//! survives process restarts.
//!
//! # Value Layout
//!
//! Every value is a fixed 17-byte header followed by the JSON payload:
//! - Bytes 0-7: `fetched_at` as little-endian unix millis
//! - Bytes 8-15: TTL in seconds, little-endian
//! - Byte 16: source discriminant
//! - Bytes 17..: JSON payload
//!
//! # Thread Safety
//!
//! LMDB provides ACID transactions with a single writer. `put` reads the
//! previous stamp and writes the new value inside one write transaction,
//! which keeps `fetched_at` monotonic per key without extra locking.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use basket_core::{CacheError, CacheSource, Timestamp};
use chrono::DateTime;
use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions};

use super::key::CacheKey;
use super::traits::{BackendStats, CacheBackend, StoredEntry};

const HEADER_LEN: usize = 17;

/// Error type for LMDB cache operations.
#[derive(Debug, thiserror::Error)]
pub enum LmdbCacheError {
    /// Failed to open or create the LMDB environment.
    #[error("Failed to open LMDB environment: {0}")]
    EnvOpen(String),

    /// Failed to open the database within the environment.
    #[error("Failed to open database: {0}")]
    DbOpen(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Corrupt entry: {0}")]
    Corrupt(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<LmdbCacheError> for CacheError {
    fn from(e: LmdbCacheError) -> Self {
        match e {
            LmdbCacheError::Serialization(reason) => CacheError::Serialization { reason },
            other => CacheError::BackendUnavailable {
                reason: other.to_string(),
            },
        }
    }
}

fn source_to_byte(source: CacheSource) -> u8 {
    match source {
        CacheSource::Fresh => 0,
        CacheSource::Cache => 1,
        CacheSource::None => 2,
        CacheSource::Error => 3,
    }
}

fn source_from_byte(byte: u8) -> Option<CacheSource> {
    match byte {
        0 => Some(CacheSource::Fresh),
        1 => Some(CacheSource::Cache),
        2 => Some(CacheSource::None),
        3 => Some(CacheSource::Error),
        _ => None,
    }
}

fn encode_entry(entry: &StoredEntry) -> Result<Vec<u8>, LmdbCacheError> {
    let payload = serde_json::to_vec(&entry.payload)
        .map_err(|e| LmdbCacheError::Serialization(e.to_string()))?;

    let mut bytes = Vec::with_capacity(HEADER_LEN + payload.len());
    bytes.extend_from_slice(&entry.fetched_at.timestamp_millis().to_le_bytes());
    bytes.extend_from_slice(&entry.ttl_secs.to_le_bytes());
    bytes.push(source_to_byte(entry.source));
    bytes.extend_from_slice(&payload);
    Ok(bytes)
}

fn decode_entry(bytes: &[u8]) -> Result<StoredEntry, LmdbCacheError> {
    if bytes.len() < HEADER_LEN {
        return Err(LmdbCacheError::Corrupt(format!(
            "value is {} bytes, header needs {HEADER_LEN}",
            bytes.len()
        )));
    }

    let mut millis = [0u8; 8];
    millis.copy_from_slice(&bytes[0..8]);
    let mut ttl = [0u8; 8];
    ttl.copy_from_slice(&bytes[8..16]);

    let fetched_at = DateTime::from_timestamp_millis(i64::from_le_bytes(millis))
        .ok_or_else(|| LmdbCacheError::Corrupt("timestamp out of range".into()))?;
    let source = source_from_byte(bytes[16])
        .ok_or_else(|| LmdbCacheError::Corrupt(format!("unknown source byte {}", bytes[16])))?;
    let payload = serde_json::from_slice(&bytes[HEADER_LEN..])
        .map_err(|e| LmdbCacheError::Corrupt(e.to_string()))?;

    Ok(StoredEntry {
        payload,
        source,
        fetched_at,
        ttl_secs: u64::from_le_bytes(ttl),
    })
}

/// LMDB-backed freshness cache storage.
pub struct LmdbCacheBackend {
    env: Env,
    /// The main database (single unnamed database).
    db: Database<Bytes, Bytes>,
    expired: AtomicU64,
}

impl std::fmt::Debug for LmdbCacheBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LmdbCacheBackend")
            .field("path", &self.env.path())
            .finish_non_exhaustive()
    }
}

impl LmdbCacheBackend {
    /// Open (or create) an LMDB cache under `path`, capped at `max_size_mb`.
    pub fn new<P: AsRef<Path>>(path: P, max_size_mb: usize) -> Result<Self, LmdbCacheError> {
        let map_size = max_size_mb
            .checked_mul(1024 * 1024)
            .ok_or_else(|| LmdbCacheError::EnvOpen(format!("map size of {max_size_mb} MB overflows")))?;
        std::fs::create_dir_all(&path)?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(map_size)
                .max_dbs(1)
                .open(path.as_ref())
        }
        .map_err(|e| LmdbCacheError::EnvOpen(e.to_string()))?;

        let mut wtxn = env
            .write_txn()
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;

        let db: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, None)
            .map_err(|e| LmdbCacheError::DbOpen(e.to_string()))?;

        wtxn.commit()
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;

        Ok(Self {
            env,
            db,
            expired: AtomicU64::new(0),
        })
    }

    fn read(&self, encoded: &[u8]) -> Result<Option<StoredEntry>, LmdbCacheError> {
        let rtxn = self
            .env
            .read_txn()
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;

        match self.db.get(&rtxn, encoded) {
            Ok(Some(bytes)) => decode_entry(bytes).map(Some),
            Ok(None) => Ok(None),
            Err(e) => Err(LmdbCacheError::Transaction(e.to_string())),
        }
    }

    /// Delete `encoded` if it is still expired at `now`.
    fn drop_if_expired(&self, encoded: &[u8], now: Timestamp) -> Result<bool, LmdbCacheError> {
        let mut wtxn = self
            .env
            .write_txn()
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;

        let still_expired = match self.db.get(&wtxn, encoded) {
            Ok(Some(bytes)) => decode_entry(bytes).map_or(true, |entry| entry.is_expired(now)),
            Ok(None) => false,
            Err(e) => return Err(LmdbCacheError::Transaction(e.to_string())),
        };

        if still_expired {
            self.db
                .delete(&mut wtxn, encoded)
                .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;
        }

        wtxn.commit()
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;
        Ok(still_expired)
    }

    fn write(&self, encoded: &[u8], entry: StoredEntry) -> Result<(), LmdbCacheError> {
        let mut wtxn = self
            .env
            .write_txn()
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;

        let previous = match self.db.get(&wtxn, encoded) {
            Ok(Some(bytes)) => decode_entry(bytes).ok(),
            Ok(None) => None,
            Err(e) => return Err(LmdbCacheError::Transaction(e.to_string())),
        };
        let value = encode_entry(&entry.stamped_after(previous.as_ref()))?;

        self.db
            .put(&mut wtxn, encoded, &value)
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;

        wtxn.commit()
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))
    }

    fn remove(&self, encoded: &[u8]) -> Result<bool, LmdbCacheError> {
        let mut wtxn = self
            .env
            .write_txn()
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;

        let deleted = self
            .db
            .delete(&mut wtxn, encoded)
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;

        wtxn.commit()
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;
        Ok(deleted)
    }

    fn count(&self) -> Result<u64, LmdbCacheError> {
        let rtxn = self
            .env
            .read_txn()
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;
        self.db
            .len(&rtxn)
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))
    }
}

#[async_trait]
impl CacheBackend for LmdbCacheBackend {
    async fn get(&self, key: &CacheKey, now: Timestamp) -> Result<Option<StoredEntry>, CacheError> {
        let encoded = key.encode();
        let read_failed = |e: LmdbCacheError| CacheError::ReadFailed {
            key: encoded.clone(),
            reason: e.to_string(),
        };

        let entry = match self.read(encoded.as_bytes()) {
            Ok(entry) => entry,
            Err(LmdbCacheError::Corrupt(reason)) => {
                tracing::warn!(key = %encoded, reason = %reason, "Dropping corrupt cache entry");
                self.remove(encoded.as_bytes()).map_err(read_failed)?;
                None
            }
            Err(e) => return Err(read_failed(e)),
        };

        match entry {
            Some(entry) if entry.is_expired(now) => {
                if self
                    .drop_if_expired(encoded.as_bytes(), now)
                    .map_err(read_failed)?
                {
                    self.expired.fetch_add(1, Ordering::Relaxed);
                }
                Ok(None)
            }
            other => Ok(other),
        }
    }

    async fn put(&self, key: &CacheKey, entry: StoredEntry) -> Result<(), CacheError> {
        let encoded = key.encode();
        self.write(encoded.as_bytes(), entry).map_err(|e| match e {
            LmdbCacheError::Serialization(reason) => CacheError::Serialization { reason },
            other => CacheError::WriteFailed {
                key: encoded.clone(),
                reason: other.to_string(),
            },
        })
    }

    async fn delete(&self, key: &CacheKey) -> Result<bool, CacheError> {
        let encoded = key.encode();
        self.remove(encoded.as_bytes())
            .map_err(|e| CacheError::WriteFailed {
                key: encoded.clone(),
                reason: e.to_string(),
            })
    }

    async fn stats(&self) -> Result<BackendStats, CacheError> {
        let entry_count = self.count()?;
        let size_bytes = self
            .env
            .real_disk_size()
            .map_err(|e| CacheError::BackendUnavailable {
                reason: e.to_string(),
            })?;

        Ok(BackendStats {
            entry_count,
            expired: self.expired.load(Ordering::Relaxed),
            size_bytes,
        })
    }
}
