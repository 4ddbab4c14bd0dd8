//! Freshness contracts for cache reads.
//!
//! A read states how old it is willing to accept data, and the result says
//! whether the entry crossed that line. Staleness never hides an entry: a
//! stale hit is still returned so the caller can serve it while a refresh
//! runs.

use basket_core::{CacheSource, Timestamp};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Staleness tolerance for a cache read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Freshness {
    /// Entries older than `minutes` are reported stale.
    MaxAge { minutes: u64 },

    /// Entries are fresh for their whole TTL.
    #[default]
    UntilExpiry,
}

impl Freshness {
    pub fn minutes(minutes: u64) -> Self {
        Self::MaxAge { minutes }
    }

    pub fn until_expiry() -> Self {
        Self::UntilExpiry
    }

    /// Build from an optional threshold; `None` means fresh until expiry.
    pub fn from_threshold(minutes: Option<u64>) -> Self {
        minutes.map_or(Self::UntilExpiry, Self::minutes)
    }

    /// `(now - fetched_at) > minutes * 60_000` ms. Always false without a
    /// threshold.
    pub fn is_stale(&self, fetched_at: Timestamp, now: Timestamp) -> bool {
        match self {
            Self::MaxAge { minutes } => {
                let age_ms = (now - fetched_at).num_milliseconds();
                let limit_ms = i64::try_from(*minutes)
                    .unwrap_or(i64::MAX)
                    .saturating_mul(60_000);
                age_ms > limit_ms
            }
            Self::UntilExpiry => false,
        }
    }
}

impl From<Option<u64>> for Freshness {
    fn from(minutes: Option<u64>) -> Self {
        Self::from_threshold(minutes)
    }
}

/// A typed cache entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry<T> {
    pub key: String,
    pub payload: T,
    pub source: CacheSource,
    pub fetched_at: Timestamp,
    pub ttl_seconds: u64,
}

/// Result of a metadata read: the payload plus its provenance and whether
/// it is stale under the requested [`Freshness`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheLookup<T> {
    pub data: T,
    pub source: CacheSource,
    #[serde(rename = "fetchedAt")]
    pub fetched_at: Timestamp,
    pub is_stale: bool,
}

impl<T> CacheLookup<T> {
    /// Age of the entry relative to `now`. Zero if the clock went backwards.
    pub fn staleness(&self, now: Timestamp) -> Duration {
        (now - self.fetched_at).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn into_data(self) -> T {
        self.data
    }

    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> CacheLookup<U> {
        CacheLookup {
            data: f(self.data),
            source: self.source,
            fetched_at: self.fetched_at,
            is_stale: self.is_stale,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use proptest::prelude::*;

    fn t0() -> Timestamp {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_max_age_boundary_is_not_stale() {
        let freshness = Freshness::minutes(120);
        let fetched = t0();
        assert!(!freshness.is_stale(fetched, fetched + chrono::Duration::minutes(120)));
        assert!(freshness.is_stale(
            fetched,
            fetched + chrono::Duration::minutes(120) + chrono::Duration::milliseconds(1)
        ));
    }

    #[test]
    fn test_until_expiry_is_never_stale() {
        let freshness = Freshness::from_threshold(None);
        assert_eq!(freshness, Freshness::UntilExpiry);
        assert!(!freshness.is_stale(t0(), t0() + chrono::Duration::days(365)));
    }

    #[test]
    fn test_lookup_serializes_wire_names() {
        let lookup = CacheLookup {
            data: vec![1, 2],
            source: CacheSource::Cache,
            fetched_at: t0(),
            is_stale: true,
        };
        let json = serde_json::to_value(&lookup).unwrap();
        assert_eq!(json["source"], "cache");
        assert_eq!(json["is_stale"], true);
        assert!(json.get("fetchedAt").is_some());
    }

    #[test]
    fn test_lookup_staleness_clamps_negative() {
        let lookup = CacheLookup {
            data: (),
            source: CacheSource::Fresh,
            fetched_at: t0(),
            is_stale: false,
        };
        assert_eq!(lookup.staleness(t0() - chrono::Duration::seconds(5)), Duration::ZERO);
        assert_eq!(
            lookup.staleness(t0() + chrono::Duration::seconds(5)),
            Duration::from_secs(5)
        );
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_is_stale_matches_threshold_predicate(
            age_ms in 0i64..(72 * 3_600_000),
            threshold in 0u64..(48 * 60),
        ) {
            let fetched = t0();
            let now = fetched + chrono::Duration::milliseconds(age_ms);
            let expected = age_ms > (threshold as i64) * 60_000;
            prop_assert_eq!(Freshness::minutes(threshold).is_stale(fetched, now), expected);
        }
    }
}
