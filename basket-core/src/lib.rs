//! BASKET Core - Shared Types
//!
//! Product records, identity rules, clocks and the error taxonomy used by
//! every other BASKET crate. Nothing in here performs I/O.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub mod clock;
pub mod config;
pub mod constants;
pub mod error;
pub mod identity;

pub use clock::{system_clock, Clock, SharedClock, SystemClock};
pub use config::{RateLimitConfig, ReconcileConfig};
pub use error::{
    BasketError, BasketResult, CacheError, ConfigError, DeliveryError, FetchError, JobError,
    StorageError, ValidationError,
};
pub use identity::{canonical_url, identity_key, is_url_identity, names_match, normalize_name};

// ============================================================================
// PRIMITIVES
// ============================================================================

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Opaque identifier for a client connection on the notification bus.
pub type ConnectionId = String;

/// Name of an external product source, e.g. `amazon.sa`.
pub type SourceName = String;

// ============================================================================
// PRODUCT RECORD
// ============================================================================

/// A single product as seen on one source site.
///
/// `identity_key` is derived from the URL when one exists, otherwise from
/// `site + normalized name`. Build records through [`ProductRecord::new`] and
/// call [`ProductRecord::rekey`] after editing `site`, `name` or `url` by hand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductRecord {
    pub identity_key: String,
    pub site: String,
    pub name: String,
    /// Unknown prices are `None`. A zero price is treated as unknown when merging.
    pub price: Option<Decimal>,
    pub currency: String,
    pub url: String,
    pub image: Option<String>,
    pub first_seen_at: Timestamp,
    pub last_seen_at: Timestamp,
    #[serde(default)]
    pub removed: bool,
}

impl ProductRecord {
    /// Build a record first seen at `seen_at`.
    pub fn new(
        site: impl Into<String>,
        name: impl Into<String>,
        url: impl Into<String>,
        seen_at: Timestamp,
    ) -> Self {
        let site = site.into();
        let name = name.into();
        let url = url.into();
        Self {
            identity_key: identity_key(&site, &name, &url),
            site,
            name,
            price: None,
            currency: String::new(),
            url,
            image: None,
            first_seen_at: seen_at,
            last_seen_at: seen_at,
            removed: false,
        }
    }

    pub fn with_price(mut self, price: Decimal) -> Self {
        self.price = Some(price);
        self
    }

    pub fn with_currency(mut self, currency: impl Into<String>) -> Self {
        self.currency = currency.into();
        self
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    /// Price usable for comparison: present and non-zero.
    pub fn known_price(&self) -> Option<Decimal> {
        self.price.filter(|p| !p.is_zero())
    }

    /// Recompute the identity key after fields were edited in place.
    pub fn rekey(&mut self) {
        self.identity_key = identity_key(&self.site, &self.name, &self.url);
    }
}

// ============================================================================
// CACHE PROVENANCE
// ============================================================================

/// Where the data handed to a caller came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheSource {
    /// Fetched from the sources during this request or refresh.
    Fresh,
    /// Served from the freshness cache.
    Cache,
    /// Nothing available yet; a refresh has been scheduled.
    None,
    /// The read path degraded.
    Error,
}

impl CacheSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheSource::Fresh => "fresh",
            CacheSource::Cache => "cache",
            CacheSource::None => "none",
            CacheSource::Error => "error",
        }
    }
}

impl std::fmt::Display for CacheSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
