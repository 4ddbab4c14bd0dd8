//! Shared configuration
//!
//! Reconciliation and rate limit settings are consumed by more than one
//! crate, so they live here. Each struct carries its defaults, `with_*`
//! builders and a `from_env()` constructor reading `BASKET_*` variables.

use crate::constants::*;
use crate::error::ConfigError;
use std::collections::HashMap;
use std::time::Duration;

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

fn env_bool(name: &str) -> Option<bool> {
    std::env::var(name)
        .ok()
        .map(|s| matches!(s.trim().to_lowercase().as_str(), "true" | "1" | "yes"))
}

fn ratio_in_range(field: &str, value: f64) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::InvalidValue {
            field: field.to_string(),
            value: value.to_string(),
            reason: "must be between 0.0 and 1.0".to_string(),
        })
    }
}

// ============================================================================
// RECONCILIATION
// ============================================================================

/// Options for merging a fresh scrape into the cached set and deciding
/// whether the change warrants a UI rebuild.
///
/// One instance feeds both `merge` and `should_rebuild`.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileConfig {
    /// Take the fresh price unless it is absent or zero.
    pub prioritize_new_prices: bool,
    /// Retain unseen cached records tagged `removed` instead of dropping them.
    pub keep_removed: bool,
    /// Removal share above which the scrape is treated as anomalous and
    /// the unseen records are kept untouched.
    pub max_removal_ratio: f64,
    pub min_new_items_threshold: usize,
    pub require_price_changes: bool,
    pub price_change_ratio: f64,
    pub removal_rebuild_ratio: f64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            prioritize_new_prices: true,
            keep_removed: false,
            max_removal_ratio: DEFAULT_MAX_REMOVAL_RATIO,
            min_new_items_threshold: DEFAULT_MIN_NEW_ITEMS_THRESHOLD,
            require_price_changes: true,
            price_change_ratio: DEFAULT_PRICE_CHANGE_RATIO,
            removal_rebuild_ratio: DEFAULT_REMOVAL_REBUILD_RATIO,
        }
    }
}

impl ReconcileConfig {
    /// Environment variables:
    /// - `BASKET_RECONCILE_PRIORITIZE_NEW_PRICES` (default: true)
    /// - `BASKET_RECONCILE_KEEP_REMOVED` (default: false)
    /// - `BASKET_RECONCILE_MAX_REMOVAL_RATIO` (default: 0.5)
    /// - `BASKET_RECONCILE_MIN_NEW_ITEMS` (default: 1)
    /// - `BASKET_RECONCILE_REQUIRE_PRICE_CHANGES` (default: true)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            prioritize_new_prices: env_bool("BASKET_RECONCILE_PRIORITIZE_NEW_PRICES")
                .unwrap_or(defaults.prioritize_new_prices),
            keep_removed: env_bool("BASKET_RECONCILE_KEEP_REMOVED")
                .unwrap_or(defaults.keep_removed),
            max_removal_ratio: env_parse("BASKET_RECONCILE_MAX_REMOVAL_RATIO")
                .unwrap_or(defaults.max_removal_ratio),
            min_new_items_threshold: env_parse("BASKET_RECONCILE_MIN_NEW_ITEMS")
                .unwrap_or(defaults.min_new_items_threshold),
            require_price_changes: env_bool("BASKET_RECONCILE_REQUIRE_PRICE_CHANGES")
                .unwrap_or(defaults.require_price_changes),
            ..defaults
        }
    }

    pub fn with_keep_removed(mut self, keep: bool) -> Self {
        self.keep_removed = keep;
        self
    }

    pub fn with_prioritize_new_prices(mut self, prioritize: bool) -> Self {
        self.prioritize_new_prices = prioritize;
        self
    }

    pub fn with_max_removal_ratio(mut self, ratio: f64) -> Self {
        self.max_removal_ratio = ratio;
        self
    }

    pub fn with_min_new_items_threshold(mut self, threshold: usize) -> Self {
        self.min_new_items_threshold = threshold;
        self
    }

    pub fn with_require_price_changes(mut self, require: bool) -> Self {
        self.require_price_changes = require;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        ratio_in_range("BASKET_RECONCILE_MAX_REMOVAL_RATIO", self.max_removal_ratio)?;
        ratio_in_range("price_change_ratio", self.price_change_ratio)?;
        ratio_in_range("removal_rebuild_ratio", self.removal_rebuild_ratio)?;
        Ok(())
    }
}

// ============================================================================
// RATE LIMITING
// ============================================================================

/// Per-source request ceilings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Requests per second for sources without an override.
    pub default_rps: u32,
    pub per_source: HashMap<String, u32>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            default_rps: DEFAULT_SOURCE_RPS,
            per_source: HashMap::new(),
        }
    }
}

impl RateLimitConfig {
    /// Environment variables:
    /// - `BASKET_DEFAULT_RPS`: requests per second per source (default: 2)
    /// - `BASKET_RATE_LIMITS`: overrides, e.g. `amazon.sa=2,noon.com=1`
    ///
    /// Malformed override entries are skipped.
    pub fn from_env() -> Self {
        let default_rps = env_parse("BASKET_DEFAULT_RPS").unwrap_or(DEFAULT_SOURCE_RPS);
        let per_source = std::env::var("BASKET_RATE_LIMITS")
            .ok()
            .map(|s| parse_rate_limits(&s))
            .unwrap_or_default();

        Self {
            default_rps,
            per_source,
        }
    }

    pub fn with_source_limit(mut self, source: impl Into<String>, rps: u32) -> Self {
        self.per_source.insert(source.into(), rps);
        self
    }

    pub fn with_default_rps(mut self, rps: u32) -> Self {
        self.default_rps = rps;
        self
    }

    pub fn limit_for(&self, source: &str) -> u32 {
        self.per_source
            .get(source)
            .copied()
            .unwrap_or(self.default_rps)
    }

    /// Minimum spacing between two requests to `source`: `1000 / limit` ms.
    pub fn min_delay_for(&self, source: &str) -> Duration {
        let limit = self.limit_for(source).max(1);
        Duration::from_micros(1_000_000 / u64::from(limit))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_rps == 0 {
            return Err(ConfigError::InvalidValue {
                field: "BASKET_DEFAULT_RPS".to_string(),
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if let Some((source, _)) = self.per_source.iter().find(|(_, rps)| **rps == 0) {
            return Err(ConfigError::InvalidValue {
                field: "BASKET_RATE_LIMITS".to_string(),
                value: format!("{source}=0"),
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

/// Parse `source=rps` pairs separated by commas.
pub fn parse_rate_limits(raw: &str) -> HashMap<String, u32> {
    raw.split(',')
        .filter_map(|pair| {
            let (source, rps) = pair.split_once('=')?;
            let source = source.trim();
            if source.is_empty() {
                return None;
            }
            Some((source.to_string(), rps.trim().parse().ok()?))
        })
        .collect()
}
