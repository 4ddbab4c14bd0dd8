//! Service Configuration
//!
//! Aggregates the per-component configs. Every value comes from a
//! `BASKET_*` environment variable with a fallback default.

use std::time::Duration;

use basket_core::constants::DEFAULT_DIRECT_FETCH_TIMEOUT_MS;
use basket_core::{ConfigError, RateLimitConfig, ReconcileConfig};
use basket_jobs::OrchestratorConfig;
use basket_storage::CacheConfig;

use crate::telemetry::TelemetryConfig;

#[derive(Debug, Clone, PartialEq)]
pub struct BasketConfig {
    pub cache: CacheConfig,
    pub rate_limits: RateLimitConfig,
    pub jobs: OrchestratorConfig,
    pub reconcile: ReconcileConfig,
    pub telemetry: TelemetryConfig,

    /// How long a cold search waits for a direct fetch (default: 5s)
    pub direct_fetch_timeout: Duration,
}

impl Default for BasketConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            rate_limits: RateLimitConfig::default(),
            jobs: OrchestratorConfig::default(),
            reconcile: ReconcileConfig::default(),
            telemetry: TelemetryConfig::default(),
            direct_fetch_timeout: Duration::from_millis(DEFAULT_DIRECT_FETCH_TIMEOUT_MS),
        }
    }
}

impl BasketConfig {
    /// Load every section from the environment.
    ///
    /// Also reads `BASKET_DIRECT_FETCH_TIMEOUT_MS` (default: 5000).
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            cache: CacheConfig::from_env()?,
            rate_limits: RateLimitConfig::from_env(),
            jobs: OrchestratorConfig::from_env(),
            reconcile: ReconcileConfig::from_env(),
            telemetry: TelemetryConfig::from_env(),
            direct_fetch_timeout: Duration::from_millis(
                std::env::var("BASKET_DIRECT_FETCH_TIMEOUT_MS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(DEFAULT_DIRECT_FETCH_TIMEOUT_MS),
            ),
        })
    }

    /// Short intervals for local runs.
    pub fn development() -> Self {
        Self {
            jobs: OrchestratorConfig::development(),
            direct_fetch_timeout: Duration::from_secs(2),
            ..Self::default()
        }
    }

    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_rate_limits(mut self, rate_limits: RateLimitConfig) -> Self {
        self.rate_limits = rate_limits;
        self
    }

    pub fn with_jobs(mut self, jobs: OrchestratorConfig) -> Self {
        self.jobs = jobs;
        self
    }

    pub fn with_reconcile(mut self, reconcile: ReconcileConfig) -> Self {
        self.reconcile = reconcile;
        self
    }

    pub fn with_direct_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.direct_fetch_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.cache.validate()?;
        self.rate_limits.validate()?;
        self.jobs.validate()?;
        self.reconcile.validate()?;
        if self.direct_fetch_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "BASKET_DIRECT_FETCH_TIMEOUT_MS".to_string(),
                value: "0".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        Ok(())
    }
}
