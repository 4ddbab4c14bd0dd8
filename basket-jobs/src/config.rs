//! Orchestrator configuration.

use std::time::Duration;

use basket_core::constants::{
    DEFAULT_BACKOFF_BASE_MS, DEFAULT_COMPLETED_RETENTION_COUNT, DEFAULT_COMPLETED_RETENTION_SECS,
    DEFAULT_FAILED_RETENTION_SECS, DEFAULT_JOB_CONCURRENCY, DEFAULT_MAX_ATTEMPTS,
    DEFAULT_SWEEP_INTERVAL_SECS,
};
use basket_core::ConfigError;

use crate::job::Backoff;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// Worker count (default: 3)
    pub concurrency: usize,

    /// Attempts per job unless overridden at enqueue (default: 3)
    pub max_attempts: u32,

    /// Base delay for exponential backoff (default: 2s)
    pub backoff_base: Duration,

    /// Completed jobs older than this are pruned (default: 1 hour)
    pub completed_retention: Duration,

    /// At most this many completed jobs are kept (default: 100)
    pub completed_retention_count: usize,

    /// Failed jobs older than this are pruned (default: 24 hours)
    pub failed_retention: Duration,

    /// How often the retention sweeper runs (default: 60 seconds)
    pub sweep_interval: Duration,

    /// Return the existing job id when an identical job is already waiting
    /// or running (default: true)
    pub dedupe_in_flight: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_JOB_CONCURRENCY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_base: Duration::from_millis(DEFAULT_BACKOFF_BASE_MS),
            completed_retention: Duration::from_secs(DEFAULT_COMPLETED_RETENTION_SECS),
            completed_retention_count: DEFAULT_COMPLETED_RETENTION_COUNT,
            failed_retention: Duration::from_secs(DEFAULT_FAILED_RETENTION_SECS),
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
            dedupe_in_flight: true,
        }
    }
}

impl OrchestratorConfig {
    /// Create OrchestratorConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `BASKET_JOB_CONCURRENCY` (default: 3)
    /// - `BASKET_JOB_MAX_ATTEMPTS` (default: 3)
    /// - `BASKET_JOB_BACKOFF_BASE_MS` (default: 2000)
    /// - `BASKET_JOB_COMPLETED_RETENTION_SECS` (default: 3600)
    /// - `BASKET_JOB_COMPLETED_RETENTION_COUNT` (default: 100)
    /// - `BASKET_JOB_FAILED_RETENTION_SECS` (default: 86400)
    /// - `BASKET_JOB_SWEEP_INTERVAL_SECS` (default: 60)
    /// - `BASKET_JOB_DEDUPE_IN_FLIGHT` (default: true)
    pub fn from_env() -> Self {
        let concurrency = std::env::var("BASKET_JOB_CONCURRENCY")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_JOB_CONCURRENCY);

        let max_attempts = std::env::var("BASKET_JOB_MAX_ATTEMPTS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_MAX_ATTEMPTS);

        let backoff_base = Duration::from_millis(
            std::env::var("BASKET_JOB_BACKOFF_BASE_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_BACKOFF_BASE_MS),
        );

        let completed_retention = Duration::from_secs(
            std::env::var("BASKET_JOB_COMPLETED_RETENTION_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_COMPLETED_RETENTION_SECS),
        );

        let completed_retention_count = std::env::var("BASKET_JOB_COMPLETED_RETENTION_COUNT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_COMPLETED_RETENTION_COUNT);

        let failed_retention = Duration::from_secs(
            std::env::var("BASKET_JOB_FAILED_RETENTION_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_FAILED_RETENTION_SECS),
        );

        let sweep_interval = Duration::from_secs(
            std::env::var("BASKET_JOB_SWEEP_INTERVAL_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_SWEEP_INTERVAL_SECS),
        );

        let dedupe_in_flight = std::env::var("BASKET_JOB_DEDUPE_IN_FLIGHT")
            .ok()
            .map(|s| s.to_lowercase() != "false")
            .unwrap_or(true);

        Self {
            concurrency,
            max_attempts,
            backoff_base,
            completed_retention,
            completed_retention_count,
            failed_retention,
            sweep_interval,
            dedupe_in_flight,
        }
    }

    /// Short intervals for local runs.
    pub fn development() -> Self {
        Self {
            concurrency: 2,
            backoff_base: Duration::from_millis(200),
            completed_retention: Duration::from_secs(300),
            completed_retention_count: 20,
            failed_retention: Duration::from_secs(900),
            sweep_interval: Duration::from_secs(10),
            ..Self::default()
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    pub fn with_dedupe_in_flight(mut self, dedupe: bool) -> Self {
        self.dedupe_in_flight = dedupe;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::exponential(u64::try_from(self.backoff_base.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                field: "BASKET_JOB_CONCURRENCY".to_string(),
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "BASKET_JOB_MAX_ATTEMPTS".to_string(),
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.sweep_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "BASKET_JOB_SWEEP_INTERVAL_SECS".to_string(),
                value: "0".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.concurrency, 3);
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.backoff().delay_for(0), Duration::from_millis(2000));
        assert_eq!(config.completed_retention, Duration::from_secs(3600));
        assert_eq!(config.completed_retention_count, 100);
        assert_eq!(config.failed_retention, Duration::from_secs(86_400));
        assert!(config.dedupe_in_flight);
    }

    #[test]
    fn test_validate_rejects_zero_concurrency_and_attempts() {
        assert!(OrchestratorConfig::default().validate().is_ok());
        assert!(OrchestratorConfig::default().with_concurrency(0).validate().is_err());
        assert!(OrchestratorConfig::default().with_max_attempts(0).validate().is_err());
    }

    #[test]
    fn test_development_preset_is_valid() {
        assert!(OrchestratorConfig::development().validate().is_ok());
    }
}
