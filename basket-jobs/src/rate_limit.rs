//! Per-source request spacing.
//!
//! Each source gets a minimum delay of `1000 / limit` ms between requests.
//! A caller reserves its release time atomically under the map entry, then
//! sleeps until that time, so concurrent callers for one source queue up in
//! call order without holding a lock across the sleep.
//!
//! Timing uses `tokio::time::Instant`, which follows a paused test runtime.

use basket_core::RateLimitConfig;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Default)]
pub struct RateLimiter {
    config: RateLimitConfig,
    /// Release time of the most recent caller per source.
    last_request: DashMap<String, Instant>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            last_request: DashMap::new(),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Suspend until a request to `source` is allowed. Never fails.
    pub async fn acquire(&self, source: &str) {
        let wait = self.reserve(source, Instant::now());
        if !wait.is_zero() {
            tracing::debug!(source = %source, wait_ms = wait.as_millis() as u64, "Rate limited");
            tokio::time::sleep(wait).await;
        }
    }

    /// Claim the next slot for `source` at or after `now` and return how
    /// long the caller must wait for it.
    fn reserve(&self, source: &str, now: Instant) -> Duration {
        let min_delay = self.config.min_delay_for(source);
        match self.last_request.entry(source.to_string()) {
            Entry::Occupied(mut slot) => {
                let release_at = (*slot.get() + min_delay).max(now);
                slot.insert(release_at);
                release_at - now
            }
            Entry::Vacant(slot) => {
                slot.insert(now);
                Duration::ZERO
            }
        }
    }

    /// Sources that have been requested at least once.
    pub fn tracked_sources(&self) -> usize {
        self.last_request.len()
    }
}
