//! Wall-clock source.
//!
//! Staleness checks and record timestamps read the time through [`Clock`] so
//! tests can pin it. Monotonic scheduling (rate limiting, retry delays) uses
//! `tokio::time` directly and is controlled with a paused runtime instead.

use crate::Timestamp;
use chrono::Utc;
use std::sync::Arc;

/// Source of the current wall-clock time.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> Timestamp;
}

/// Clock backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Utc::now()
    }
}

/// Shared clock handle passed between components.
pub type SharedClock = Arc<dyn Clock>;

pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}
