//! Retention of finished jobs.
//!
//! The completed count cap is enforced as jobs complete. Age limits for
//! completed and failed jobs are enforced by a periodic sweep that runs
//! until the orchestrator shuts down.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use basket_core::SharedClock;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

use crate::config::OrchestratorConfig;
use crate::orchestrator::OrchestratorMetrics;
use crate::queue::JobQueue;

/// How long finished jobs stay inspectable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub completed_max_age: Duration,
    pub completed_max_count: usize,
    pub failed_max_age: Duration,
}

impl From<&OrchestratorConfig> for RetentionPolicy {
    fn from(config: &OrchestratorConfig) -> Self {
        Self {
            completed_max_age: config.completed_retention,
            completed_max_count: config.completed_retention_count,
            failed_max_age: config.failed_retention,
        }
    }
}

/// Prune once. Returns how many jobs were dropped.
pub(crate) fn sweep(queue: &Mutex<JobQueue>, clock: &SharedClock, policy: &RetentionPolicy) -> usize {
    let now = clock.now();
    queue
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .prune(now, policy.completed_max_age, policy.failed_max_age)
}

/// Background task that periodically prunes expired finished jobs.
pub(crate) async fn retention_task(
    queue: Arc<Mutex<JobQueue>>,
    clock: SharedClock,
    policy: RetentionPolicy,
    every: Duration,
    metrics: Arc<OrchestratorMetrics>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(
        sweep_interval_secs = every.as_secs(),
        completed_retention_secs = policy.completed_max_age.as_secs(),
        failed_retention_secs = policy.failed_max_age.as_secs(),
        "Job retention sweeper started"
    );

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }

            _ = ticker.tick() => {
                let pruned = sweep(&queue, &clock, &policy);
                if pruned > 0 {
                    metrics.pruned.fetch_add(pruned as u64, Ordering::Relaxed);
                    tracing::debug!(pruned, "Pruned finished jobs");
                }
            }
        }
    }

    tracing::info!(
        pruned = metrics.pruned.load(Ordering::Relaxed),
        "Job retention sweeper stopped"
    );
}
