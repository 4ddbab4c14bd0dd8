//! Processor and listener seams.

use async_trait::async_trait;
use basket_core::BasketResult;
use std::time::Duration;

use crate::job::{JobContext, JobKind, JobPayload};

/// Runs one kind of job.
///
/// Returning an error fails the attempt. Whether it is retried depends on
/// [`basket_core::BasketError::is_retryable`] and the attempts left. A
/// processor that panics is treated as a retryable failure.
#[async_trait]
pub trait JobProcessor: Send + Sync {
    async fn process(&self, ctx: JobContext, payload: JobPayload) -> BasketResult<()>;
}

/// Observer for job lifecycle transitions, e.g. to feed metrics.
pub trait JobListener: Send + Sync {
    fn on_completed(&self, _kind: JobKind, _elapsed: Duration) {}
    fn on_retry(&self, _kind: JobKind, _attempts_made: u32, _delay: Duration) {}
    fn on_failed(&self, _kind: JobKind, _attempts_made: u32) {}
}
