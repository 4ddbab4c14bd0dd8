//! BASKET Jobs
//!
//! Background refresh machinery:
//!
//! - [`RateLimiter`]: spaces requests to each external source
//! - [`JobOrchestrator`]: prioritized queue, worker pool, retry with
//!   exponential backoff, bounded retention of finished jobs

pub mod config;
pub mod job;
pub mod orchestrator;
pub mod processor;
mod queue;
pub mod rate_limit;
pub mod retention;

pub use config::OrchestratorConfig;
pub use job::{
    Backoff, EnqueueOptions, Job, JobContext, JobId, JobKind, JobPayload, JobState,
    RefreshSearchJob, RefreshSourceJob,
};
pub use orchestrator::{JobOrchestrator, OrchestratorMetrics, OrchestratorSnapshot, OrchestratorStats};
pub use processor::{JobListener, JobProcessor};
pub use rate_limit::RateLimiter;
