//! Background job orchestrator.
//!
//! A fixed pool of workers pulls jobs from an in-process priority queue.
//! Higher priority runs first, ties run in enqueue order. Failed attempts
//! are retried with exponential backoff up to the job's attempt limit, then
//! kept as failed for inspection until retention drops them.
//!
//! Single-source jobs wait on the shared [`RateLimiter`] before their
//! processor is invoked.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, RwLock};

use basket_core::{BasketError, BasketResult, JobError, SharedClock};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::OrchestratorConfig;
use crate::job::{EnqueueOptions, Job, JobContext, JobId, JobKind, JobPayload};
use crate::processor::{JobListener, JobProcessor};
use crate::queue::{FailOutcome, JobQueue};
use crate::rate_limit::RateLimiter;
use crate::retention::{retention_task, sweep, RetentionPolicy};

// ============================================================================
// METRICS
// ============================================================================

/// Lifetime counters for the orchestrator.
#[derive(Debug, Default)]
pub struct OrchestratorMetrics {
    /// Jobs accepted into the queue
    pub enqueued: AtomicU64,

    /// Enqueue calls answered with an existing job id
    pub deduplicated: AtomicU64,

    pub completed: AtomicU64,

    /// Jobs that ran out of attempts or failed permanently
    pub failed: AtomicU64,

    /// Attempts rescheduled after a retryable failure
    pub retried: AtomicU64,

    /// Finished jobs dropped by retention
    pub pruned: AtomicU64,
}

impl OrchestratorMetrics {
    pub fn snapshot(&self) -> OrchestratorSnapshot {
        OrchestratorSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            deduplicated: self.deduplicated.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            pruned: self.pruned.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorSnapshot {
    pub enqueued: u64,
    pub deduplicated: u64,
    pub completed: u64,
    pub failed: u64,
    pub retried: u64,
    pub pruned: u64,
}

/// Current queue occupancy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorStats {
    /// Ready to run
    pub waiting: usize,
    /// Waiting out an enqueue delay or retry backoff
    pub delayed: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub registered_kinds: Vec<JobKind>,
}

// ============================================================================
// ORCHESTRATOR
// ============================================================================

struct Shared {
    config: OrchestratorConfig,
    clock: SharedClock,
    queue: Arc<Mutex<JobQueue>>,
    processors: RwLock<HashMap<JobKind, Arc<dyn JobProcessor>>>,
    limiter: Arc<RateLimiter>,
    listener: OnceLock<Arc<dyn JobListener>>,
    metrics: Arc<OrchestratorMetrics>,
    work_ready: Notify,
    shutting_down: AtomicBool,
}

pub struct JobOrchestrator {
    shared: Arc<Shared>,
    started: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for JobOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobOrchestrator")
            .field("config", &self.shared.config)
            .field("started", &self.started.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl JobOrchestrator {
    pub fn new(config: OrchestratorConfig, limiter: Arc<RateLimiter>, clock: SharedClock) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let queue = if config.dedupe_in_flight {
            JobQueue::exclusive()
        } else {
            JobQueue::default()
        };
        Self {
            shared: Arc::new(Shared {
                config,
                clock,
                queue: Arc::new(Mutex::new(queue)),
                processors: RwLock::new(HashMap::new()),
                limiter,
                listener: OnceLock::new(),
                metrics: Arc::new(OrchestratorMetrics::default()),
                work_ready: Notify::new(),
                shutting_down: AtomicBool::new(false),
            }),
            started: AtomicBool::new(false),
            shutdown_tx,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Attach a lifecycle listener. Only the first one sticks.
    pub fn with_listener(self, listener: Arc<dyn JobListener>) -> Self {
        let _ = self.shared.listener.set(listener);
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.shared.config
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.shared.limiter
    }

    /// Register the processor for `kind`, replacing any earlier one.
    pub fn register_processor(&self, kind: JobKind, processor: Arc<dyn JobProcessor>) {
        let replaced = self
            .shared
            .processors
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(kind, processor)
            .is_some();
        tracing::debug!(kind = %kind, replaced, "Registered job processor");
    }

    /// Queue a job. Returns the existing job's id when an identical job is
    /// still waiting and deduplication is on; the new request's connections
    /// join that job's audience.
    ///
    /// With deduplication on, a duplicate of a running job becomes a single
    /// follow-up that starts only once the running one finishes.
    pub fn enqueue(&self, payload: JobPayload, options: EnqueueOptions) -> Result<JobId, JobError> {
        if self.shared.shutting_down.load(Ordering::Acquire) {
            return Err(JobError::ShuttingDown);
        }

        let config = &self.shared.config;
        let options = EnqueueOptions {
            max_attempts: Some(options.max_attempts.unwrap_or(config.max_attempts)),
            backoff: Some(options.backoff.unwrap_or_else(|| config.backoff())),
            ..options
        };

        let id = {
            let mut queue = self.shared.lock_queue();
            if config.dedupe_in_flight {
                if let Some(existing) = queue.find_waiting(&payload) {
                    queue.merge_into(existing, &payload);
                    self.shared.metrics.deduplicated.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(job_id = %existing, kind = %payload.kind(), "Deduplicated job");
                    return Ok(existing);
                }
            }

            let now = Instant::now();
            let run_at = (!options.delay.is_zero()).then(|| now + options.delay);
            let job = Job::new(payload, &options, self.shared.clock.now());
            tracing::debug!(
                job_id = %job.id,
                kind = %job.kind,
                priority = job.priority,
                delay_ms = options.delay.as_millis() as u64,
                "Enqueued job"
            );
            queue.push(job, run_at, now)
        };

        self.shared.metrics.enqueued.fetch_add(1, Ordering::Relaxed);
        self.shared.work_ready.notify_one();
        Ok(id)
    }

    /// Spawn the worker pool and the retention sweeper.
    ///
    /// Refuses to start unless every [`JobKind`] has a processor.
    pub fn start(&self) -> Result<(), JobError> {
        let missing: Vec<String> = {
            let processors = self
                .shared
                .processors
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            JobKind::ALL
                .iter()
                .filter(|kind| !processors.contains_key(kind))
                .map(|kind| kind.to_string())
                .collect()
        };
        if !missing.is_empty() {
            return Err(JobError::MissingProcessors { kinds: missing });
        }
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(JobError::AlreadyStarted);
        }

        let config = &self.shared.config;
        let mut handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
        for worker_id in 0..config.concurrency {
            let shared = Arc::clone(&self.shared);
            let shutdown_rx = self.shutdown_tx.subscribe();
            handles.push(tokio::spawn(worker_loop(shared, worker_id, shutdown_rx)));
        }
        handles.push(tokio::spawn(retention_task(
            Arc::clone(&self.shared.queue),
            Arc::clone(&self.shared.clock),
            RetentionPolicy::from(config),
            config.sweep_interval,
            Arc::clone(&self.shared.metrics),
            self.shutdown_tx.subscribe(),
        )));

        tracing::info!(
            concurrency = config.concurrency,
            max_attempts = config.max_attempts,
            backoff_base_ms = config.backoff_base.as_millis() as u64,
            "Job orchestrator started"
        );
        Ok(())
    }

    /// Stop accepting jobs, let running attempts finish and wait for every
    /// worker to exit. Jobs still queued are abandoned.
    pub async fn shutdown(&self) {
        self.shared.shutting_down.store(true, Ordering::Release);
        let _ = self.shutdown_tx.send(true);
        self.shared.work_ready.notify_waiters();

        let handles: Vec<_> = self
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Orchestrator task ended abnormally");
            }
        }

        let snapshot = self.shared.metrics.snapshot();
        tracing::info!(
            enqueued = snapshot.enqueued,
            completed = snapshot.completed,
            failed = snapshot.failed,
            retried = snapshot.retried,
            "Job orchestrator stopped"
        );
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::Acquire) && !self.shared.shutting_down.load(Ordering::Acquire)
    }

    pub fn job(&self, id: JobId) -> Option<Job> {
        self.shared.lock_queue().get(id).cloned()
    }

    /// Jobs that exhausted their attempts, oldest first.
    pub fn failed_jobs(&self) -> Vec<Job> {
        self.shared.lock_queue().failed_jobs()
    }

    pub fn stats(&self) -> OrchestratorStats {
        let counts = self.shared.lock_queue().counts();
        let mut registered_kinds: Vec<JobKind> = self
            .shared
            .processors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        registered_kinds.sort_by_key(|kind| kind.as_str());
        OrchestratorStats {
            waiting: counts.queued,
            delayed: counts.delayed,
            active: counts.active,
            completed: counts.completed,
            failed: counts.failed,
            registered_kinds,
        }
    }

    pub fn metrics(&self) -> OrchestratorSnapshot {
        self.shared.metrics.snapshot()
    }

    /// Run one retention pass now. Returns how many jobs were dropped.
    pub fn prune_finished(&self) -> usize {
        let policy = RetentionPolicy::from(&self.shared.config);
        let pruned = sweep(&self.shared.queue, &self.shared.clock, &policy);
        self.shared.metrics.pruned.fetch_add(pruned as u64, Ordering::Relaxed);
        pruned
    }
}

impl Shared {
    fn lock_queue(&self) -> MutexGuard<'_, JobQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn processor(&self, kind: JobKind) -> Option<Arc<dyn JobProcessor>> {
        self.processors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .cloned()
    }

    async fn run(&self, job: Job) {
        let kind = job.kind;
        let started = Instant::now();
        let result = self.attempt(&job).await;

        match result {
            Ok(()) => {
                let cap = self.config.completed_retention_count;
                self.lock_queue().complete(job.id, self.clock.now(), cap);
                self.metrics.completed.fetch_add(1, Ordering::Relaxed);
                let elapsed = started.elapsed();
                tracing::debug!(
                    job_id = %job.id,
                    kind = %kind,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Job completed"
                );
                if let Some(listener) = self.listener.get() {
                    listener.on_completed(kind, elapsed);
                }
            }
            Err(e) => {
                let outcome = self.lock_queue().fail(
                    job.id,
                    e.to_string(),
                    e.is_retryable(),
                    Instant::now(),
                    self.clock.now(),
                );
                match outcome {
                    Some(FailOutcome::Retrying {
                        delay,
                        attempts_made,
                    }) => {
                        self.metrics.retried.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(
                            job_id = %job.id,
                            kind = %kind,
                            attempts_made,
                            retry_in_ms = delay.as_millis() as u64,
                            error = %e,
                            "Job attempt failed, retrying"
                        );
                        if let Some(listener) = self.listener.get() {
                            listener.on_retry(kind, attempts_made, delay);
                        }
                        // Wake an idle worker so it re-arms on the new due time.
                        self.work_ready.notify_one();
                    }
                    Some(FailOutcome::Failed { attempts_made }) => {
                        self.metrics.failed.fetch_add(1, Ordering::Relaxed);
                        tracing::error!(
                            job_id = %job.id,
                            kind = %kind,
                            attempts_made,
                            error = %e,
                            "Job failed"
                        );
                        if let Some(listener) = self.listener.get() {
                            listener.on_failed(kind, attempts_made);
                        }
                    }
                    None => {}
                }
            }
        }
    }

    async fn attempt(&self, job: &Job) -> BasketResult<()> {
        let kind = job.kind;
        let processor = self.processor(kind).ok_or_else(|| JobError::NoProcessor {
            kind: kind.to_string(),
        })?;

        if let Some(source) = job.payload.source() {
            self.limiter.acquire(source).await;
        }

        let ctx = JobContext {
            job_id: job.id,
            kind,
            attempt: job.attempts_made + 1,
            max_attempts: job.max_attempts,
        };
        let payload = job.payload.clone();

        // Run on its own task so a panicking processor cannot take the worker down.
        match tokio::spawn(async move { processor.process(ctx, payload).await }).await {
            Ok(result) => result,
            Err(e) => Err(BasketError::from(JobError::ProcessorPanicked {
                kind: kind.to_string(),
                reason: e.to_string(),
            })),
        }
    }
}

async fn worker_loop(shared: Arc<Shared>, worker_id: usize, mut shutdown_rx: watch::Receiver<bool>) {
    tracing::debug!(worker_id, "Job worker started");

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let claimed = {
            let mut queue = shared.lock_queue();
            match queue.claim(Instant::now(), shared.clock.now()) {
                Some(job) => {
                    if queue.counts().queued > 0 {
                        shared.work_ready.notify_one();
                    }
                    Ok(job)
                }
                None => Err(queue.next_due()),
            }
        };

        match claimed {
            Ok(job) => shared.run(job).await,
            Err(next_due) => {
                let due = async {
                    match next_due {
                        Some(at) => tokio::time::sleep_until(at).await,
                        None => std::future::pending::<()>().await,
                    }
                };
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = shared.work_ready.notified() => {}
                    _ = due => {}
                }
            }
        }
    }

    tracing::debug!(worker_id, "Job worker stopped");
}
