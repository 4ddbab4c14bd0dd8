//! Refresh pipeline and the job processors that drive it.
//!
//! One refresh of a query:
//!
//! 1. scrape the selected sources concurrently, each behind the rate
//!    limiter, keeping whatever succeeded
//! 2. drop structurally invalid records
//! 3. merge against the cached records of the sources that answered;
//!    records of sources that failed are carried over untouched
//! 4. persist, then write the cache (a failed cache write fails the job)
//! 5. push `updateSearch` when the result changed materially or the query
//!    had no cached entry before

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use basket_core::{
    BasketResult, CacheSource, ConnectionId, FetchError, JobError, ProductRecord,
    ReconcileConfig, SharedClock, SourceName, ValidationError,
};
use basket_events::{NotificationBus, PushEvent};
use basket_jobs::{JobContext, JobPayload, JobProcessor, RateLimiter};
use basket_reconcile::{reconcile, should_rebuild, sort_by_price, RebuildDecision, ReconcileOutcome};
use basket_storage::{CacheKey, FreshnessCache};
use futures_util::future::join_all;

use crate::collaborators::{Collaborators, ScrapeCollaborator};
use crate::telemetry::metrics::with_metrics;

/// Records gathered from one fan-out.
#[derive(Debug, Clone, Default)]
pub struct Scrape {
    pub records: Vec<ProductRecord>,
    /// Sources that answered, even with zero records.
    pub succeeded: Vec<SourceName>,
    pub failed: Vec<(SourceName, FetchError)>,
}

/// What one refresh did.
#[derive(Debug, Clone)]
pub struct RefreshReport {
    pub query: String,
    pub records: usize,
    pub rejected: usize,
    pub outcome: ReconcileOutcome,
    pub decision: RebuildDecision,
    /// No cache entry existed before this refresh.
    pub first_fill: bool,
    pub notified: bool,
}

/// Shared state for refresh work.
pub struct Refresher {
    cache: Arc<FreshnessCache>,
    bus: NotificationBus,
    limiter: Arc<RateLimiter>,
    collaborators: Collaborators,
    reconcile: ReconcileConfig,
    search_ttl_secs: u64,
    clock: SharedClock,
}

impl std::fmt::Debug for Refresher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Refresher")
            .field("collaborators", &self.collaborators)
            .field("search_ttl_secs", &self.search_ttl_secs)
            .finish_non_exhaustive()
    }
}

impl Refresher {
    pub fn new(
        cache: Arc<FreshnessCache>,
        bus: NotificationBus,
        limiter: Arc<RateLimiter>,
        collaborators: Collaborators,
        reconcile: ReconcileConfig,
        search_ttl_secs: u64,
        clock: SharedClock,
    ) -> Self {
        Self {
            cache,
            bus,
            limiter,
            collaborators,
            reconcile,
            search_ttl_secs,
            clock,
        }
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.collaborators
    }

    /// Query `sources` (every configured source when empty) concurrently.
    ///
    /// Each source waits on the rate limiter first. One source failing
    /// never cancels the others; only when every source failed is the
    /// scrape an error.
    pub async fn scrape(&self, query: &str, sources: &[SourceName]) -> Result<Scrape, FetchError> {
        let scrapers: Vec<&Arc<dyn ScrapeCollaborator>> = if sources.is_empty() {
            self.collaborators.scrapers.iter().collect()
        } else {
            let mut selected = Vec::with_capacity(sources.len());
            for source in sources {
                let scraper = self.collaborators.scraper(source).ok_or_else(|| {
                    FetchError::SourceNotConfigured {
                        source_name: source.clone(),
                    }
                })?;
                selected.push(scraper);
            }
            selected
        };
        if scrapers.is_empty() {
            return Err(FetchError::SourceNotConfigured {
                source_name: "*".to_string(),
            });
        }

        let calls = scrapers.iter().map(|scraper| async move {
            self.limiter.acquire(scraper.source()).await;
            (scraper.source().to_string(), scraper.search(query).await)
        });
        let results = join_all(calls).await;

        let mut scrape = Scrape::default();
        for (source, result) in results {
            with_metrics(|m| m.record_source_fetch(&source, result.is_ok()));
            match result {
                Ok(records) => {
                    tracing::debug!(source = %source, query = %query, count = records.len(), "Source answered");
                    scrape.records.extend(records);
                    scrape.succeeded.push(source);
                }
                Err(e) => {
                    tracing::warn!(source = %source, query = %query, error = %e, "Source failed");
                    scrape.failed.push((source, e));
                }
            }
        }

        if scrape.succeeded.is_empty() {
            return Err(FetchError::AllSourcesFailed {
                query: query.to_string(),
                attempted: scrape.failed.len(),
            });
        }
        Ok(scrape)
    }

    /// Query one source without touching the rate limiter. The caller has
    /// already waited for its slot.
    pub async fn scrape_single(&self, query: &str, source: &str) -> Result<Scrape, FetchError> {
        let scraper = self
            .collaborators
            .scraper(source)
            .ok_or_else(|| FetchError::SourceNotConfigured {
                source_name: source.to_string(),
            })?;
        let result = scraper.search(query).await;
        with_metrics(|m| m.record_source_fetch(source, result.is_ok()));
        let records = result.inspect_err(|e| {
            tracing::warn!(source = %source, query = %query, error = %e, "Source failed");
        })?;
        Ok(Scrape {
            records,
            succeeded: vec![source.to_string()],
            failed: Vec::new(),
        })
    }

    /// Validate, merge, persist, cache and notify.
    pub async fn apply(
        &self,
        query: &str,
        scrape: Scrape,
        connection_ids: &[ConnectionId],
    ) -> BasketResult<RefreshReport> {
        let key = CacheKey::search(query);
        let scraped = scrape.records.len();

        let report = self.collaborators.validator.validate(scrape.records);
        for (record, error) in &report.invalid {
            tracing::debug!(query = %query, name = %record.name, error = %error, "Dropped invalid record");
        }
        let rejected = report.invalid.len();
        if rejected > 0 {
            tracing::warn!(query = %query, rejected, "Dropped invalid records");
        }
        if scraped > 0 && report.valid.is_empty() {
            return Err(ValidationError::NoValidRecords { rejected }.into());
        }
        let fresh = report.valid;

        let previous = self.cache.get::<Vec<ProductRecord>>(&key).await;
        let first_fill = previous.is_none();
        let cached = previous.map(|entry| entry.payload).unwrap_or_default();

        // Only sources that answered take part in the merge.
        let answered: HashSet<&str> = scrape.succeeded.iter().map(String::as_str).collect();
        let (in_scope, carried): (Vec<ProductRecord>, Vec<ProductRecord>) = cached
            .into_iter()
            .partition(|record| answered.contains(record.site.as_str()));

        let now = self.clock.now();
        let decision = should_rebuild(&in_scope, &fresh, &self.reconcile);
        let reconciliation = reconcile(&in_scope, &fresh, &self.reconcile, now);
        if reconciliation.outcome.anomaly {
            tracing::warn!(
                query = %query,
                kept = reconciliation.outcome.kept_by_guard,
                "Removal share above ceiling, keeping unseen records"
            );
        }

        let mut records = reconciliation.records;
        records.extend(carried);
        sort_by_price(&mut records);

        self.collaborators.persistence.upsert(&records).await?;
        self.cache
            .set(&key, &records, self.search_ttl_secs, CacheSource::Fresh)
            .await?;

        let notified = if decision.should_rebuild || first_fill {
            self.notify(query, &records, connection_ids).await;
            true
        } else {
            false
        };

        tracing::info!(
            query = %query,
            records = records.len(),
            new = reconciliation.outcome.new,
            updated = reconciliation.outcome.updated,
            removed = reconciliation.outcome.removed,
            rebuild = decision.should_rebuild,
            reason = %decision.reason,
            notified,
            "Search refreshed"
        );

        Ok(RefreshReport {
            query: query.to_string(),
            records: records.len(),
            rejected,
            outcome: reconciliation.outcome,
            decision,
            first_fill,
            notified,
        })
    }

    /// Best effort: delivery failures are logged, never returned.
    async fn notify(&self, query: &str, records: &[ProductRecord], connection_ids: &[ConnectionId]) {
        let event = match PushEvent::search_updated(query, records.to_vec(), self.clock.now()) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(query = %query, error = %e, "Failed to build search update event");
                return;
            }
        };

        if connection_ids.is_empty() {
            if let Ok(accepted) = self.bus.notify(event, None).await {
                with_metrics(|m| m.record_notification("broadcast", accepted as u64));
            }
            return;
        }

        for id in connection_ids {
            match self.bus.notify(event.clone(), Some(id)).await {
                Ok(_) => with_metrics(|m| m.record_notification("delivered", 1)),
                Err(e) => {
                    with_metrics(|m| m.record_notification("dropped", 1));
                    tracing::warn!(connection_id = %id, query = %query, error = %e, "Search update not delivered");
                }
            }
        }
    }
}

// ============================================================================
// PROCESSORS
// ============================================================================

/// Runs `refresh_search` jobs: fan out to every requested source.
#[derive(Debug, Clone)]
pub struct RefreshSearchProcessor {
    refresher: Arc<Refresher>,
}

impl RefreshSearchProcessor {
    pub fn new(refresher: Arc<Refresher>) -> Self {
        Self { refresher }
    }
}

#[async_trait]
impl JobProcessor for RefreshSearchProcessor {
    async fn process(&self, ctx: JobContext, payload: JobPayload) -> BasketResult<()> {
        let JobPayload::RefreshSearch(job) = payload else {
            return Err(JobError::InvalidPayload {
                kind: ctx.kind.to_string(),
            }
            .into());
        };
        tracing::debug!(job_id = %ctx.job_id, attempt = ctx.attempt, query = %job.query, "Refreshing search");

        let scrape = self.refresher.scrape(&job.query, &job.sources).await?;
        self.refresher
            .apply(&job.query, scrape, &job.connection_ids)
            .await
            .map(|_| ())
    }
}

/// Runs `refresh_source` jobs. The orchestrator has already waited on the
/// rate limiter for the job's source.
#[derive(Debug, Clone)]
pub struct RefreshSourceProcessor {
    refresher: Arc<Refresher>,
}

impl RefreshSourceProcessor {
    pub fn new(refresher: Arc<Refresher>) -> Self {
        Self { refresher }
    }
}

#[async_trait]
impl JobProcessor for RefreshSourceProcessor {
    async fn process(&self, ctx: JobContext, payload: JobPayload) -> BasketResult<()> {
        let JobPayload::RefreshSource(job) = payload else {
            return Err(JobError::InvalidPayload {
                kind: ctx.kind.to_string(),
            }
            .into());
        };
        tracing::debug!(
            job_id = %ctx.job_id,
            attempt = ctx.attempt,
            query = %job.query,
            source = %job.source,
            "Refreshing source"
        );

        let scrape = self.refresher.scrape_single(&job.query, &job.source).await?;
        self.refresher
            .apply(&job.query, scrape, &job.connection_ids)
            .await
            .map(|_| ())
    }
}
