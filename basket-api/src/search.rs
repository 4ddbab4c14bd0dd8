//! Stale-while-revalidate search.
//!
//! - fresh cache entry: served as is
//! - stale cache entry: served as is, a background refresh is queued
//! - no entry: a bounded direct fetch races a timer; whichever way it goes
//!   a background refresh is queued, and the caller gets either the direct
//!   results or an empty "refreshing" response
//!
//! `search` never returns an error. Failures degrade to `source: none` or
//! `source: error` responses.

use std::sync::Arc;
use std::time::Duration;

use basket_core::constants::{COLD_REFRESH_PRIORITY, STALE_REFRESH_PRIORITY};
use basket_core::{CacheSource, ConnectionId, ProductRecord, SharedClock, Timestamp};
use basket_jobs::{EnqueueOptions, JobId, JobOrchestrator, JobPayload, RefreshSearchJob};
use basket_reconcile::sort_by_price;
use basket_storage::{CacheKey, Freshness, FreshnessCache};
use serde::{Deserialize, Serialize};

use crate::collaborators::ValidationCollaborator;
use crate::refresh::Refresher;
use crate::telemetry::metrics::with_metrics;

/// Wire shape of a search answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResponse {
    pub source: CacheSource,
    #[serde(rename = "fetchedAt")]
    pub fetched_at: Option<Timestamp>,
    pub is_stale: bool,
    pub data: Vec<ProductRecord>,
    /// A background refresh for this query is queued or running.
    pub refreshing: bool,
}

impl SearchResponse {
    fn empty(source: CacheSource, refreshing: bool) -> Self {
        Self {
            source,
            fetched_at: None,
            is_stale: false,
            data: Vec::new(),
            refreshing,
        }
    }
}

pub struct SearchService {
    cache: Arc<FreshnessCache>,
    orchestrator: Arc<JobOrchestrator>,
    refresher: Arc<Refresher>,
    freshness: Freshness,
    direct_fetch_timeout: Duration,
    clock: SharedClock,
}

impl std::fmt::Debug for SearchService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchService")
            .field("freshness", &self.freshness)
            .field("direct_fetch_timeout", &self.direct_fetch_timeout)
            .finish_non_exhaustive()
    }
}

impl SearchService {
    pub fn new(
        cache: Arc<FreshnessCache>,
        orchestrator: Arc<JobOrchestrator>,
        refresher: Arc<Refresher>,
        freshness: Freshness,
        direct_fetch_timeout: Duration,
        clock: SharedClock,
    ) -> Self {
        Self {
            cache,
            orchestrator,
            refresher,
            freshness,
            direct_fetch_timeout,
            clock,
        }
    }

    pub async fn search(&self, query: &str, connection_id: Option<ConnectionId>) -> SearchResponse {
        let key = CacheKey::search(query);
        if key.id().is_empty() {
            return SearchResponse::empty(CacheSource::None, false);
        }

        if let Some(lookup) = self
            .cache
            .get_with_metadata::<Vec<ProductRecord>>(&key, self.freshness)
            .await
        {
            if !lookup.is_stale {
                with_metrics(|m| m.record_cache_lookup("hit"));
                return SearchResponse {
                    source: CacheSource::Cache,
                    fetched_at: Some(lookup.fetched_at),
                    is_stale: false,
                    data: lookup.data,
                    refreshing: false,
                };
            }

            with_metrics(|m| m.record_cache_lookup("stale"));
            let refreshing = self
                .enqueue_refresh(query, connection_id, STALE_REFRESH_PRIORITY)
                .is_some();
            return SearchResponse {
                source: CacheSource::Cache,
                fetched_at: Some(lookup.fetched_at),
                is_stale: true,
                data: lookup.data,
                refreshing,
            };
        }

        with_metrics(|m| m.record_cache_lookup("miss"));
        self.cold(query, connection_id).await
    }

    async fn cold(&self, query: &str, connection_id: Option<ConnectionId>) -> SearchResponse {
        let direct = self.direct_fetch(query).await;
        let refreshing = self
            .enqueue_refresh(query, connection_id, COLD_REFRESH_PRIORITY)
            .is_some();

        match direct {
            Some(data) if !data.is_empty() => SearchResponse {
                source: CacheSource::Fresh,
                fetched_at: Some(self.clock.now()),
                is_stale: false,
                data,
                refreshing,
            },
            _ if refreshing => SearchResponse::empty(CacheSource::None, true),
            _ => SearchResponse::empty(CacheSource::Error, false),
        }
    }

    /// Scrape every source on a detached task and wait at most
    /// `direct_fetch_timeout` for it. On timeout the task keeps running and
    /// its result is discarded.
    async fn direct_fetch(&self, query: &str) -> Option<Vec<ProductRecord>> {
        let refresher = Arc::clone(&self.refresher);
        let owned_query = query.to_string();
        let handle = tokio::spawn(async move {
            let scrape = refresher.scrape(&owned_query, &[]).await?;
            let report = refresher.collaborators().validator.validate(scrape.records);
            Ok::<_, basket_core::FetchError>(report.valid)
        });

        match tokio::time::timeout(self.direct_fetch_timeout, handle).await {
            Ok(Ok(Ok(mut records))) => {
                sort_by_price(&mut records);
                Some(records)
            }
            Ok(Ok(Err(e))) => {
                tracing::warn!(query = %query, error = %e, "Direct fetch failed");
                None
            }
            Ok(Err(e)) => {
                tracing::warn!(query = %query, error = %e, "Direct fetch task aborted");
                None
            }
            Err(_) => {
                tracing::info!(
                    query = %query,
                    timeout_ms = self.direct_fetch_timeout.as_millis() as u64,
                    "Direct fetch timed out, answering without data"
                );
                None
            }
        }
    }

    fn enqueue_refresh(
        &self,
        query: &str,
        connection_id: Option<ConnectionId>,
        priority: i32,
    ) -> Option<JobId> {
        let payload = JobPayload::RefreshSearch(RefreshSearchJob::new(query).for_connection(connection_id));
        match self
            .orchestrator
            .enqueue(payload, EnqueueOptions::default().with_priority(priority))
        {
            Ok(id) => Some(id),
            Err(e) => {
                tracing::warn!(query = %query, error = %e, "Could not queue refresh");
                None
            }
        }
    }
}
