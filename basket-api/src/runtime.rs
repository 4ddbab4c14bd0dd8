//! Process wiring.
//!
//! [`BasketRuntime`] owns one instance of every component, registers the
//! refresh processors, and starts the worker pool. Routing code keeps a
//! handle to it and calls [`BasketRuntime::search`] and
//! [`BasketRuntime::bus`].

use std::sync::Arc;

use basket_core::{system_clock, BasketResult, ConnectionId, SharedClock};
use basket_events::NotificationBus;
use basket_jobs::{JobKind, JobOrchestrator, RateLimiter};
use basket_storage::{open_backend, CacheBackend, FreshnessCache};

use crate::collaborators::Collaborators;
use crate::config::BasketConfig;
use crate::refresh::{RefreshSearchProcessor, RefreshSourceProcessor, Refresher};
use crate::search::{SearchResponse, SearchService};
use crate::telemetry::metrics::with_metrics;
use crate::telemetry::{render_metrics, PrometheusJobListener, TelemetryError};

pub struct BasketRuntime {
    config: BasketConfig,
    cache: Arc<FreshnessCache>,
    bus: NotificationBus,
    orchestrator: Arc<JobOrchestrator>,
    refresher: Arc<Refresher>,
    search: SearchService,
}

impl std::fmt::Debug for BasketRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BasketRuntime")
            .field("orchestrator", &self.orchestrator)
            .field("bus", &self.bus)
            .finish_non_exhaustive()
    }
}

impl BasketRuntime {
    /// Build and start with the configured cache backend and the system clock.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: BasketConfig, collaborators: Collaborators) -> BasketResult<Self> {
        let backend = open_backend(&config.cache)?;
        Self::start_with(config, collaborators, backend, system_clock())
    }

    /// Build and start on an explicit backend and clock.
    pub fn start_with(
        config: BasketConfig,
        collaborators: Collaborators,
        backend: Arc<dyn CacheBackend>,
        clock: SharedClock,
    ) -> BasketResult<Self> {
        config.validate()?;

        let cache = Arc::new(FreshnessCache::new(backend, Arc::clone(&clock)));
        let bus = NotificationBus::new(Arc::clone(&clock));
        let limiter = Arc::new(RateLimiter::new(config.rate_limits.clone()));

        let refresher = Arc::new(Refresher::new(
            Arc::clone(&cache),
            bus.clone(),
            Arc::clone(&limiter),
            collaborators,
            config.reconcile.clone(),
            config.cache.search_ttl_secs,
            Arc::clone(&clock),
        ));

        let orchestrator = Arc::new(
            JobOrchestrator::new(config.jobs.clone(), limiter, Arc::clone(&clock))
                .with_listener(Arc::new(PrometheusJobListener)),
        );
        orchestrator.register_processor(
            JobKind::RefreshSearch,
            Arc::new(RefreshSearchProcessor::new(Arc::clone(&refresher))),
        );
        orchestrator.register_processor(
            JobKind::RefreshSource,
            Arc::new(RefreshSourceProcessor::new(Arc::clone(&refresher))),
        );
        orchestrator.start()?;

        let search = SearchService::new(
            Arc::clone(&cache),
            Arc::clone(&orchestrator),
            Arc::clone(&refresher),
            config.cache.freshness(),
            config.direct_fetch_timeout,
            clock,
        );

        tracing::info!(
            sources = ?refresher.collaborators().source_names(),
            backend = ?config.cache.backend,
            freshness_threshold_minutes = config.cache.freshness_threshold_minutes,
            "BASKET runtime started"
        );

        Ok(Self {
            config,
            cache,
            bus,
            orchestrator,
            refresher,
            search,
        })
    }

    pub async fn search(&self, query: &str, connection_id: Option<ConnectionId>) -> SearchResponse {
        self.search.search(query, connection_id).await
    }

    pub fn config(&self) -> &BasketConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<FreshnessCache> {
        &self.cache
    }

    pub fn bus(&self) -> &NotificationBus {
        &self.bus
    }

    pub fn orchestrator(&self) -> &Arc<JobOrchestrator> {
        &self.orchestrator
    }

    pub fn refresher(&self) -> &Arc<Refresher> {
        &self.refresher
    }

    /// Prometheus text exposition, with point-in-time gauges refreshed.
    pub fn render_metrics(&self) -> Result<String, TelemetryError> {
        with_metrics(|m| m.set_active_connections(self.bus.len()));
        render_metrics()
    }

    /// Stop the workers, wait for running jobs, then close every connection.
    pub async fn shutdown(&self) {
        self.orchestrator.shutdown().await;
        let closed = self.bus.close_all();
        tracing::info!(closed_connections = closed, "BASKET runtime stopped");
    }
}
