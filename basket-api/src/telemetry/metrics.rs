//! Prometheus Metrics Definitions
//!
//! All BASKET metrics live in the default registry. [`render_metrics`]
//! returns the text exposition format for whatever serves `/metrics`.

use std::time::Duration;

use basket_jobs::{JobKind, JobListener};
use once_cell::sync::Lazy;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge, Encoder, HistogramVec,
    IntCounterVec, IntGauge, TextEncoder,
};

use super::TelemetryError;

/// Job run time buckets (seconds)
const JOB_DURATION_BUCKETS: &[f64] = &[0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0];

/// Global metrics instance, registered on first use.
pub static METRICS: Lazy<Result<BasketMetrics, TelemetryError>> = Lazy::new(BasketMetrics::new);

#[derive(Clone)]
pub struct BasketMetrics {
    /// Job outcomes - labels: kind, outcome (completed/retried/failed)
    pub jobs_total: IntCounterVec,

    /// Successful job run time - labels: kind
    pub job_duration_seconds: HistogramVec,

    /// Search cache reads - labels: result (hit/stale/miss)
    pub cache_lookups_total: IntCounterVec,

    /// Per-source scrape calls - labels: source, status (ok/error)
    pub source_fetches_total: IntCounterVec,

    /// Push notifications - labels: outcome (delivered/dropped/broadcast)
    pub notifications_total: IntCounterVec,

    /// Currently registered connections
    pub active_connections: IntGauge,
}

fn registration(name: &str) -> impl FnOnce(prometheus::Error) -> TelemetryError + '_ {
    move |e| TelemetryError::Registration {
        name: name.to_string(),
        reason: e.to_string(),
    }
}

impl BasketMetrics {
    pub fn new() -> Result<Self, TelemetryError> {
        Ok(Self {
            jobs_total: register_int_counter_vec!(
                "basket_jobs_total",
                "Background job outcomes",
                &["kind", "outcome"]
            )
            .map_err(registration("basket_jobs_total"))?,

            job_duration_seconds: register_histogram_vec!(
                "basket_job_duration_seconds",
                "Run time of successful background jobs in seconds",
                &["kind"],
                JOB_DURATION_BUCKETS.to_vec()
            )
            .map_err(registration("basket_job_duration_seconds"))?,

            cache_lookups_total: register_int_counter_vec!(
                "basket_cache_lookups_total",
                "Search cache reads by result",
                &["result"]
            )
            .map_err(registration("basket_cache_lookups_total"))?,

            source_fetches_total: register_int_counter_vec!(
                "basket_source_fetches_total",
                "Scrape calls per source",
                &["source", "status"]
            )
            .map_err(registration("basket_source_fetches_total"))?,

            notifications_total: register_int_counter_vec!(
                "basket_notifications_total",
                "Push notifications by outcome",
                &["outcome"]
            )
            .map_err(registration("basket_notifications_total"))?,

            active_connections: register_int_gauge!(
                "basket_active_connections",
                "Currently registered push connections"
            )
            .map_err(registration("basket_active_connections"))?,
        })
    }

    pub fn record_cache_lookup(&self, result: &str) {
        self.cache_lookups_total.with_label_values(&[result]).inc();
    }

    pub fn record_source_fetch(&self, source: &str, success: bool) {
        let status = if success { "ok" } else { "error" };
        self.source_fetches_total
            .with_label_values(&[source, status])
            .inc();
    }

    pub fn record_notification(&self, outcome: &str, count: u64) {
        self.notifications_total
            .with_label_values(&[outcome])
            .inc_by(count);
    }

    pub fn set_active_connections(&self, count: usize) {
        self.active_connections
            .set(i64::try_from(count).unwrap_or(i64::MAX));
    }
}

/// Run `f` against the global metrics if they registered.
pub fn with_metrics(f: impl FnOnce(&BasketMetrics)) {
    if let Ok(metrics) = METRICS.as_ref() {
        f(metrics);
    }
}

/// Feeds orchestrator lifecycle events into Prometheus.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrometheusJobListener;

impl JobListener for PrometheusJobListener {
    fn on_completed(&self, kind: JobKind, elapsed: Duration) {
        with_metrics(|m| {
            m.jobs_total
                .with_label_values(&[kind.as_str(), "completed"])
                .inc();
            m.job_duration_seconds
                .with_label_values(&[kind.as_str()])
                .observe(elapsed.as_secs_f64());
        });
    }

    fn on_retry(&self, kind: JobKind, _attempts_made: u32, _delay: Duration) {
        with_metrics(|m| {
            m.jobs_total
                .with_label_values(&[kind.as_str(), "retried"])
                .inc();
        });
    }

    fn on_failed(&self, kind: JobKind, _attempts_made: u32) {
        with_metrics(|m| {
            m.jobs_total
                .with_label_values(&[kind.as_str(), "failed"])
                .inc();
        });
    }
}

/// Encode every registered metric in the Prometheus text format.
pub fn render_metrics() -> Result<String, TelemetryError> {
    // Make sure BASKET metrics are registered before gathering.
    if let Err(e) = METRICS.as_ref() {
        return Err(e.clone());
    }

    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&prometheus::gather(), &mut buffer)
        .map_err(|e| TelemetryError::Encode(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| TelemetryError::Encode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() -> Result<(), String> {
        METRICS.as_ref().map_err(|e| e.to_string())?;
        Ok(())
    }

    #[test]
    fn test_job_listener_records_outcomes() -> Result<(), String> {
        let metrics = METRICS.as_ref().map_err(|e| e.to_string())?;
        let before = metrics
            .jobs_total
            .with_label_values(&["refresh_search", "failed"])
            .get();

        PrometheusJobListener.on_failed(JobKind::RefreshSearch, 3);
        PrometheusJobListener.on_completed(JobKind::RefreshSearch, Duration::from_millis(120));

        let after = metrics
            .jobs_total
            .with_label_values(&["refresh_search", "failed"])
            .get();
        assert_eq!(after, before + 1);
        Ok(())
    }

    #[test]
    fn test_render_contains_basket_metrics() -> Result<(), String> {
        with_metrics(|m| {
            m.record_cache_lookup("hit");
            m.record_source_fetch("noon.com", true);
            m.record_notification("delivered", 1);
            m.set_active_connections(2);
        });
        let text = render_metrics().map_err(|e| e.to_string())?;
        assert!(text.contains("basket_cache_lookups_total"));
        assert!(text.contains("basket_active_connections"));
        Ok(())
    }
}
