//! BASKET Telemetry - Logging and Metrics
//!
//! Structured logging through `tracing` and Prometheus counters for the
//! refresh pipeline. Both work without any external collector.

use thiserror::Error;

pub mod metrics;
pub mod tracer;

pub use metrics::{render_metrics, BasketMetrics, PrometheusJobListener, METRICS};
pub use tracer::{init_tracing, LogFormat, TelemetryConfig};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TelemetryError {
    #[error("Failed to install tracing subscriber: {0}")]
    Subscriber(String),

    #[error("Failed to register metric {name}: {reason}")]
    Registration { name: String, reason: String },

    #[error("Failed to encode metrics: {0}")]
    Encode(String),
}
