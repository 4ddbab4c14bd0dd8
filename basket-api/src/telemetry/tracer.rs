//! Tracing subscriber setup.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use super::TelemetryError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Telemetry configuration from environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    /// Filter directives used when `RUST_LOG` is unset
    pub default_filter: String,
    pub format: LogFormat,
    /// Service name attached to the startup log line
    pub service_name: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            default_filter: "basket=info,basket_api=info,basket_jobs=info,basket_events=info".to_string(),
            format: LogFormat::Pretty,
            service_name: "basket".to_string(),
        }
    }
}

impl TelemetryConfig {
    /// Environment variables:
    /// - `BASKET_LOG_FORMAT`: `json` or `pretty` (default: pretty)
    /// - `BASKET_LOG_FILTER` (default: `basket=info,...`)
    /// - `BASKET_SERVICE_NAME` (default: basket)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            default_filter: std::env::var("BASKET_LOG_FILTER").unwrap_or(defaults.default_filter),
            format: match std::env::var("BASKET_LOG_FORMAT").as_deref() {
                Ok("json") => LogFormat::Json,
                _ => LogFormat::Pretty,
            },
            service_name: std::env::var("BASKET_SERVICE_NAME").unwrap_or(defaults.service_name),
        }
    }
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over `default_filter` when set. Calling this a second
/// time returns [`TelemetryError::Subscriber`] and leaves the first
/// subscriber in place.
pub fn init_tracing(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.default_filter));

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = match config.format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).try_init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).try_init(),
    };
    result.map_err(|e| TelemetryError::Subscriber(e.to_string()))?;

    tracing::info!(
        service_name = %config.service_name,
        format = ?config.format,
        "Telemetry initialized"
    );
    Ok(())
}
