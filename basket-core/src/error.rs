//! Error types for BASKET operations

use thiserror::Error;

/// Failures talking to an external product source.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("Source {source_name} failed: {reason}")]
    SourceFailed { source_name: String, reason: String },

    #[error("Source {source_name} timed out after {after_ms}ms")]
    Timeout { source_name: String, after_ms: u64 },

    #[error("No scraper configured for source {source_name}")]
    SourceNotConfigured { source_name: String },

    #[error("All {attempted} sources failed for query '{query}'")]
    AllSourcesFailed { query: String, attempted: usize },
}

/// Record validation errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    RequiredFieldMissing { field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("No valid records after validation ({rejected} rejected)")]
    NoValidRecords { rejected: usize },
}

/// Freshness cache errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Cache read failed for {key}: {reason}")]
    ReadFailed { key: String, reason: String },

    #[error("Cache write failed for {key}: {reason}")]
    WriteFailed { key: String, reason: String },

    #[error("Cache payload serialization failed: {reason}")]
    Serialization { reason: String },

    #[error("Cache backend unavailable: {reason}")]
    BackendUnavailable { reason: String },
}

/// Persistence collaborator errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Upsert of {count} records failed: {reason}")]
    UpsertFailed { count: usize, reason: String },
}

/// Notification delivery errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("Connection not found: {connection_id}")]
    ConnectionNotFound { connection_id: String },

    #[error("Write to connection {connection_id} failed: {reason}")]
    WriteFailed {
        connection_id: String,
        reason: String,
    },

    #[error("Connection {connection_id} closed")]
    ConnectionClosed { connection_id: String },
}

/// Job orchestration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum JobError {
    #[error("No processor registered for job type {kind}")]
    NoProcessor { kind: String },

    #[error("Processors missing for job types: {kinds:?}")]
    MissingProcessors { kinds: Vec<String> },

    #[error("Job payload does not match processor for {kind}")]
    InvalidPayload { kind: String },

    #[error("Processor for {kind} panicked: {reason}")]
    ProcessorPanicked { kind: String, reason: String },

    #[error("Orchestrator already started")]
    AlreadyStarted,

    #[error("Orchestrator is shutting down")]
    ShuttingDown,
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} ({reason})")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Master error type for all BASKET errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BasketError {
    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl BasketError {
    /// Whether a job failing with this error should be attempted again.
    ///
    /// Transport and storage failures are transient. A scrape whose every
    /// record failed validation is retried since the source may recover;
    /// individual invalid records never are.
    pub fn is_retryable(&self) -> bool {
        match self {
            BasketError::Fetch(FetchError::SourceNotConfigured { .. }) => false,
            BasketError::Fetch(_) => true,
            BasketError::Validation(ValidationError::NoValidRecords { .. }) => true,
            BasketError::Validation(_) => false,
            BasketError::Cache(CacheError::Serialization { .. }) => false,
            BasketError::Cache(_) => true,
            BasketError::Storage(_) => true,
            BasketError::Delivery(_) => false,
            BasketError::Job(JobError::ProcessorPanicked { .. }) => true,
            BasketError::Job(_) => false,
            BasketError::Config(_) => false,
        }
    }
}

/// Result type alias for BASKET operations.
pub type BasketResult<T> = Result<T, BasketError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_error_display_timeout() {
        let err = FetchError::Timeout {
            source_name: "amazon.sa".to_string(),
            after_ms: 5000,
        };
        assert_eq!(err.to_string(), "Source amazon.sa timed out after 5000ms");
    }

    #[test]
    fn test_cache_error_display_write_failed() {
        let err = CacheError::WriteFailed {
            key: "search:iphone".to_string(),
            reason: "disk full".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("search:iphone"));
        assert!(msg.contains("disk full"));
    }

    #[test]
    fn test_config_error_display_invalid_value() {
        let err = ConfigError::InvalidValue {
            field: "BASKET_JOB_CONCURRENCY".to_string(),
            value: "0".to_string(),
            reason: "must be at least 1".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid value for BASKET_JOB_CONCURRENCY: 0 (must be at least 1)"
        );
    }

    #[test]
    fn test_basket_error_from_variants() {
        let fetch = BasketError::from(FetchError::SourceFailed {
            source_name: "noon.com".to_string(),
            reason: "503".to_string(),
        });
        assert!(matches!(fetch, BasketError::Fetch(_)));

        let cache = BasketError::from(CacheError::BackendUnavailable {
            reason: "closed".to_string(),
        });
        assert!(matches!(cache, BasketError::Cache(_)));

        let job = BasketError::from(JobError::ShuttingDown);
        assert!(matches!(job, BasketError::Job(_)));

        let delivery = BasketError::from(DeliveryError::ConnectionNotFound {
            connection_id: "c1".to_string(),
        });
        assert!(matches!(delivery, BasketError::Delivery(_)));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(BasketError::from(FetchError::Timeout {
            source_name: "a".to_string(),
            after_ms: 1,
        })
        .is_retryable());
        assert!(BasketError::from(ValidationError::NoValidRecords { rejected: 3 }).is_retryable());
        assert!(BasketError::from(StorageError::UpsertFailed {
            count: 1,
            reason: "x".to_string(),
        })
        .is_retryable());

        assert!(!BasketError::from(ValidationError::RequiredFieldMissing {
            field: "name".to_string(),
        })
        .is_retryable());
        assert!(!BasketError::from(JobError::InvalidPayload {
            kind: "refresh_search".to_string(),
        })
        .is_retryable());
        assert!(!BasketError::from(FetchError::SourceNotConfigured {
            source_name: "a".to_string(),
        })
        .is_retryable());
    }
}
