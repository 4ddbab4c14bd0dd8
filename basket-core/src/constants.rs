//! Constants for BASKET
//!
//! Default values shared by the config structs of every crate.

// ============================================================================
// FRESHNESS CACHE
// ============================================================================

/// Default staleness threshold for search results (2 hours)
pub const DEFAULT_FRESHNESS_THRESHOLD_MINUTES: u64 = 120;

/// Default TTL for cached search results (24 hours)
pub const DEFAULT_SEARCH_TTL_SECS: u64 = 86_400;

/// Default LMDB map size in megabytes
pub const DEFAULT_LMDB_MAX_SIZE_MB: usize = 1024;

// ============================================================================
// RATE LIMITING
// ============================================================================

/// Requests per second allowed against a source with no explicit limit
pub const DEFAULT_SOURCE_RPS: u32 = 2;

// ============================================================================
// JOBS
// ============================================================================

/// Number of concurrent workers
pub const DEFAULT_JOB_CONCURRENCY: usize = 3;

/// Attempts before a job is retained as failed
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Base delay for exponential backoff
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 2000;

/// How long completed jobs stay inspectable (1 hour)
pub const DEFAULT_COMPLETED_RETENTION_SECS: u64 = 3600;

/// Upper bound on retained completed jobs
pub const DEFAULT_COMPLETED_RETENTION_COUNT: usize = 100;

/// How long failed jobs stay inspectable (24 hours)
pub const DEFAULT_FAILED_RETENTION_SECS: u64 = 86_400;

/// Retention sweep interval
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;

/// Priority of refreshes for queries with no cached data
pub const COLD_REFRESH_PRIORITY: i32 = 10;

/// Priority of refreshes for stale cached data
pub const STALE_REFRESH_PRIORITY: i32 = 0;

// ============================================================================
// RECONCILIATION
// ============================================================================

/// Removal share above which a scrape is treated as anomalous
pub const DEFAULT_MAX_REMOVAL_RATIO: f64 = 0.5;

/// New items needed to trigger a rebuild
pub const DEFAULT_MIN_NEW_ITEMS_THRESHOLD: usize = 1;

/// Relative price move that counts as a change (5%)
pub const DEFAULT_PRICE_CHANGE_RATIO: f64 = 0.05;

/// Removal share that triggers a rebuild (10%)
pub const DEFAULT_REMOVAL_REBUILD_RATIO: f64 = 0.10;

// ============================================================================
// SEARCH
// ============================================================================

/// How long a cold search waits on a direct fetch
pub const DEFAULT_DIRECT_FETCH_TIMEOUT_MS: u64 = 5000;
