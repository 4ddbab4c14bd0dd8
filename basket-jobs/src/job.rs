//! Job model.
//!
//! Every job kind carries its own payload type; processors match on
//! [`JobPayload`] exhaustively instead of reading untyped blobs.

use std::fmt;
use std::time::Duration;

use basket_core::constants::{DEFAULT_BACKOFF_BASE_MS, DEFAULT_MAX_ATTEMPTS};
use basket_core::{normalize_name, ConnectionId, SourceName, Timestamp};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// IDENTITY
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Discriminant used for processor registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Fan out a query to every configured source.
    RefreshSearch,
    /// Refresh a query against one source.
    RefreshSource,
}

impl JobKind {
    pub const ALL: [JobKind; 2] = [JobKind::RefreshSearch, JobKind::RefreshSource];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::RefreshSearch => "refresh_search",
            JobKind::RefreshSource => "refresh_source",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// PAYLOADS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshSearchJob {
    pub query: String,
    /// Sources to query. Empty means every configured source.
    #[serde(default)]
    pub sources: Vec<SourceName>,
    /// Connections waiting on this refresh. Empty means broadcast.
    #[serde(default)]
    pub connection_ids: Vec<ConnectionId>,
}

impl RefreshSearchJob {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            sources: Vec::new(),
            connection_ids: Vec::new(),
        }
    }

    pub fn with_sources(mut self, sources: Vec<SourceName>) -> Self {
        self.sources = sources;
        self
    }

    pub fn for_connection(mut self, connection_id: Option<ConnectionId>) -> Self {
        self.connection_ids.extend(connection_id);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshSourceJob {
    pub query: String,
    pub source: SourceName,
    #[serde(default)]
    pub connection_ids: Vec<ConnectionId>,
}

impl RefreshSourceJob {
    pub fn new(query: impl Into<String>, source: impl Into<SourceName>) -> Self {
        Self {
            query: query.into(),
            source: source.into(),
            connection_ids: Vec::new(),
        }
    }

    pub fn for_connection(mut self, connection_id: Option<ConnectionId>) -> Self {
        self.connection_ids.extend(connection_id);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum JobPayload {
    RefreshSearch(RefreshSearchJob),
    RefreshSource(RefreshSourceJob),
}

impl JobPayload {
    pub fn kind(&self) -> JobKind {
        match self {
            JobPayload::RefreshSearch(_) => JobKind::RefreshSearch,
            JobPayload::RefreshSource(_) => JobKind::RefreshSource,
        }
    }

    /// Source the orchestrator must rate limit before running the job.
    /// Fan-out jobs limit each source themselves.
    pub fn source(&self) -> Option<&str> {
        match self {
            JobPayload::RefreshSearch(_) => None,
            JobPayload::RefreshSource(job) => Some(job.source.as_str()),
        }
    }

    pub fn query(&self) -> &str {
        match self {
            JobPayload::RefreshSearch(job) => &job.query,
            JobPayload::RefreshSource(job) => &job.query,
        }
    }

    /// Jobs sharing this key do the same work; at most one is in flight.
    pub fn dedupe_key(&self) -> String {
        match self {
            JobPayload::RefreshSearch(job) => {
                let mut sources = job.sources.clone();
                sources.sort();
                format!(
                    "{}:{}:{}",
                    JobKind::RefreshSearch,
                    normalize_name(&job.query),
                    sources.join(",")
                )
            }
            JobPayload::RefreshSource(job) => format!(
                "{}:{}:{}",
                JobKind::RefreshSource,
                normalize_name(&job.query),
                job.source
            ),
        }
    }

    pub fn connection_ids(&self) -> &[ConnectionId] {
        match self {
            JobPayload::RefreshSearch(job) => &job.connection_ids,
            JobPayload::RefreshSource(job) => &job.connection_ids,
        }
    }

    /// Add connections waiting on `other` to this job's audience. An empty
    /// audience means broadcast, which covers everyone.
    pub(crate) fn absorb_connections(&mut self, other: &JobPayload) {
        let incoming = other.connection_ids();
        let ids = match self {
            JobPayload::RefreshSearch(job) => &mut job.connection_ids,
            JobPayload::RefreshSource(job) => &mut job.connection_ids,
        };
        if ids.is_empty() {
            return;
        }
        if incoming.is_empty() {
            ids.clear();
            return;
        }
        for id in incoming {
            if !ids.contains(id) {
                ids.push(id.clone());
            }
        }
    }
}

// ============================================================================
// SCHEDULING
// ============================================================================

/// Exponential backoff: `base * 2^attempts_made`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backoff {
    pub base_delay_ms: u64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base_delay_ms: DEFAULT_BACKOFF_BASE_MS,
        }
    }
}

impl Backoff {
    pub fn exponential(base_delay_ms: u64) -> Self {
        Self { base_delay_ms }
    }

    /// Delay before the next attempt, given the failures recorded before
    /// the one that just happened.
    pub fn delay_for(&self, attempts_made: u32) -> Duration {
        let factor = 1u64.checked_shl(attempts_made.min(32)).unwrap_or(u64::MAX);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor))
    }
}

/// Per-enqueue overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnqueueOptions {
    /// Higher runs first. Ties run in enqueue order.
    pub priority: i32,
    pub delay: Duration,
    pub max_attempts: Option<u32>,
    pub backoff: Option<Backoff>,
}

impl EnqueueOptions {
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = Some(backoff);
        self
    }
}

// ============================================================================
// JOB
// ============================================================================

/// `Queued -> Active -> {Completed | Retrying -> Active | Failed}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Active,
    /// Failed, waiting out its backoff before the next attempt.
    Retrying,
    Completed,
    /// Out of attempts or failed permanently; retained for inspection.
    Failed,
}

impl JobState {
    pub fn is_finished(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    pub payload: JobPayload,
    pub priority: i32,
    pub state: JobState,
    /// Failed attempts so far.
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub backoff: Backoff,
    pub last_error: Option<String>,
    pub created_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub finished_at: Option<Timestamp>,
    #[serde(skip)]
    pub(crate) seq: u64,
}

impl Job {
    pub(crate) fn new(payload: JobPayload, options: &EnqueueOptions, now: Timestamp) -> Self {
        Self {
            id: JobId::new(),
            kind: payload.kind(),
            payload,
            priority: options.priority,
            state: JobState::Queued,
            attempts_made: 0,
            max_attempts: options.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS).max(1),
            backoff: options.backoff.unwrap_or_default(),
            last_error: None,
            created_at: now,
            started_at: None,
            finished_at: None,
            seq: 0,
        }
    }
}

/// What a processor learns about the job it is running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobContext {
    pub job_id: JobId,
    pub kind: JobKind,
    /// 1-based number of this attempt.
    pub attempt: u32,
    pub max_attempts: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_from_base() {
        let backoff = Backoff::default();
        assert_eq!(backoff.delay_for(0), Duration::from_millis(2000));
        assert_eq!(backoff.delay_for(1), Duration::from_millis(4000));
        assert_eq!(backoff.delay_for(2), Duration::from_millis(8000));
    }

    #[test]
    fn test_backoff_saturates() {
        let backoff = Backoff::exponential(u64::MAX / 2);
        assert_eq!(backoff.delay_for(40), Duration::from_millis(u64::MAX));
    }

    #[test]
    fn test_dedupe_key_ignores_source_order_and_query_case() {
        let a = JobPayload::RefreshSearch(
            RefreshSearchJob::new("iPhone 15").with_sources(vec!["b".into(), "a".into()]),
        );
        let b = JobPayload::RefreshSearch(
            RefreshSearchJob::new("iphone  15")
                .with_sources(vec!["a".into(), "b".into()])
                .for_connection(Some("c1".into())),
        );
        assert_eq!(a.dedupe_key(), b.dedupe_key());
        assert_eq!(a.dedupe_key(), "refresh_search:iphone 15:a,b");
    }

    #[test]
    fn test_source_only_for_single_source_jobs() {
        let fan_out = JobPayload::RefreshSearch(RefreshSearchJob::new("tv"));
        let single = JobPayload::RefreshSource(RefreshSourceJob::new("tv", "noon.com"));
        assert_eq!(fan_out.source(), None);
        assert_eq!(single.source(), Some("noon.com"));
        assert_eq!(single.kind(), JobKind::RefreshSource);
    }

    #[test]
    fn test_payload_wire_format() {
        let payload = JobPayload::RefreshSource(RefreshSourceJob::new("tv", "noon.com"));
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["kind"], "refresh_source");
        assert_eq!(json["payload"]["source"], "noon.com");

        let back: JobPayload = serde_json::from_value(json).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn test_absorb_connections_dedupes() {
        let mut existing = JobPayload::RefreshSearch(
            RefreshSearchJob::new("tv").for_connection(Some("c1".into())),
        );
        let incoming = JobPayload::RefreshSearch(
            RefreshSearchJob::new("tv").for_connection(Some("c2".into())),
        );
        existing.absorb_connections(&incoming);
        existing.absorb_connections(&incoming);
        assert_eq!(existing.connection_ids(), &["c1".to_string(), "c2".to_string()]);

        existing.absorb_connections(&JobPayload::RefreshSearch(RefreshSearchJob::new("tv")));
        assert!(existing.connection_ids().is_empty());
    }
}
