//! BASKET Test Utilities
//!
//! Shared test infrastructure for the BASKET workspace:
//! - A settable clock
//! - Scripted collaborators (scrapers, persistence, event sinks, cache backends)
//! - Proptest generators for product catalogs
//! - Fixtures and custom assertions

pub use basket_core::{
    BasketError, BasketResult, CacheError, Clock, FetchError, ProductRecord, SharedClock,
    StorageError, Timestamp,
};

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use basket_api::{PersistenceCollaborator, ScrapeCollaborator};
use basket_events::{EventSink, PushEvent, SinkError};
use basket_storage::{BackendStats, CacheBackend, CacheKey, InMemoryCacheBackend, StoredEntry};

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// CLOCK
// ============================================================================

/// Wall clock that only moves when told to.
#[derive(Debug, Clone)]
pub struct FakeClock {
    now: Arc<Mutex<Timestamp>>,
}

impl FakeClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    /// Clock pinned at [`fixtures::t0`].
    pub fn at_t0() -> Self {
        Self::new(fixtures::t0())
    }

    pub fn set(&self, to: Timestamp) {
        *lock(&self.now) = to;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = lock(&self.now);
        *now += by;
    }

    pub fn advance_minutes(&self, minutes: i64) {
        self.advance(chrono::Duration::minutes(minutes));
    }

    /// Handle to pass where a [`SharedClock`] is expected. Moves with `self`.
    pub fn shared(&self) -> SharedClock {
        Arc::new(self.clone())
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Timestamp {
        *lock(&self.now)
    }
}

// ============================================================================
// MOCK COLLABORATORS
// ============================================================================

type ScrapeResult = Result<Vec<ProductRecord>, FetchError>;

/// Scraper with scripted answers.
///
/// Queued answers (see [`MockScraper::then`]) are consumed first; after
/// that every call gets the standing answer.
#[derive(Debug)]
pub struct MockScraper {
    source: String,
    queued: Mutex<VecDeque<ScrapeResult>>,
    standing: Mutex<ScrapeResult>,
    delay: Option<Duration>,
    calls: AtomicUsize,
    queries: Mutex<Vec<String>>,
}

impl MockScraper {
    /// A source that answers with no records.
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            queued: Mutex::new(VecDeque::new()),
            standing: Mutex::new(Ok(Vec::new())),
            delay: None,
            calls: AtomicUsize::new(0),
            queries: Mutex::new(Vec::new()),
        }
    }

    pub fn returning(self, records: Vec<ProductRecord>) -> Self {
        *lock(&self.standing) = Ok(records);
        self
    }

    pub fn failing(self, reason: impl Into<String>) -> Self {
        let err = self.source_failed(reason.into());
        *lock(&self.standing) = Err(err);
        self
    }

    /// Queue a one-shot answer ahead of the standing one.
    pub fn then(self, result: ScrapeResult) -> Self {
        lock(&self.queued).push_back(result);
        self
    }

    /// Sleep on the tokio clock before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Replace the standing answer on a shared scraper.
    pub fn set_records(&self, records: Vec<ProductRecord>) {
        *lock(&self.standing) = Ok(records);
    }

    pub fn set_failing(&self, reason: impl Into<String>) {
        let err = self.source_failed(reason.into());
        *lock(&self.standing) = Err(err);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn queries(&self) -> Vec<String> {
        lock(&self.queries).clone()
    }

    fn source_failed(&self, reason: String) -> FetchError {
        FetchError::SourceFailed {
            source_name: self.source.clone(),
            reason,
        }
    }
}

#[async_trait]
impl ScrapeCollaborator for MockScraper {
    fn source(&self) -> &str {
        &self.source
    }

    async fn search(&self, query: &str) -> Result<Vec<ProductRecord>, FetchError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.queries).push(query.to_string());

        let queued = lock(&self.queued).pop_front();
        match queued {
            Some(result) => result,
            None => lock(&self.standing).clone(),
        }
    }
}

/// Persistence that keeps every upserted batch.
#[derive(Debug, Default)]
pub struct RecordingPersistence {
    batches: Mutex<Vec<Vec<ProductRecord>>>,
}

impl RecordingPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batches(&self) -> Vec<Vec<ProductRecord>> {
        lock(&self.batches).clone()
    }

    pub fn last_batch(&self) -> Option<Vec<ProductRecord>> {
        lock(&self.batches).last().cloned()
    }

    pub fn upserts(&self) -> usize {
        lock(&self.batches).len()
    }
}

#[async_trait]
impl PersistenceCollaborator for RecordingPersistence {
    async fn upsert(&self, records: &[ProductRecord]) -> Result<(), StorageError> {
        lock(&self.batches).push(records.to_vec());
        Ok(())
    }
}

/// Persistence whose every upsert fails.
#[derive(Debug, Clone)]
pub struct FailingPersistence {
    reason: String,
}

impl FailingPersistence {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl PersistenceCollaborator for FailingPersistence {
    async fn upsert(&self, records: &[ProductRecord]) -> Result<(), StorageError> {
        Err(StorageError::UpsertFailed {
            count: records.len(),
            reason: self.reason.clone(),
        })
    }
}

// ============================================================================
// EVENT SINKS
// ============================================================================

/// Read side of a [`RecordingSink`], kept by the test after the sink moves
/// into the bus.
#[derive(Debug, Clone, Default)]
pub struct SinkLog {
    events: Arc<Mutex<Vec<PushEvent>>>,
    closed: Arc<AtomicBool>,
}

impl SinkLog {
    pub fn events(&self) -> Vec<PushEvent> {
        lock(&self.events).clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.events).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.events).is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Wait on the tokio clock until at least `count` events arrived.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.len() < count {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        true
    }
}

/// Sink that records every event it is given.
#[derive(Debug)]
pub struct RecordingSink {
    log: SinkLog,
}

impl RecordingSink {
    pub fn new() -> (Self, SinkLog) {
        let log = SinkLog::default();
        (Self { log: log.clone() }, log)
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn write(&mut self, event: &PushEvent) -> Result<(), SinkError> {
        if self.log.is_closed() {
            return Err(SinkError::Closed);
        }
        lock(&self.log.events).push(event.clone());
        Ok(())
    }

    async fn close(&mut self) {
        self.log.closed.store(true, Ordering::SeqCst);
    }
}

/// Sink whose writes always fail.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailingSink;

#[async_trait]
impl EventSink for FailingSink {
    async fn write(&mut self, _event: &PushEvent) -> Result<(), SinkError> {
        Err(SinkError::Write("broken pipe".to_string()))
    }
}

// ============================================================================
// CACHE BACKENDS
// ============================================================================

/// In-memory backend whose writes can be made to fail on demand.
#[derive(Debug, Default)]
pub struct FaultyCacheBackend {
    inner: InMemoryCacheBackend,
    fail_writes: AtomicBool,
}

impl FaultyCacheBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_writes() -> Self {
        let backend = Self::default();
        backend.set_fail_writes(true);
        backend
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[async_trait]
impl CacheBackend for FaultyCacheBackend {
    async fn get(&self, key: &CacheKey, now: Timestamp) -> Result<Option<StoredEntry>, CacheError> {
        self.inner.get(key, now).await
    }

    async fn put(&self, key: &CacheKey, entry: StoredEntry) -> Result<(), CacheError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(CacheError::WriteFailed {
                key: key.to_string(),
                reason: "disk full".to_string(),
            });
        }
        self.inner.put(key, entry).await
    }

    async fn delete(&self, key: &CacheKey) -> Result<bool, CacheError> {
        self.inner.delete(key).await
    }

    async fn stats(&self) -> Result<BackendStats, CacheError> {
        self.inner.stats().await
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for product data.

    use super::*;
    use proptest::prelude::*;
    use rust_decimal::Decimal;

    /// Price between 0.01 and 9999.99.
    pub fn arb_price() -> impl Strategy<Value = Decimal> {
        (1i64..1_000_000).prop_map(|cents| Decimal::new(cents, 2))
    }

    /// Timestamp between 2020 and 2030.
    pub fn arb_timestamp() -> impl Strategy<Value = Timestamp> {
        (1577836800i64..1893456000i64).prop_map(|secs| {
            chrono::DateTime::from_timestamp(secs, 0).unwrap_or_else(fixtures::t0)
        })
    }

    /// A record from `site`, priced or not, with a URL identity.
    pub fn arb_record(site: &'static str) -> impl Strategy<Value = ProductRecord> {
        (0u16..1000, prop::option::of(arb_price())).prop_map(move |(n, price)| {
            fixtures::numbered(site, n, price)
        })
    }

    /// Up to `max` records from `site` with pairwise distinct identities.
    pub fn arb_catalog(site: &'static str, max: usize) -> impl Strategy<Value = Vec<ProductRecord>> {
        prop::collection::btree_map(0u16..1000, prop::option::of(arb_price()), 0..=max).prop_map(
            move |entries| {
                entries
                    .into_iter()
                    .map(|(n, price)| fixtures::numbered(site, n, price))
                    .collect()
            },
        )
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built records and configurations.

    use super::*;
    use basket_api::{BasketConfig, Collaborators};
    use basket_core::RateLimitConfig;
    use chrono::TimeZone;
    use rust_decimal::Decimal;

    /// 2025-01-01T00:00:00Z
    pub fn t0() -> Timestamp {
        chrono::Utc
            .with_ymd_and_hms(2025, 1, 1, 0, 0, 0)
            .single()
            .unwrap_or_default()
    }

    /// Priced record with a URL derived from `site` and `name`.
    pub fn record(site: &str, name: &str, price: i64) -> ProductRecord {
        unpriced(site, name).with_price(Decimal::from(price))
    }

    pub fn unpriced(site: &str, name: &str) -> ProductRecord {
        let slug = name.to_lowercase().replace(' ', "-");
        ProductRecord::new(site, name, format!("https://{site}/p/{slug}"), t0()).with_currency("SAR")
    }

    pub fn numbered(site: &str, n: u16, price: Option<Decimal>) -> ProductRecord {
        let record = ProductRecord::new(
            site,
            format!("product {n:04}"),
            format!("https://{site}/p/{n:04}"),
            t0(),
        )
        .with_currency("SAR");
        match price {
            Some(price) => record.with_price(price),
            None => record,
        }
    }

    /// Development config with rate limits loose enough to never wait.
    pub fn test_config() -> BasketConfig {
        BasketConfig::development()
            .with_rate_limits(RateLimitConfig::default().with_default_rps(1000))
    }

    pub fn collaborators(
        scrapers: &[Arc<MockScraper>],
        persistence: Arc<dyn PersistenceCollaborator>,
    ) -> Collaborators {
        let scrapers = scrapers
            .iter()
            .map(|s| Arc::clone(s) as Arc<dyn ScrapeCollaborator>)
            .collect();
        Collaborators::new(scrapers, persistence)
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions for BASKET results and record lists.

    use super::*;

    #[track_caller]
    pub fn assert_ok<T: std::fmt::Debug>(result: &BasketResult<T>) {
        assert!(result.is_ok(), "Expected Ok, got Err: {:?}", result);
    }

    #[track_caller]
    pub fn assert_err<T: std::fmt::Debug>(result: &BasketResult<T>) {
        assert!(result.is_err(), "Expected Err, got Ok: {:?}", result);
    }

    #[track_caller]
    pub fn assert_retryable<T: std::fmt::Debug>(result: &BasketResult<T>) {
        match result {
            Err(e) if e.is_retryable() => {}
            other => panic!("Expected retryable error, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_cache_error<T: std::fmt::Debug>(result: &BasketResult<T>) {
        match result {
            Err(BasketError::Cache(_)) => {}
            other => panic!("Expected Cache error, got: {:?}", other),
        }
    }

    /// Live records first, priced before unpriced, ascending price.
    #[track_caller]
    pub fn assert_sorted_by_price(records: &[ProductRecord]) {
        for pair in records.windows(2) {
            let (a, b) = (&pair[0], &pair[1]);
            let ordered = match (a.removed, b.removed) {
                (false, true) => true,
                (true, false) => false,
                _ => match (a.known_price(), b.known_price()) {
                    (Some(pa), Some(pb)) => pa <= pb,
                    (Some(_), None) | (None, None) => true,
                    (None, Some(_)) => false,
                },
            };
            assert!(ordered, "Out of order: {:?} before {:?}", a.name, b.name);
        }
    }

    #[track_caller]
    pub fn assert_unique_identities(records: &[ProductRecord]) {
        let mut seen = std::collections::HashSet::new();
        for record in records {
            assert!(
                seen.insert(record.identity_key.as_str()),
                "Duplicate identity: {}",
                record.identity_key
            );
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_fake_clock_moves_only_when_told() {
        let clock = FakeClock::at_t0();
        let shared = clock.shared();
        assert_eq!(shared.now(), fixtures::t0());

        clock.advance_minutes(10);
        assert_eq!(shared.now(), fixtures::t0() + chrono::Duration::minutes(10));

        clock.set(fixtures::t0());
        assert_eq!(shared.now(), fixtures::t0());
    }

    #[tokio::test]
    async fn test_mock_scraper_serves_queued_then_standing() {
        let scraper = MockScraper::new("noon.com")
            .returning(vec![fixtures::record("noon.com", "Kettle", 50)])
            .then(Err(FetchError::Timeout {
                source_name: "noon.com".to_string(),
                after_ms: 10,
            }));

        assert!(scraper.search("kettle").await.is_err());
        assert_eq!(scraper.search("kettle").await.map(|r| r.len()), Ok(1));
        assert_eq!(scraper.calls(), 2);
        assert_eq!(scraper.queries(), vec!["kettle", "kettle"]);
    }

    #[tokio::test]
    async fn test_recording_sink_stops_after_close() {
        let (mut sink, log) = RecordingSink::new();
        let event = PushEvent::new("ping", serde_json_value());
        sink.write(&event).await.unwrap();
        sink.close().await;

        assert_eq!(sink.write(&event).await, Err(SinkError::Closed));
        assert_eq!(log.len(), 1);
        assert!(log.is_closed());
    }

    #[tokio::test]
    async fn test_faulty_backend_toggles_writes() {
        let backend = FaultyCacheBackend::failing_writes();
        let key = CacheKey::search("kettle");
        let entry = StoredEntry {
            payload: serde_json_value(),
            source: basket_core::CacheSource::Fresh,
            fetched_at: fixtures::t0(),
            ttl_secs: 0,
        };
        assert!(backend.put(&key, entry.clone()).await.is_err());

        backend.set_fail_writes(false);
        assert!(backend.put(&key, entry).await.is_ok());
        assert_eq!(backend.len(), 1);
    }

    #[test]
    fn test_assert_sorted_by_price_accepts_removed_last() {
        let mut gone = fixtures::record("noon.com", "Gone", 1);
        gone.removed = true;
        let records = vec![
            fixtures::record("noon.com", "Cheap", 5),
            fixtures::record("noon.com", "Dear", 9),
            fixtures::unpriced("noon.com", "Unknown"),
            gone,
        ];
        assertions::assert_sorted_by_price(&records);
    }

    fn serde_json_value() -> serde_json::Value {
        serde_json::json!({})
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_catalog_identities_are_unique(catalog in generators::arb_catalog("noon.com", 30)) {
            assertions::assert_unique_identities(&catalog);
            prop_assert!(catalog.iter().all(|r| r.site == "noon.com"));
        }
    }
}
