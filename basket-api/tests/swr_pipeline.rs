//! End-to-end behaviour of the search pipeline: cache reads, background
//! refresh, reconciliation against the cached set, and push delivery.

use std::sync::Arc;
use std::time::Duration;

use basket_api::{BasketRuntime, Collaborators};
use basket_core::{BasketError, CacheSource, Clock, FetchError, ProductRecord};
use basket_events::{Transport, SEARCH_UPDATED_EVENT};
use basket_jobs::{EnqueueOptions, JobPayload, JobState, RefreshSearchJob};
use basket_reconcile::RebuildReason;
use basket_storage::{CacheBackend, CacheConfig, CacheKey, Freshness, InMemoryCacheBackend};
use basket_test_utils::assertions::{assert_cache_error, assert_sorted_by_price};
use basket_test_utils::fixtures::{self, record, test_config};
use basket_test_utils::{
    FakeClock, FaultyCacheBackend, MockScraper, RecordingPersistence, RecordingSink,
};
use rust_decimal::Decimal;

const DAY_SECS: u64 = 86_400;

struct Harness {
    runtime: BasketRuntime,
    clock: FakeClock,
    persistence: Arc<RecordingPersistence>,
}

fn harness(scrapers: &[Arc<MockScraper>]) -> Harness {
    harness_on(scrapers, Arc::new(InMemoryCacheBackend::new()))
}

fn harness_on(scrapers: &[Arc<MockScraper>], backend: Arc<dyn CacheBackend>) -> Harness {
    let clock = FakeClock::at_t0();
    let persistence = Arc::new(RecordingPersistence::new());
    let collaborators = fixtures::collaborators(scrapers, persistence.clone());
    let runtime = BasketRuntime::start_with(test_config(), collaborators, backend, clock.shared())
        .expect("runtime starts");
    Harness {
        runtime,
        clock,
        persistence,
    }
}

async fn seed(runtime: &BasketRuntime, query: &str, records: &[ProductRecord]) {
    runtime
        .cache()
        .set(&CacheKey::search(query), &records.to_vec(), DAY_SECS, CacheSource::Fresh)
        .await
        .expect("seed cache");
}

async fn wait_for_finished(runtime: &BasketRuntime, finished: u64) {
    for _ in 0..600 {
        let metrics = runtime.orchestrator().metrics();
        if metrics.completed + metrics.failed >= finished {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("jobs did not finish: {:?}", runtime.orchestrator().metrics());
}

#[tokio::test(start_paused = true)]
async fn test_empty_cache_reads_nothing_and_queues_refresh() {
    let scraper = Arc::new(
        MockScraper::new("noon.com")
            .returning(vec![record("noon.com", "iPhone 15", 3999)])
            .with_delay(Duration::from_secs(10)),
    );
    let h = harness(&[scraper.clone()]);

    let lookup = h
        .runtime
        .cache()
        .get_with_metadata::<Vec<ProductRecord>>(&CacheKey::search("iphone"), Freshness::minutes(120))
        .await;
    assert!(lookup.is_none());

    // Direct fetch outlasts the 2s development timeout.
    let response = h.runtime.search("iphone", None).await;
    assert_eq!(response.source, CacheSource::None);
    assert!(response.refreshing);
    assert!(response.data.is_empty());
    assert_eq!(h.runtime.orchestrator().metrics().enqueued, 1);

    wait_for_finished(&h.runtime, 1).await;
    let cached = h
        .runtime
        .cache()
        .get::<Vec<ProductRecord>>(&CacheKey::search("iphone"))
        .await
        .expect("refresh filled the cache");
    assert_eq!(cached.payload.len(), 1);
    assert_eq!(h.persistence.upserts(), 1);

    h.runtime.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_recent_entry_is_served_without_refresh() {
    let scraper = Arc::new(MockScraper::new("noon.com"));
    let h = harness(&[scraper.clone()]);
    seed(&h.runtime, "iphone", &[record("noon.com", "iPhone 15", 3999)]).await;

    h.clock.advance_minutes(10);
    let response = h.runtime.search("iphone", None).await;

    assert_eq!(response.source, CacheSource::Cache);
    assert!(!response.is_stale);
    assert!(!response.refreshing);
    assert_eq!(response.fetched_at, Some(fixtures::t0()));
    assert_eq!(response.data.len(), 1);
    assert_eq!(h.runtime.orchestrator().metrics().enqueued, 0);
    assert_eq!(scraper.calls(), 0);

    h.runtime.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_stale_entry_is_served_then_refreshed() {
    let scraper = Arc::new(MockScraper::new("noon.com").returning(vec![
        record("noon.com", "iPhone 15", 3799),
        record("noon.com", "iPhone 15 Pro", 4999),
    ]));
    let h = harness(&[scraper.clone()]);
    seed(&h.runtime, "iphone", &[record("noon.com", "iPhone 15", 3999)]).await;

    h.clock.advance_minutes(121);
    let stale = h.runtime.search("iphone", None).await;
    assert_eq!(stale.source, CacheSource::Cache);
    assert!(stale.is_stale);
    assert!(stale.refreshing);
    assert_eq!(stale.data.len(), 1);

    wait_for_finished(&h.runtime, 1).await;

    let refreshed = h.runtime.search("iphone", None).await;
    assert_eq!(refreshed.source, CacheSource::Cache);
    assert!(!refreshed.is_stale);
    assert_eq!(refreshed.fetched_at, Some(h.clock.now()));
    assert_eq!(refreshed.data.len(), 2);
    assert_sorted_by_price(&refreshed.data);
    assert_eq!(refreshed.data[0].price, Some(Decimal::from(3799)));

    h.runtime.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_cold_search_answers_from_direct_fetch() {
    let scraper = Arc::new(MockScraper::new("noon.com").returning(vec![
        record("noon.com", "Kettle Steel", 120),
        record("noon.com", "Kettle Glass", 80),
    ]));
    let h = harness(&[scraper.clone()]);

    let response = h.runtime.search("kettle", None).await;
    assert_eq!(response.source, CacheSource::Fresh);
    assert!(response.refreshing);
    assert_eq!(response.data.len(), 2);
    assert_eq!(response.data[0].name, "Kettle Glass");

    wait_for_finished(&h.runtime, 1).await;
    let cached = h.runtime.search("kettle", None).await;
    assert_eq!(cached.source, CacheSource::Cache);
    assert_eq!(cached.data.len(), 2);
    assert_eq!(scraper.calls(), 2);

    h.runtime.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_cold_search_degrades_to_error_when_nothing_can_run() {
    let h = harness(&[]);
    h.runtime.orchestrator().shutdown().await;

    let response = h.runtime.search("kettle", None).await;
    assert_eq!(response.source, CacheSource::Error);
    assert!(!response.refreshing);
    assert!(response.data.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_blank_query_is_answered_without_work() {
    let scraper = Arc::new(MockScraper::new("noon.com"));
    let h = harness(&[scraper.clone()]);

    let response = h.runtime.search("   ", None).await;
    assert_eq!(response.source, CacheSource::None);
    assert!(!response.refreshing);
    assert_eq!(scraper.calls(), 0);
    assert_eq!(h.runtime.orchestrator().metrics().enqueued, 0);

    h.runtime.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_refresh_merges_price_drop_and_new_item() {
    let scraper = Arc::new(MockScraper::new("noon.com").returning(vec![
        record("noon.com", "Phone A", 90),
        record("noon.com", "Phone B", 50),
    ]));
    let h = harness(&[scraper.clone()]);
    seed(&h.runtime, "phone", &[record("noon.com", "Phone A", 100)]).await;
    h.clock.advance_minutes(30);
    let now = h.clock.now();

    let refresher = h.runtime.refresher();
    let scrape = refresher.scrape("phone", &[]).await.unwrap();
    let report = refresher.apply("phone", scrape, &[]).await.unwrap();

    assert_eq!(report.records, 2);
    assert!(report.decision.should_rebuild);
    assert_eq!(report.decision.trigger, RebuildReason::NewItems { count: 1 });
    assert!(report.decision.reason.contains("1 new"));
    assert!(!report.first_fill);

    let cached = h
        .runtime
        .cache()
        .get::<Vec<ProductRecord>>(&CacheKey::search("phone"))
        .await
        .unwrap()
        .payload;
    let a = cached.iter().find(|r| r.name == "Phone A").unwrap();
    let b = cached.iter().find(|r| r.name == "Phone B").unwrap();
    assert_eq!(a.price, Some(Decimal::from(90)));
    assert_eq!(a.first_seen_at, fixtures::t0());
    assert_eq!(a.last_seen_at, now);
    assert_eq!(b.first_seen_at, now);
    assert_eq!(b.last_seen_at, now);

    h.runtime.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_failed_source_keeps_its_cached_records() {
    let noon = Arc::new(MockScraper::new("noon.com").failing("503"));
    let amazon = Arc::new(MockScraper::new("amazon.sa").returning(vec![
        record("amazon.sa", "Blender Pro", 180),
        record("amazon.sa", "Blender Mini", 90),
    ]));
    let h = harness(&[noon.clone(), amazon.clone()]);
    seed(
        &h.runtime,
        "blender",
        &[
            record("noon.com", "Blender Max", 150),
            record("amazon.sa", "Blender Pro", 200),
        ],
    )
    .await;

    let refresher = h.runtime.refresher();
    let scrape = refresher.scrape("blender", &[]).await.unwrap();
    assert_eq!(scrape.succeeded, vec!["amazon.sa".to_string()]);
    assert_eq!(scrape.failed.len(), 1);

    let report = refresher.apply("blender", scrape, &[]).await.unwrap();
    assert_eq!(report.records, 3);
    assert_eq!(report.outcome.removed, 0);

    let stored = h.persistence.last_batch().unwrap();
    let noon_record = stored.iter().find(|r| r.site == "noon.com").unwrap();
    assert!(!noon_record.removed);
    assert_eq!(noon_record.price, Some(Decimal::from(150)));
    let pro = stored.iter().find(|r| r.name == "Blender Pro").unwrap();
    assert_eq!(pro.price, Some(Decimal::from(180)));

    h.runtime.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_every_source_failing_is_a_retryable_fetch_error() {
    let noon = Arc::new(MockScraper::new("noon.com").failing("503"));
    let amazon = Arc::new(MockScraper::new("amazon.sa").failing("timeout"));
    let h = harness(&[noon, amazon]);

    let err = h.runtime.refresher().scrape("tv", &[]).await.unwrap_err();
    assert_eq!(
        err,
        FetchError::AllSourcesFailed {
            query: "tv".to_string(),
            attempted: 2,
        }
    );

    h.runtime.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_cache_write_failure_fails_the_refresh() {
    let scraper = Arc::new(
        MockScraper::new("noon.com").returning(vec![record("noon.com", "Fan", 60)]),
    );
    let h = harness_on(&[scraper.clone()], Arc::new(FaultyCacheBackend::failing_writes()));

    let refresher = h.runtime.refresher();
    let scrape = refresher.scrape("fan", &[]).await.unwrap();
    let result = refresher.apply("fan", scrape, &[]).await;
    assert_cache_error(&result);
    // Persisted before the cache write.
    assert_eq!(h.persistence.upserts(), 1);

    let id = h
        .runtime
        .orchestrator()
        .enqueue(
            JobPayload::RefreshSearch(RefreshSearchJob::new("fan")),
            EnqueueOptions::default().with_max_attempts(1),
        )
        .unwrap();
    wait_for_finished(&h.runtime, 1).await;

    let job = h.runtime.orchestrator().job(id).unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert!(job.last_error.unwrap().contains("disk full"));
    assert_eq!(h.runtime.orchestrator().failed_jobs().len(), 1);

    h.runtime.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_notifies_only_on_first_fill_or_material_change() {
    let scraper = Arc::new(
        MockScraper::new("noon.com").returning(vec![record("noon.com", "Toaster", 70)]),
    );
    let h = harness(&[scraper.clone()]);
    let (sink, log) = RecordingSink::new();
    h.runtime
        .bus()
        .register_connection("c1", sink, Transport::Stream);
    let audience = vec!["c1".to_string()];
    let refresher = h.runtime.refresher();

    let scrape = refresher.scrape("toaster", &[]).await.unwrap();
    let first = refresher.apply("toaster", scrape, &audience).await.unwrap();
    assert!(first.first_fill);
    assert!(first.notified);
    assert_eq!(log.len(), 1);

    let scrape = refresher.scrape("toaster", &[]).await.unwrap();
    let unchanged = refresher.apply("toaster", scrape, &audience).await.unwrap();
    assert!(!unchanged.decision.should_rebuild);
    assert!(!unchanged.notified);
    assert_eq!(log.len(), 1);

    scraper.set_records(vec![
        record("noon.com", "Toaster", 70),
        record("noon.com", "Toaster Oven", 210),
    ]);
    let scrape = refresher.scrape("toaster", &[]).await.unwrap();
    let grown = refresher.apply("toaster", scrape, &audience).await.unwrap();
    assert!(grown.notified);
    assert_eq!(log.len(), 2);

    let last = log.events().pop().unwrap();
    assert_eq!(last.name, SEARCH_UPDATED_EVENT);
    assert_eq!(last.data["count"], 2);

    h.runtime.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_background_refresh_pushes_to_requesting_connection_only() {
    let scraper = Arc::new(
        MockScraper::new("noon.com")
            .returning(vec![record("noon.com", "Lamp", 35)])
            .with_delay(Duration::from_secs(10)),
    );
    let h = harness(&[scraper.clone()]);
    let (requester, requester_log) = RecordingSink::new();
    let (bystander, bystander_log) = RecordingSink::new();
    h.runtime
        .bus()
        .register_connection("requester", requester, Transport::Socket);
    h.runtime
        .bus()
        .register_connection("bystander", bystander, Transport::Stream);

    let response = h
        .runtime
        .search("lamp", Some("requester".to_string()))
        .await;
    assert_eq!(response.source, CacheSource::None);
    assert!(response.refreshing);

    wait_for_finished(&h.runtime, 1).await;
    assert!(requester_log.wait_for(1, Duration::from_secs(1)).await);
    assert!(bystander_log.is_empty());

    h.runtime.shutdown().await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(requester_log.is_closed());
    assert!(bystander_log.is_closed());
}

#[tokio::test(start_paused = true)]
async fn test_refresh_without_audience_broadcasts() {
    let scraper = Arc::new(
        MockScraper::new("noon.com").returning(vec![record("noon.com", "Desk", 400)]),
    );
    let h = harness(&[scraper.clone()]);
    let (one, one_log) = RecordingSink::new();
    let (two, two_log) = RecordingSink::new();
    h.runtime.bus().register_connection("one", one, Transport::Stream);
    h.runtime.bus().register_connection("two", two, Transport::Socket);

    let refresher = h.runtime.refresher();
    let scrape = refresher.scrape("desk", &[]).await.unwrap();
    let report = refresher.apply("desk", scrape, &[]).await.unwrap();
    assert!(report.notified);

    assert!(one_log.wait_for(1, Duration::from_secs(1)).await);
    assert!(two_log.wait_for(1, Duration::from_secs(1)).await);

    h.runtime.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_metrics_render_after_traffic() {
    let scraper = Arc::new(
        MockScraper::new("noon.com").returning(vec![record("noon.com", "Chair", 150)]),
    );
    let h = harness(&[scraper]);
    let (sink, _log) = RecordingSink::new();
    h.runtime.bus().register_connection("c1", sink, Transport::Stream);

    h.runtime.search("chair", None).await;
    wait_for_finished(&h.runtime, 1).await;

    let text = h.runtime.render_metrics().unwrap();
    assert!(text.contains("basket_cache_lookups_total"));
    assert!(text.contains("basket_active_connections 1"));

    h.runtime.shutdown().await;
}

#[tokio::test]
async fn test_lmdb_runtime_serves_cached_results() {
    let dir = tempfile::tempdir().unwrap();
    let scraper = Arc::new(
        MockScraper::new("noon.com").returning(vec![record("noon.com", "Router", 220)]),
    );
    let persistence = Arc::new(RecordingPersistence::new());
    let collaborators: Collaborators = fixtures::collaborators(&[scraper.clone()], persistence);
    let config = test_config().with_cache(CacheConfig::default().with_lmdb(dir.path()));

    let runtime = BasketRuntime::start(config, collaborators).unwrap();
    let cold = runtime.search("router", None).await;
    assert_eq!(cold.source, CacheSource::Fresh);

    wait_for_finished(&runtime, 1).await;
    let warm = runtime.search("router", None).await;
    assert_eq!(warm.source, CacheSource::Cache);
    assert!(!warm.is_stale);
    assert_eq!(warm.data.len(), 1);

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_invalid_config_is_rejected_at_start() {
    let config = test_config().with_direct_fetch_timeout(Duration::ZERO);
    let collaborators = fixtures::collaborators(&[], Arc::new(RecordingPersistence::new()));

    let err = BasketRuntime::start(config, collaborators).unwrap_err();
    assert!(matches!(err, BasketError::Config(_)));
}
