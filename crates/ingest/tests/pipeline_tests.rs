//! End-to-end tests for `IngestionPipeline` with scripted sources.
//!
//! All tests run on a paused clock, so backoff sleeps, rate-limit waits and
//! fetch deadlines advance instantly and deterministically.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cardprice_ingest::{
    CardRef, CircuitState, FailedSourceKind, FailureKind, IngestError, IngestionPipeline,
    InMemoryPriceStore, PriceQuery, PriceRecord, PriceSource, PriceStore, RawPriceRecord,
    ServiceEndpointConfig, SourceClient, SourceFailure, SourceRegistry, StoreError,
};
use rust_decimal_macros::dec;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

// =============================================================================
// Test doubles
// =============================================================================

#[derive(Clone)]
enum Step {
    Records(Vec<RawPriceRecord>),
    Fail(SourceFailure),
    Slow(Duration, Vec<RawPriceRecord>),
    Hang,
}

/// A source that plays back a script, then repeats a fallback step.
struct ScriptedSource {
    source: PriceSource,
    script: Mutex<VecDeque<Step>>,
    fallback: Step,
    calls: AtomicU32,
}

impl ScriptedSource {
    fn new(source: PriceSource, script: Vec<Step>, fallback: Step) -> Arc<Self> {
        Arc::new(Self {
            source,
            script: Mutex::new(script.into()),
            fallback,
            calls: AtomicU32::new(0),
        })
    }

    fn always(source: PriceSource, step: Step) -> Arc<Self> {
        Self::new(source, vec![], step)
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceClient for ScriptedSource {
    fn source(&self) -> PriceSource {
        self.source
    }

    async fn fetch(&self, _query: &PriceQuery) -> Result<Vec<RawPriceRecord>, SourceFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        match step {
            Step::Records(records) => Ok(records),
            Step::Fail(failure) => Err(failure),
            Step::Slow(delay, records) => {
                tokio::time::sleep(delay).await;
                Ok(records)
            }
            Step::Hang => std::future::pending().await,
        }
    }
}

struct FailingStore;

#[async_trait]
impl PriceStore for FailingStore {
    async fn upsert_batch(&self, _records: &[PriceRecord]) -> Result<usize, StoreError> {
        Err(StoreError::Unavailable("disk full".to_string()))
    }
}

/// A source that asks upstream one card at a time.
struct PerCardSource {
    source: PriceSource,
    delay: Duration,
    failures: Vec<(i64, SourceFailure)>,
    fetched_at: Mutex<Vec<Instant>>,
}

impl PerCardSource {
    fn new(source: PriceSource, delay: Duration) -> Self {
        Self {
            source,
            delay,
            failures: Vec::new(),
            fetched_at: Mutex::new(Vec::new()),
        }
    }

    fn failing(mut self, card_id: i64, failure: SourceFailure) -> Self {
        self.failures.push((card_id, failure));
        self
    }

    fn fetched_at(&self) -> Vec<Instant> {
        self.fetched_at.lock().unwrap().clone()
    }
}

#[async_trait]
impl SourceClient for PerCardSource {
    fn source(&self) -> PriceSource {
        self.source
    }

    fn request_units(&self, query: &PriceQuery) -> Vec<PriceQuery> {
        query
            .cards
            .iter()
            .map(|card| query.with_cards(vec![card.clone()]))
            .collect()
    }

    async fn fetch(&self, query: &PriceQuery) -> Result<Vec<RawPriceRecord>, SourceFailure> {
        self.fetched_at.lock().unwrap().push(Instant::now());
        tokio::time::sleep(self.delay).await;

        let mut records = Vec::new();
        for card in &query.cards {
            if let Some((_, failure)) = self.failures.iter().find(|(id, _)| *id == card.card_id) {
                return Err(failure.clone());
            }
            records.push(priced(card.card_id, "1.00"));
        }
        Ok(records)
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn endpoint(source: PriceSource) -> ServiceEndpointConfig {
    ServiceEndpointConfig::new(source)
}

fn registry(configs: Vec<ServiceEndpointConfig>) -> Arc<SourceRegistry> {
    Arc::new(SourceRegistry::new(configs))
}

fn query() -> PriceQuery {
    PriceQuery::batch(vec![CardRef::new(1), CardRef::new(2)])
}

fn priced(card_id: i64, price: &str) -> RawPriceRecord {
    RawPriceRecord::new(card_id)
        .market_price(price)
        .timestamp("2024-05-01T00:00:00Z")
}

fn cards(count: i64) -> PriceQuery {
    PriceQuery::batch((1..=count).map(CardRef::new).collect())
}

fn two_cards() -> Vec<RawPriceRecord> {
    vec![priced(1, "4.99"), priced(2, "12.00")]
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_partial_failure_keeps_healthy_sources() {
    let healthy = ScriptedSource::always(PriceSource::JustTcg, Step::Records(two_cards()));
    let overloaded = ScriptedSource::always(
        PriceSource::Ebay,
        Step::Fail(SourceFailure::http(503, "unavailable")),
    );
    let missing = ScriptedSource::always(
        PriceSource::PriceCharting,
        Step::Fail(SourceFailure::http(404, "no such product")),
    );

    let store = Arc::new(InMemoryPriceStore::new());
    let pipeline = IngestionPipeline::new(
        registry(vec![
            endpoint(PriceSource::JustTcg),
            endpoint(PriceSource::Ebay),
            endpoint(PriceSource::PriceCharting),
        ]),
        store.clone(),
    )
    .with_client(healthy.clone())
    .with_client(overloaded.clone())
    .with_client(missing.clone());

    let result = pipeline
        .ingest(
            &[PriceSource::JustTcg, PriceSource::Ebay, PriceSource::PriceCharting],
            &query(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(result.requested, 3);
    assert_eq!(result.received, 2);
    assert_eq!(result.stored, 2);
    assert_eq!(store.len(), 2);
    assert!(!result.is_complete());

    let ebay = result.failed(PriceSource::Ebay).unwrap();
    assert_eq!(ebay.kind, FailedSourceKind::RetryExhausted);
    assert_eq!(ebay.last_failure, Some(FailureKind::Transient));
    assert_eq!(overloaded.calls(), 3);

    let pricecharting = result.failed(PriceSource::PriceCharting).unwrap();
    assert_eq!(pricecharting.kind, FailedSourceKind::Permanent);
    assert_eq!(missing.calls(), 1);

    assert!(result.failed(PriceSource::JustTcg).is_none());
    assert_eq!(healthy.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_reingesting_the_same_prices_is_idempotent() {
    let source = ScriptedSource::always(PriceSource::JustTcg, Step::Records(two_cards()));
    let store = Arc::new(InMemoryPriceStore::new());
    let pipeline = IngestionPipeline::new(registry(vec![endpoint(PriceSource::JustTcg)]), store.clone())
        .with_client(source);
    let cancel = CancellationToken::new();

    pipeline.ingest(&[PriceSource::JustTcg], &query(), &cancel).await.unwrap();
    let before = store.records();
    pipeline.ingest(&[PriceSource::JustTcg], &query(), &cancel).await.unwrap();

    assert_eq!(store.len(), 2);
    assert_eq!(store.records(), before);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_records_are_skipped_not_fatal() {
    let source = ScriptedSource::always(
        PriceSource::Cardmarket,
        Step::Records(vec![
            priced(1, "3.00"),
            RawPriceRecord::new(2),
            priced(3, "-1"),
            RawPriceRecord::default().market_price("1.00"),
        ]),
    );
    let store = Arc::new(InMemoryPriceStore::new());
    let pipeline =
        IngestionPipeline::new(registry(vec![endpoint(PriceSource::Cardmarket)]), store.clone())
            .with_client(source);

    let result = pipeline
        .ingest(&[PriceSource::Cardmarket], &query(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.received, 4);
    assert_eq!(result.stored, 1);
    assert_eq!(result.skipped_invalid, 3);
    assert_eq!(result.skipped.len(), 3);
    assert!(result.skipped.iter().all(|s| s.source == PriceSource::Cardmarket));
    assert!(result.is_complete());
    assert_eq!(store.records()[0].market_price, dec!(3.00));
}

#[tokio::test(start_paused = true)]
async fn test_open_circuit_fails_fast_across_calls() {
    let source = ScriptedSource::new(
        PriceSource::Ebay,
        vec![
            Step::Fail(SourceFailure::Timeout),
            Step::Fail(SourceFailure::Connection("reset".to_string())),
        ],
        Step::Records(two_cards()),
    );
    let config = endpoint(PriceSource::Ebay)
        .with_circuit(2, Duration::from_secs(60), 1)
        .with_retry(1, Duration::from_secs(1), Duration::from_secs(60), 2.0);
    let store = Arc::new(InMemoryPriceStore::new());
    let pipeline = IngestionPipeline::new(registry(vec![config]), store.clone())
        .with_client(source.clone());
    let cancel = CancellationToken::new();

    for _ in 0..2 {
        let result = pipeline.ingest(&[PriceSource::Ebay], &query(), &cancel).await.unwrap();
        assert_eq!(
            result.failed(PriceSource::Ebay).unwrap().kind,
            FailedSourceKind::RetryExhausted
        );
    }

    let result = pipeline.ingest(&[PriceSource::Ebay], &query(), &cancel).await.unwrap();
    assert_eq!(
        result.failed(PriceSource::Ebay).unwrap().kind,
        FailedSourceKind::CircuitOpen
    );
    assert_eq!(source.calls(), 2);

    let health = pipeline.registry().health();
    assert_eq!(health[0].state, CircuitState::Open);
    assert!(!health[0].is_healthy());

    // After the recovery timeout a single trial call closes the circuit again
    tokio::time::advance(Duration::from_secs(61)).await;
    let result = pipeline.ingest(&[PriceSource::Ebay], &query(), &cancel).await.unwrap();
    assert!(result.is_complete());
    assert_eq!(result.stored, 2);
    assert_eq!(source.calls(), 3);
    assert_eq!(pipeline.registry().health()[0].state, CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_retry_after_hint_is_honored() {
    let source = ScriptedSource::new(
        PriceSource::JustTcg,
        vec![Step::Fail(SourceFailure::http_with_retry_after(
            429,
            Duration::from_secs(5),
            "slow down",
        ))],
        Step::Records(two_cards()),
    );
    let store = Arc::new(InMemoryPriceStore::new());
    let pipeline = IngestionPipeline::new(registry(vec![endpoint(PriceSource::JustTcg)]), store)
        .with_client(source.clone());

    let start = Instant::now();
    let result = pipeline
        .ingest(&[PriceSource::JustTcg], &query(), &CancellationToken::new())
        .await
        .unwrap();

    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_secs(5), "waited only {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(6), "waited {:?}", elapsed);
    assert_eq!(source.calls(), 2);
    assert_eq!(result.stored, 2);
}

#[tokio::test(start_paused = true)]
async fn test_slow_fetch_times_out_and_is_retried() {
    let source = ScriptedSource::new(
        PriceSource::PriceCharting,
        vec![Step::Slow(Duration::from_secs(10), two_cards())],
        Step::Records(two_cards()),
    );
    let store = Arc::new(InMemoryPriceStore::new());
    let pipeline =
        IngestionPipeline::new(registry(vec![endpoint(PriceSource::PriceCharting)]), store)
            .with_client(source.clone())
            .with_fetch_timeout(Duration::from_secs(2));

    let start = Instant::now();
    let result = pipeline
        .ingest(&[PriceSource::PriceCharting], &query(), &CancellationToken::new())
        .await
        .unwrap();

    // 2s deadline, then a jittered 0.5s..=1s backoff
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(2_500), "elapsed {:?}", elapsed);
    assert!(elapsed <= Duration::from_millis(3_005), "elapsed {:?}", elapsed);
    assert_eq!(source.calls(), 2);
    assert!(result.is_complete());
    assert_eq!(
        pipeline.registry().health()[0].consecutive_failures,
        0,
        "success resets the failure count"
    );
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_reports_unfinished_sources() {
    let stuck = ScriptedSource::always(PriceSource::JustTcg, Step::Hang);
    let quick = ScriptedSource::always(PriceSource::Manual, Step::Records(two_cards()));
    let store = Arc::new(InMemoryPriceStore::new());
    let pipeline = IngestionPipeline::new(
        registry(vec![endpoint(PriceSource::JustTcg), endpoint(PriceSource::Manual)]),
        store.clone(),
    )
    .with_client(stuck)
    .with_client(quick);

    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        canceller.cancel();
    });

    let result = pipeline
        .ingest(&[PriceSource::JustTcg, PriceSource::Manual], &query(), &cancel)
        .await
        .unwrap();

    let failed = result.failed(PriceSource::JustTcg).unwrap();
    assert_eq!(failed.kind, FailedSourceKind::Cancelled);
    assert_eq!(result.stored, 2, "completed sources are still persisted");
    assert_eq!(store.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_before_start_is_an_error() {
    let source = ScriptedSource::always(PriceSource::Manual, Step::Records(two_cards()));
    let pipeline = IngestionPipeline::new(
        registry(vec![endpoint(PriceSource::Manual)]),
        Arc::new(InMemoryPriceStore::new()),
    )
    .with_client(source.clone());

    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = pipeline
        .ingest(&[PriceSource::Manual], &query(), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::Cancelled));
    assert_eq!(source.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_source_is_an_error() {
    let pipeline = IngestionPipeline::new(
        registry(vec![endpoint(PriceSource::Manual)]),
        Arc::new(InMemoryPriceStore::new()),
    )
    .with_client(ScriptedSource::always(
        PriceSource::Manual,
        Step::Records(vec![]),
    ));

    let err = pipeline
        .ingest(
            &[PriceSource::Manual, PriceSource::Cardmarket],
            &query(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::UnknownSource(name) if name == "cardmarket"));
}

#[tokio::test(start_paused = true)]
async fn test_store_failure_is_reported_per_source() {
    let pipeline = IngestionPipeline::new(
        registry(vec![endpoint(PriceSource::Ebay)]),
        Arc::new(FailingStore),
    )
    .with_client(ScriptedSource::always(
        PriceSource::Ebay,
        Step::Records(two_cards()),
    ));

    let result = pipeline
        .ingest(&[PriceSource::Ebay], &query(), &CancellationToken::new())
        .await
        .unwrap();

    let failed = result.failed(PriceSource::Ebay).unwrap();
    assert_eq!(failed.kind, FailedSourceKind::Storage);
    assert!(failed.message.contains("disk full"));
    assert_eq!(result.received, 2);
    assert_eq!(result.stored, 0);
}

#[tokio::test(start_paused = true)]
async fn test_concurrency_limit_serializes_sources() {
    let store = Arc::new(InMemoryPriceStore::new());
    let pipeline = IngestionPipeline::new(
        registry(vec![endpoint(PriceSource::Ebay), endpoint(PriceSource::Cardmarket)]),
        store,
    )
    .with_client(ScriptedSource::always(
        PriceSource::Ebay,
        Step::Slow(Duration::from_secs(1), vec![priced(1, "1")]),
    ))
    .with_client(ScriptedSource::always(
        PriceSource::Cardmarket,
        Step::Slow(Duration::from_secs(1), vec![priced(1, "2")]),
    ))
    .with_max_concurrent_sources(Some(1));

    let start = Instant::now();
    let result = pipeline
        .ingest(
            &[PriceSource::Ebay, PriceSource::Cardmarket],
            &query(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(start.elapsed(), Duration::from_secs(2));
    assert_eq!(result.stored, 2);
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_spaces_out_attempts() {
    let source = ScriptedSource::always(PriceSource::Manual, Step::Records(vec![priced(1, "1")]));
    let config = endpoint(PriceSource::Manual).with_rate_limit(1, Duration::from_secs(10));
    let pipeline = IngestionPipeline::new(
        registry(vec![config]),
        Arc::new(InMemoryPriceStore::new()),
    )
    .with_client(source.clone());
    let cancel = CancellationToken::new();

    let start = Instant::now();
    pipeline.ingest(&[PriceSource::Manual], &query(), &cancel).await.unwrap();
    pipeline.ingest(&[PriceSource::Manual], &query(), &cancel).await.unwrap();

    assert_eq!(start.elapsed(), Duration::from_secs(10));
    assert_eq!(source.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_every_request_takes_a_rate_limit_slot() {
    let source = Arc::new(PerCardSource::new(PriceSource::Manual, Duration::ZERO));
    let config = endpoint(PriceSource::Manual).with_rate_limit(2, Duration::from_secs(3600));
    let store = Arc::new(InMemoryPriceStore::new());
    let pipeline = IngestionPipeline::new(registry(vec![config]), store.clone())
        .with_client(source.clone());

    let result = pipeline
        .ingest(&[PriceSource::Manual], &cards(10), &CancellationToken::new())
        .await
        .unwrap();

    let fetched_at = source.fetched_at();
    assert_eq!(fetched_at.len(), 10);
    for window in fetched_at.windows(3) {
        assert!(window[2] - window[0] >= Duration::from_secs(3600));
    }
    assert!(result.is_complete());
    assert_eq!(result.stored, 10);
    assert_eq!(store.len(), 10);
}

#[tokio::test(start_paused = true)]
async fn test_fetch_deadline_applies_per_request() {
    let source = Arc::new(PerCardSource::new(PriceSource::Manual, Duration::from_millis(150)));
    let store = Arc::new(InMemoryPriceStore::new());
    let pipeline = IngestionPipeline::new(registry(vec![endpoint(PriceSource::Manual)]), store)
        .with_client(source.clone())
        .with_fetch_timeout(Duration::from_secs(1));

    let start = Instant::now();
    let result = pipeline
        .ingest(&[PriceSource::Manual], &cards(10), &CancellationToken::new())
        .await
        .unwrap();

    assert!(result.failed_sources.is_empty());
    assert_eq!(result.stored, 10);
    assert_eq!(source.fetched_at().len(), 10);
    assert_eq!(start.elapsed(), Duration::from_millis(1500));
}

#[tokio::test(start_paused = true)]
async fn test_finished_requests_survive_a_failing_one() {
    let source = Arc::new(
        PerCardSource::new(PriceSource::Manual, Duration::ZERO)
            .failing(3, SourceFailure::http(404, "no such card")),
    );
    let store = Arc::new(InMemoryPriceStore::new());
    let pipeline =
        IngestionPipeline::new(registry(vec![endpoint(PriceSource::Manual)]), store.clone())
            .with_client(source.clone());

    let result = pipeline
        .ingest(&[PriceSource::Manual], &cards(5), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(source.fetched_at().len(), 5);
    assert_eq!(result.received, 4);
    assert_eq!(result.stored, 4);
    assert_eq!(store.len(), 4);
    let failed = result.failed(PriceSource::Manual).unwrap();
    assert_eq!(failed.kind, FailedSourceKind::Permanent);
}

#[tokio::test(start_paused = true)]
async fn test_circuit_opening_mid_source_stops_remaining_requests() {
    let source = Arc::new(
        PerCardSource::new(PriceSource::Manual, Duration::ZERO)
            .failing(2, SourceFailure::http(503, "unavailable"))
            .failing(3, SourceFailure::http(503, "unavailable")),
    );
    let config = endpoint(PriceSource::Manual)
        .with_circuit(2, Duration::from_secs(60), 1)
        .with_retry(1, Duration::from_millis(10), Duration::from_millis(10), 1.0);
    let store = Arc::new(InMemoryPriceStore::new());
    let pipeline = IngestionPipeline::new(registry(vec![config]), store.clone())
        .with_client(source.clone());

    let result = pipeline
        .ingest(&[PriceSource::Manual], &cards(5), &CancellationToken::new())
        .await
        .unwrap();

    // Card 4 is turned away by the open circuit and card 5 is never tried
    assert_eq!(source.fetched_at().len(), 3);
    assert_eq!(result.stored, 1);
    assert_eq!(store.len(), 1);
    let failed = result.failed(PriceSource::Manual).unwrap();
    assert_eq!(failed.kind, FailedSourceKind::CircuitOpen);
}

#[tokio::test(start_paused = true)]
async fn test_one_failing_source_does_not_hold_back_the_others() {
    let first = ScriptedSource::always(PriceSource::JustTcg, Step::Records(two_cards()));
    let second = ScriptedSource::always(
        PriceSource::Cardmarket,
        Step::Records(vec![priced(3, "0.75"), priced(4, "31.50")]),
    );
    let broken = ScriptedSource::always(
        PriceSource::Ebay,
        Step::Fail(SourceFailure::http(503, "unavailable")),
    );

    let store = Arc::new(InMemoryPriceStore::new());
    let pipeline = IngestionPipeline::new(
        registry(vec![
            endpoint(PriceSource::JustTcg),
            endpoint(PriceSource::Cardmarket),
            endpoint(PriceSource::Ebay),
        ]),
        store.clone(),
    )
    .with_client(first)
    .with_client(second)
    .with_client(broken);

    let result = pipeline
        .ingest(
            &[PriceSource::JustTcg, PriceSource::Cardmarket, PriceSource::Ebay],
            &query(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(result.failed_sources.len(), 1);
    assert_eq!(result.failed_sources[0].source, PriceSource::Ebay);
    assert_eq!(result.failed_sources[0].kind, FailedSourceKind::RetryExhausted);
    assert_eq!(result.received, 4);
    assert_eq!(result.stored, 4);
    assert_eq!(store.len(), 4);
}
