//! Ingestion orchestration.
//!
//! One `ingest` call fans out to every requested source on its own task.
//! The source client splits the query into request units, one per upstream
//! request. Every unit is wrapped, per attempt, in the source's rate limiter,
//! circuit breaker and fetch deadline, and its sequence of attempts in the
//! retry executor. Sources fail independently, and so do units: whatever
//! succeeded is normalized and persisted, whatever failed is reported.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use rust_decimal::Decimal;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::config::{IngestConfig, DEFAULT_FETCH_TIMEOUT};
use crate::errors::{IngestError, Result, SourceFailure};
use crate::models::{
    FailedSource, FailedSourceKind, IngestionResult, PriceQuery, PriceRecord, PriceSource,
    RawPriceRecord,
};
use crate::normalizer::PriceNormalizer;
use crate::provider::SourceClient;
use crate::registry::{SourceEntry, SourceRegistry};
use crate::store::PriceStore;

/// Coordinates sources, resilience, normalization and persistence.
pub struct IngestionPipeline {
    registry: Arc<SourceRegistry>,
    clients: HashMap<PriceSource, Arc<dyn SourceClient>>,
    store: Arc<dyn PriceStore>,
    normalizer: Arc<PriceNormalizer>,
    fetch_timeout: Duration,
    max_concurrent_sources: Option<usize>,
}

impl IngestionPipeline {
    pub fn new(registry: Arc<SourceRegistry>, store: Arc<dyn PriceStore>) -> Self {
        Self {
            registry,
            clients: HashMap::new(),
            store,
            normalizer: Arc::new(PriceNormalizer::new()),
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            max_concurrent_sources: None,
        }
    }

    /// Build a pipeline from loaded configuration: registry, deadline,
    /// concurrency bound and price ceiling.
    pub fn from_config(config: &IngestConfig, store: Arc<dyn PriceStore>) -> Self {
        Self::new(Arc::new(SourceRegistry::from_config(config)), store)
            .with_fetch_timeout(config.fetch_timeout)
            .with_normalizer(PriceNormalizer::with_max_price(Decimal::from(
                config.max_market_price,
            )))
            .with_max_concurrent_sources(config.max_concurrent_sources)
    }

    /// Register the client for its source, replacing any previous one.
    pub fn with_client(mut self, client: Arc<dyn SourceClient>) -> Self {
        self.clients.insert(client.source(), client);
        self
    }

    pub fn with_fetch_timeout(mut self, fetch_timeout: Duration) -> Self {
        self.fetch_timeout = fetch_timeout;
        self
    }

    /// Bound how many sources are fetched at once. `None` runs all in parallel.
    pub fn with_max_concurrent_sources(mut self, limit: Option<usize>) -> Self {
        self.max_concurrent_sources = limit.filter(|n| *n > 0);
        self
    }

    pub fn with_normalizer(mut self, normalizer: PriceNormalizer) -> Self {
        self.normalizer = Arc::new(normalizer);
        self
    }

    pub fn registry(&self) -> &Arc<SourceRegistry> {
        &self.registry
    }

    /// Sources that have both a registry entry and a client.
    pub fn available_sources(&self) -> Vec<PriceSource> {
        self.registry
            .sources()
            .into_iter()
            .filter(|source| self.clients.contains_key(source))
            .collect()
    }

    /// Fetch, normalize and store prices for `query` from every source in `sources`.
    ///
    /// Duplicate sources are collapsed. Source failures never fail the call;
    /// they are reported in [`IngestionResult::failed_sources`].
    ///
    /// # Errors
    ///
    /// - `UnknownSource` if a source has no registry entry or no client
    /// - `InvalidQuery` if the query names no cards or a non-positive card id
    /// - `Cancelled` if `cancel` already fired before any work started
    pub async fn ingest(
        &self,
        sources: &[PriceSource],
        query: &PriceQuery,
        cancel: &CancellationToken,
    ) -> Result<IngestionResult> {
        if cancel.is_cancelled() {
            return Err(IngestError::Cancelled);
        }
        query.validate()?;

        let mut seen = HashSet::new();
        let mut targets = Vec::new();
        for &source in sources {
            if !seen.insert(source) {
                continue;
            }
            let entry = self
                .registry
                .get(source)
                .ok_or_else(|| IngestError::UnknownSource(source.to_string()))?;
            let client = self
                .clients
                .get(&source)
                .cloned()
                .ok_or_else(|| IngestError::UnknownSource(source.to_string()))?;
            targets.push((entry, client));
        }

        info!(
            "Ingesting prices for {} card(s) from {} source(s)",
            query.cards.len(),
            targets.len()
        );

        let permits = Arc::new(Semaphore::new(
            self.max_concurrent_sources
                .unwrap_or(targets.len())
                .max(1),
        ));
        let query = Arc::new(query.clone());

        let handles: Vec<_> = targets
            .into_iter()
            .map(|(entry, client)| {
                let source = entry.source();
                let task = SourceTask {
                    entry,
                    client,
                    query: Arc::clone(&query),
                    fetch_timeout: self.fetch_timeout,
                    cancel: cancel.clone(),
                };
                let permits = Arc::clone(&permits);
                (source, tokio::spawn(task.run(permits)))
            })
            .collect();

        let mut result = IngestionResult {
            requested: handles.len(),
            ..Default::default()
        };
        let ingested_at = Utc::now();
        let mut batches: Vec<(PriceSource, Vec<PriceRecord>)> = Vec::new();

        for (source, handle) in handles {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(join_error) => {
                    warn!("Source '{}' task failed: {}", source, join_error);
                    result.failed_sources.push(FailedSource {
                        source,
                        kind: FailedSourceKind::Internal,
                        last_failure: None,
                        message: join_error.to_string(),
                    });
                    continue;
                }
            };

            result.received += outcome.records.len();
            let records = self.normalize(source, &outcome.records, ingested_at, &mut result);
            if !records.is_empty() {
                batches.push((source, records));
            }
            if let Some(e) = outcome.error {
                warn!(
                    "Source '{}' failed ({} of {} request(s) failed): {}",
                    source, outcome.failed_units, outcome.units, e
                );
                result.failed_sources.push(failed_source(source, &e));
            }
        }

        for (source, records) in batches {
            match self.store.upsert_batch(&records).await {
                Ok(stored) => {
                    debug!("Stored {} price record(s) from '{}'", stored, source);
                    result.stored += stored;
                }
                Err(e) => {
                    warn!(
                        "Failed to store {} record(s) from '{}': {}",
                        records.len(),
                        source,
                        e
                    );
                    // Lost records outrank a partial fetch failure
                    result.failed_sources.retain(|failed| failed.source != source);
                    result
                        .failed_sources
                        .push(failed_source(source, &IngestError::Store(e)));
                }
            }
        }

        info!(
            "Ingestion finished: {} requested, {} received, {} stored, {} skipped, {} failed",
            result.requested,
            result.received,
            result.stored,
            result.skipped_invalid,
            result.failed_sources.len()
        );

        Ok(result)
    }

    fn normalize(
        &self,
        source: PriceSource,
        raw: &[RawPriceRecord],
        ingested_at: DateTime<Utc>,
        result: &mut IngestionResult,
    ) -> Vec<PriceRecord> {
        let mut records = Vec::with_capacity(raw.len());
        for row in raw {
            match self.normalizer.normalize_at(row, source, ingested_at) {
                Ok(record) => records.push(record),
                Err(e) => {
                    debug!("Skipping record from '{}': {}", source, e);
                    result.record_skipped(source, e.to_string());
                }
            }
        }
        records
    }
}

fn failed_source(source: PriceSource, error: &IngestError) -> FailedSource {
    FailedSource {
        source,
        kind: error.failed_kind(),
        last_failure: error.failure_kind(),
        message: error.to_string(),
    }
}

/// What one source task brought back.
#[derive(Debug, Default)]
struct SourceOutcome {
    /// Rows from every unit that succeeded.
    records: Vec<RawPriceRecord>,
    units: usize,
    failed_units: usize,
    /// The last unit failure, or what stopped the task early.
    error: Option<IngestError>,
}

impl SourceOutcome {
    fn failed(error: IngestError) -> Self {
        Self {
            error: Some(error),
            ..Default::default()
        }
    }
}

/// Everything one source needs to run on its own task.
struct SourceTask {
    entry: Arc<SourceEntry>,
    client: Arc<dyn SourceClient>,
    query: Arc<PriceQuery>,
    fetch_timeout: Duration,
    cancel: CancellationToken,
}

impl SourceTask {
    async fn run(self, permits: Arc<Semaphore>) -> SourceOutcome {
        let _permit = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return SourceOutcome::failed(IngestError::Cancelled),
            permit = permits.acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return SourceOutcome::failed(IngestError::Cancelled),
            },
        };

        let units = self.client.request_units(&self.query);
        let mut outcome = SourceOutcome {
            units: units.len(),
            ..Default::default()
        };
        debug!(
            "Source '{}': {} request unit(s)",
            self.entry.source(),
            units.len()
        );

        for (index, unit) in units.iter().enumerate() {
            match self.fetch_unit(unit).await {
                Ok(records) => outcome.records.extend(records),
                Err(e) => {
                    // Nothing further gets through an open circuit or a cancelled run
                    let stop = matches!(
                        e,
                        IngestError::CircuitOpen { .. } | IngestError::Cancelled
                    );
                    outcome.error = Some(e);
                    if stop {
                        outcome.failed_units += units.len() - index;
                        break;
                    }
                    outcome.failed_units += 1;
                }
            }
        }

        outcome
    }

    /// One unit through limiter, breaker and deadline, retried as a whole.
    async fn fetch_unit(&self, unit: &PriceQuery) -> Result<Vec<RawPriceRecord>> {
        let source = self.entry.source();
        let entry = self.entry.as_ref();
        let client = self.client.as_ref();
        let cancel = &self.cancel;
        let fetch_timeout = self.fetch_timeout;

        entry
            .retry()
            .execute(cancel, move |attempt| async move {
                entry.rate_limiter().acquire(cancel).await?;
                debug!("Fetching from '{}', attempt {}", source, attempt);

                entry
                    .circuit_breaker()
                    .guard(|| async {
                        match tokio::time::timeout(fetch_timeout, client.fetch(unit)).await {
                            Ok(outcome) => outcome,
                            Err(_) => Err(SourceFailure::Timeout),
                        }
                    })
                    .await
            })
            .await
    }
}
