//! Outcome of one ingestion call.

use serde::Serialize;

use super::PriceSource;
use crate::errors::FailureKind;

/// Why a source contributed nothing to an ingestion.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailedSourceKind {
    /// Fast-failed by an open circuit breaker.
    CircuitOpen,
    /// Every allowed attempt failed with a retryable failure.
    RetryExhausted,
    /// The source rejected the request in a way retrying cannot fix.
    Permanent,
    /// The caller cancelled before the source finished.
    Cancelled,
    /// Records were fetched but could not be persisted.
    Storage,
    /// The worker task for the source died unexpectedly.
    Internal,
}

/// A `(source, error kind)` entry of [`IngestionResult::failed_sources`].
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedSource {
    pub source: PriceSource,
    pub kind: FailedSourceKind,
    /// Classification of the last underlying failure, when there was one.
    pub last_failure: Option<FailureKind>,
    pub message: String,
}

/// A raw record dropped by the normalizer.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SkippedRecord {
    pub source: PriceSource,
    pub reason: String,
}

/// Accounting for one `ingest` call.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestionResult {
    /// Number of distinct sources asked.
    pub requested: usize,
    /// Raw records returned by all sources that answered.
    pub received: usize,
    /// Rows inserted or refreshed by the store.
    pub stored: usize,
    pub skipped_invalid: usize,
    pub skipped: Vec<SkippedRecord>,
    pub failed_sources: Vec<FailedSource>,
}

impl IngestionResult {
    /// True when every requested source contributed.
    pub fn is_complete(&self) -> bool {
        self.failed_sources.is_empty()
    }

    /// The failure entry for `source`, if it failed.
    pub fn failed(&self, source: PriceSource) -> Option<&FailedSource> {
        self.failed_sources.iter().find(|f| f.source == source)
    }

    pub(crate) fn record_skipped(&mut self, source: PriceSource, reason: String) {
        self.skipped_invalid += 1;
        self.skipped.push(SkippedRecord { source, reason });
    }
}
