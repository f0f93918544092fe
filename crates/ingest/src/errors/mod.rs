//! Error types and failure classification for the ingestion crate.
//!
//! This module provides:
//! - [`SourceFailure`]: a raw failure surfaced by one call to a price source
//! - [`classify`]: maps a [`SourceFailure`] to a [`FailureKind`] with an optional retry hint
//! - [`IngestError`]: the tagged result of a guarded, retried source call

mod classifier;

pub use classifier::{classify, Classification, FailureKind};

use std::time::Duration;

use thiserror::Error;

use crate::models::{FailedSourceKind, PriceSource};
use crate::store::StoreError;

/// Result type alias for ingestion operations.
pub type Result<T> = std::result::Result<T, IngestError>;

/// A failure returned by a single `SourceClient::fetch` call.
///
/// Carries enough shape for [`classify`] to decide retryability: an HTTP-like
/// status, an optional server-provided retry hint, or a network-level cause.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceFailure {
    /// The source answered with a non-success status.
    #[error("HTTP {status}: {message}")]
    Http {
        /// HTTP status code
        status: u16,
        /// Parsed `Retry-After` hint, if the response carried one
        retry_after: Option<Duration>,
        /// Response body excerpt or reason phrase
        message: String,
    },

    /// The call did not complete before its deadline.
    #[error("Request timed out")]
    Timeout,

    /// The connection could not be established or was reset mid-request.
    #[error("Connection failed: {0}")]
    Connection(String),

    /// The response arrived but could not be decoded.
    #[error("Malformed response: {0}")]
    Decode(String),

    /// Anything else surfaced at the client boundary.
    #[error("{0}")]
    Other(String),
}

impl SourceFailure {
    /// Build an HTTP failure without a retry hint.
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self::Http {
            status,
            retry_after: None,
            message: message.into(),
        }
    }

    /// Build an HTTP failure carrying a server-provided retry hint.
    pub fn http_with_retry_after(
        status: u16,
        retry_after: Duration,
        message: impl Into<String>,
    ) -> Self {
        Self::Http {
            status,
            retry_after: Some(retry_after),
            message: message.into(),
        }
    }

    /// HTTP status code, when the failure came from a response.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Server-provided retry hint, when present.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Http { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Errors produced while ingesting prices from a source.
///
/// Only [`IngestError::UnknownSource`], [`IngestError::InvalidQuery`] and a
/// pre-start [`IngestError::Cancelled`] ever escape `IngestionPipeline::ingest`;
/// every other variant is converted into a failed-source entry of the result.
#[derive(Error, Debug)]
pub enum IngestError {
    /// A single attempt failed. Consumed by the retry loop.
    #[error("Source failure: {0}")]
    Source(SourceFailure),

    /// The circuit breaker is open for this source.
    /// The wrapped operation was not invoked.
    #[error("Circuit open: {provider}")]
    CircuitOpen {
        /// The source with an open circuit
        provider: PriceSource,
    },

    /// Every allowed attempt failed with a retryable failure.
    #[error("Retries exhausted after {attempts} attempt(s): {last}")]
    RetryExhausted {
        /// Number of attempts performed
        attempts: u32,
        /// Classification of the last failure
        kind: FailureKind,
        /// The last underlying failure
        last: SourceFailure,
    },

    /// A failure that retrying can never fix (bad request, auth, not found).
    #[error("Permanent failure: {0}")]
    Permanent(SourceFailure),

    /// The ingestion was cancelled before this work completed.
    #[error("Ingestion cancelled")]
    Cancelled,

    /// The caller named a source that is not configured.
    #[error("Unknown source: {0}")]
    UnknownSource(String),

    /// The query cannot be sent to any source.
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// Persisting normalized records failed.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl IngestError {
    /// Kind reported in `IngestionResult::failed_sources` for this error.
    pub fn failed_kind(&self) -> FailedSourceKind {
        match self {
            Self::CircuitOpen { .. } => FailedSourceKind::CircuitOpen,
            Self::RetryExhausted { .. } => FailedSourceKind::RetryExhausted,
            Self::Permanent(_) => FailedSourceKind::Permanent,
            Self::Cancelled => FailedSourceKind::Cancelled,
            Self::Store(_) => FailedSourceKind::Storage,
            Self::Source(failure) => match classify(failure).kind {
                FailureKind::Permanent => FailedSourceKind::Permanent,
                _ => FailedSourceKind::RetryExhausted,
            },
            Self::UnknownSource(_) | Self::InvalidQuery(_) => FailedSourceKind::Internal,
        }
    }

    /// Classification of the underlying source failure, if there is one.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Self::RetryExhausted { kind, .. } => Some(*kind),
            Self::Permanent(_) => Some(FailureKind::Permanent),
            Self::Source(failure) => Some(classify(failure).kind),
            _ => None,
        }
    }
}
