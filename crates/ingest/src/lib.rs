//! Cardprice Ingest - resilient price ingestion from external providers.
//!
//! This crate fetches trading-card prices from third-party sources and turns
//! them into validated, deduplicated records. Every source call runs behind a
//! per-source rate limiter, circuit breaker, retry executor and deadline, so
//! one misbehaving provider never takes the others down with it.
//!
//! Persistence is abstracted behind [`PriceStore`]; the `storage-sqlite`
//! crate provides the production implementation.

pub mod config;
pub mod errors;
pub mod models;
pub mod normalizer;
pub mod pipeline;
pub mod provider;
pub mod registry;
pub mod store;

pub use config::{ConfigError, IngestConfig, ServiceEndpointConfig};
pub use errors::{classify, Classification, FailureKind, IngestError, Result, SourceFailure};
pub use models::{
    CardRef, Condition, FailedSource, FailedSourceKind, IngestionResult, PriceKey, PriceQuery,
    PriceRecord, PriceSource, RawPriceRecord, SkippedRecord,
};
pub use normalizer::{NormalizerConfig, PriceNormalizer, ValidationError};
pub use pipeline::IngestionPipeline;
pub use provider::{JustTcgClient, PriceChartingClient, SourceClient};
pub use registry::{
    CircuitBreaker, CircuitState, RateLimiter, RetryExecutor, RetryPolicy, SourceEntry,
    SourceHealth, SourceRegistry,
};
pub use store::{InMemoryPriceStore, PriceStore, StoreError};

// Re-exported for callers building cancellation into their own loops.
pub use tokio_util::sync::CancellationToken;
