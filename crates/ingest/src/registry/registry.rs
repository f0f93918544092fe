//! Process-wide per-source resilience state.
//!
//! Built once at startup from configuration and shared by reference with
//! every pipeline. Each source owns its own limiter and breaker, each behind
//! its own lock, so unrelated sources never contend.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::info;

use super::circuit_breaker::{CircuitBreaker, CircuitState};
use super::rate_limiter::RateLimiter;
use super::retry::{RetryExecutor, RetryPolicy};
use crate::config::{IngestConfig, ServiceEndpointConfig};
use crate::errors::{classify, Classification, SourceFailure};
use crate::models::PriceSource;

/// Resilience state and policy for one source.
pub struct SourceEntry {
    config: ServiceEndpointConfig,
    rate_limiter: RateLimiter,
    circuit_breaker: CircuitBreaker,
    retry: RetryExecutor,
}

impl SourceEntry {
    pub fn new(config: ServiceEndpointConfig) -> Self {
        Self::with_classifier(config, classify)
    }

    /// Build an entry whose breaker and retry executor share `classifier`,
    /// so a failure that is not retried never counts against the circuit.
    pub fn with_classifier(
        config: ServiceEndpointConfig,
        classifier: fn(&SourceFailure) -> Classification,
    ) -> Self {
        Self {
            rate_limiter: RateLimiter::from_config(&config),
            circuit_breaker: CircuitBreaker::from_config(&config).with_classifier(classifier),
            retry: RetryExecutor::new(RetryPolicy::from(&config)).with_classifier(classifier),
            config,
        }
    }

    pub fn source(&self) -> PriceSource {
        self.config.name
    }

    pub fn config(&self) -> &ServiceEndpointConfig {
        &self.config
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.circuit_breaker
    }

    pub fn retry(&self) -> &RetryExecutor {
        &self.retry
    }

    pub fn health(&self) -> SourceHealth {
        let circuit = self.circuit_breaker.snapshot();
        SourceHealth {
            source: self.config.name,
            state: circuit.state,
            consecutive_failures: circuit.consecutive_failures,
            consecutive_successes: circuit.consecutive_successes,
            since_last_failure: circuit.last_failure.map(|at| at.elapsed()),
            remaining_requests: self.rate_limiter.remaining(),
        }
    }
}

/// Health snapshot of one source.
#[derive(Clone, Debug, PartialEq)]
pub struct SourceHealth {
    pub source: PriceSource,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub since_last_failure: Option<Duration>,
    /// Slots left in the current rate-limit window.
    pub remaining_requests: u32,
}

impl SourceHealth {
    pub fn is_healthy(&self) -> bool {
        self.state == CircuitState::Closed
    }
}

/// Registry of every configured source.
///
/// The map is fixed after construction; only the entries' inner state changes.
pub struct SourceRegistry {
    entries: HashMap<PriceSource, Arc<SourceEntry>>,
}

impl SourceRegistry {
    pub fn new(configs: impl IntoIterator<Item = ServiceEndpointConfig>) -> Self {
        Self::from_entries(configs.into_iter().map(SourceEntry::new))
    }

    pub fn from_config(config: &IngestConfig) -> Self {
        Self::new(config.sources.iter().cloned())
    }

    /// Build from pre-assembled entries, e.g. ones with a custom classifier.
    pub fn from_entries(entries: impl IntoIterator<Item = SourceEntry>) -> Self {
        let entries: HashMap<_, _> = entries
            .into_iter()
            .map(|entry| (entry.source(), Arc::new(entry)))
            .collect();
        info!("Source registry initialized with {} source(s)", entries.len());
        Self { entries }
    }

    pub fn get(&self, source: PriceSource) -> Option<Arc<SourceEntry>> {
        self.entries.get(&source).cloned()
    }

    pub fn contains(&self, source: PriceSource) -> bool {
        self.entries.contains_key(&source)
    }

    /// Configured sources in a stable order.
    pub fn sources(&self) -> Vec<PriceSource> {
        let mut sources: Vec<_> = self.entries.keys().copied().collect();
        sources.sort();
        sources
    }

    pub fn health(&self) -> Vec<SourceHealth> {
        self.sources()
            .into_iter()
            .filter_map(|source| self.entries.get(&source).map(|entry| entry.health()))
            .collect()
    }

    /// Close every circuit and clear every rate-limit window.
    pub fn reset_all(&self) {
        for entry in self.entries.values() {
            entry.circuit_breaker.reset();
            entry.rate_limiter.reset();
        }
        info!("Source registry: all sources reset");
    }
}
