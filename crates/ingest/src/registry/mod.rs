//! Per-source resilience.
//!
//! This module provides the building blocks the pipeline composes around
//! every source call:
//! - Rate limiting per source
//! - Circuit breaking for fault isolation
//! - Retrying with capped exponential backoff
//! - A registry holding one instance of each per source

mod circuit_breaker;
mod rate_limiter;
mod registry;
mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot, CircuitState};
pub use rate_limiter::{Admission, RateLimiter};
pub use registry::{SourceEntry, SourceHealth, SourceRegistry};
pub use retry::{RetryExecutor, RetryPolicy};
