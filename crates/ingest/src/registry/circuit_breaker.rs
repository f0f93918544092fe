//! Per-source circuit breaker for fault tolerance.
//!
//! Prevents hammering a source that is known to be failing. The circuit has
//! three states:
//!
//! - **Closed**: Normal operation, calls pass through and consecutive failures are counted.
//! - **Open**: The source is failing, calls are rejected without being attempted.
//! - **HalfOpen**: The recovery timeout has elapsed, at most `success_threshold`
//!   trial calls are let through at a time.
//!
//! Only failures classified `Transient` or `System` move the counters;
//! `Permanent` failures say nothing about availability and are neutral.
//! The circuit is in-memory and resets on process restart.

use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::time::Instant;

use crate::config::ServiceEndpointConfig;
use crate::errors::{classify, Classification, FailureKind, IngestError, SourceFailure};
use crate::models::PriceSource;

/// Circuit breaker state.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CircuitState {
    /// Normal operation - calls are allowed.
    Closed,
    /// Source is failing - calls are rejected.
    Open,
    /// Testing recovery - trial calls are allowed.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "Closed"),
            Self::Open => write!(f, "Open"),
            Self::HalfOpen => write!(f, "HalfOpen"),
        }
    }
}

#[derive(Debug)]
struct Circuit {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    last_failure: Option<Instant>,
    /// Trial calls admitted in the current HalfOpen period and not yet finished.
    trials_in_flight: u32,
    /// Bumped on every Open -> HalfOpen transition.
    half_open_epoch: u64,
}

impl Circuit {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_failure: None,
            trials_in_flight: 0,
            half_open_epoch: 0,
        }
    }
}

/// A HalfOpen trial slot, given back when the guarded call ends or is dropped.
struct TrialSlot<'a> {
    breaker: &'a CircuitBreaker,
    epoch: u64,
}

impl Drop for TrialSlot<'_> {
    fn drop(&mut self) {
        let mut circuit = self.breaker.lock_circuit();
        if circuit.state == CircuitState::HalfOpen && circuit.half_open_epoch == self.epoch {
            circuit.trials_in_flight = circuit.trials_in_flight.saturating_sub(1);
        }
    }
}

/// Circuit breaker thresholds.
#[derive(Clone, Debug)]
pub struct CircuitBreakerConfig {
    /// Consecutive counted failures that open the circuit.
    pub failure_threshold: u32,
    /// Time after the last failure before a trial call is allowed.
    pub recovery_timeout: Duration,
    /// Consecutive trial successes that close the circuit.
    pub success_threshold: u32,
}

impl From<&ServiceEndpointConfig> for CircuitBreakerConfig {
    fn from(config: &ServiceEndpointConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold,
            recovery_timeout: config.recovery_timeout,
            success_threshold: config.success_threshold,
        }
    }
}

/// Point-in-time view of a circuit.
#[derive(Clone, Debug, PartialEq)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub last_failure: Option<Instant>,
}

/// Circuit breaker for one source.
///
/// A single instance is shared by every concurrent caller targeting the
/// source. Every read-modify-write of the state happens under one lock.
pub struct CircuitBreaker {
    source: PriceSource,
    config: CircuitBreakerConfig,
    classifier: fn(&SourceFailure) -> Classification,
    circuit: Mutex<Circuit>,
}

impl CircuitBreaker {
    pub fn new(source: PriceSource, config: CircuitBreakerConfig) -> Self {
        Self {
            source,
            config,
            classifier: classify,
            circuit: Mutex::new(Circuit::new()),
        }
    }

    /// Replace the failure classifier deciding which failures count.
    pub fn with_classifier(mut self, classifier: fn(&SourceFailure) -> Classification) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn from_config(config: &ServiceEndpointConfig) -> Self {
        Self::new(config.name, CircuitBreakerConfig::from(config))
    }

    /// Lock the circuit mutex, recovering from poison if necessary.
    ///
    /// The worst case after a poisoned lock is a slightly stale counter,
    /// which is better than panicking a worker.
    fn lock_circuit(&self) -> MutexGuard<'_, Circuit> {
        self.circuit.lock().unwrap_or_else(|poisoned| {
            warn!("Circuit breaker mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Run `operation` once if the circuit allows it.
    ///
    /// Returns `CircuitOpen` without invoking the operation while the circuit
    /// is Open and the recovery timeout has not elapsed, or while HalfOpen
    /// already has `success_threshold` trial calls in flight. Failures come back as
    /// `IngestError::Source` after being recorded.
    pub async fn guard<T, F, Fut>(&self, operation: F) -> Result<T, IngestError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, SourceFailure>>,
    {
        let _trial = self.admit_call(true)?.map(|epoch| TrialSlot {
            breaker: self,
            epoch,
        });

        match operation().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(failure) => {
                self.record_failure((self.classifier)(&failure).kind);
                Err(IngestError::Source(failure))
            }
        }
    }

    /// Decide whether a call may proceed, moving Open -> HalfOpen once the
    /// recovery timeout has elapsed. Does not take a trial slot.
    pub fn admit(&self) -> Result<(), IngestError> {
        self.admit_call(false).map(|_| ())
    }

    /// Returns the HalfOpen epoch when a trial slot was taken.
    fn admit_call(&self, take_slot: bool) -> Result<Option<u64>, IngestError> {
        let mut circuit = self.lock_circuit();

        match circuit.state {
            CircuitState::Closed => Ok(None),
            CircuitState::HalfOpen => {
                if !take_slot {
                    return Ok(None);
                }
                if circuit.trials_in_flight >= self.config.success_threshold.max(1) {
                    debug!(
                        "Circuit breaker: rejecting call to '{}' ({} trial call(s) in flight)",
                        self.source, circuit.trials_in_flight
                    );
                    return Err(IngestError::CircuitOpen {
                        provider: self.source,
                    });
                }
                circuit.trials_in_flight += 1;
                Ok(Some(circuit.half_open_epoch))
            }
            CircuitState::Open => {
                let recovered = circuit
                    .last_failure
                    .map(|at| at.elapsed() >= self.config.recovery_timeout)
                    .unwrap_or(true);

                if recovered {
                    info!(
                        "Circuit breaker: transitioning '{}' from Open to HalfOpen",
                        self.source
                    );
                    circuit.state = CircuitState::HalfOpen;
                    circuit.consecutive_successes = 0;
                    circuit.half_open_epoch += 1;
                    if take_slot {
                        circuit.trials_in_flight = 1;
                        Ok(Some(circuit.half_open_epoch))
                    } else {
                        circuit.trials_in_flight = 0;
                        Ok(None)
                    }
                } else {
                    debug!("Circuit breaker: rejecting call to '{}' (open)", self.source);
                    Err(IngestError::CircuitOpen {
                        provider: self.source,
                    })
                }
            }
        }
    }

    /// Record a successful call.
    ///
    /// In Closed state: resets the failure count.
    /// In HalfOpen state: counts toward closing the circuit.
    pub fn record_success(&self) {
        let mut circuit = self.lock_circuit();

        match circuit.state {
            CircuitState::Closed => {
                if circuit.consecutive_failures > 0 {
                    debug!(
                        "Circuit breaker: success for '{}', failure count reset",
                        self.source
                    );
                }
                circuit.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                circuit.consecutive_successes += 1;
                debug!(
                    "Circuit breaker: success for '{}' in HalfOpen ({}/{})",
                    self.source, circuit.consecutive_successes, self.config.success_threshold
                );

                if circuit.consecutive_successes >= self.config.success_threshold {
                    info!(
                        "Circuit breaker: closing circuit for '{}' after {} successes",
                        self.source, circuit.consecutive_successes
                    );
                    *circuit = Circuit::new();
                }
            }
            CircuitState::Open => {
                // A call admitted before the circuit opened finished late
                debug!(
                    "Circuit breaker: late success for '{}' ignored (open)",
                    self.source
                );
            }
        }
    }

    /// Record a failed call of the given kind.
    ///
    /// Permanent failures leave the circuit untouched. In HalfOpen state any
    /// counted failure reopens the circuit immediately.
    pub fn record_failure(&self, kind: FailureKind) {
        if !kind.trips_circuit() {
            debug!(
                "Circuit breaker: {} failure for '{}' not counted",
                kind, self.source
            );
            return;
        }

        let mut circuit = self.lock_circuit();
        circuit.consecutive_failures += 1;
        circuit.last_failure = Some(Instant::now());

        match circuit.state {
            CircuitState::Closed => {
                if circuit.consecutive_failures >= self.config.failure_threshold {
                    info!(
                        "Circuit breaker: opening circuit for '{}' after {} failures",
                        self.source, circuit.consecutive_failures
                    );
                    circuit.state = CircuitState::Open;
                } else {
                    debug!(
                        "Circuit breaker: failure for '{}' ({}/{})",
                        self.source, circuit.consecutive_failures, self.config.failure_threshold
                    );
                }
            }
            CircuitState::HalfOpen => {
                info!(
                    "Circuit breaker: reopening circuit for '{}' after failure in HalfOpen",
                    self.source
                );
                circuit.state = CircuitState::Open;
                circuit.consecutive_successes = 0;
                circuit.trials_in_flight = 0;
            }
            CircuitState::Open => {
                debug!(
                    "Circuit breaker: additional failure for '{}' (already open)",
                    self.source
                );
            }
        }
    }

    pub fn state(&self) -> CircuitState {
        self.lock_circuit().state
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let circuit = self.lock_circuit();
        CircuitSnapshot {
            state: circuit.state,
            consecutive_failures: circuit.consecutive_failures,
            consecutive_successes: circuit.consecutive_successes,
            last_failure: circuit.last_failure,
        }
    }

    /// Force the circuit back to Closed.
    pub fn reset(&self) {
        *self.lock_circuit() = Circuit::new();
        info!(
            "Circuit breaker: manually resetting circuit for '{}'",
            self.source
        );
    }
}
