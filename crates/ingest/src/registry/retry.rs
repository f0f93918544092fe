//! Retry driver with capped exponential backoff and jitter.

use std::future::Future;
use std::time::Duration;

use log::{debug, warn};
use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::config::ServiceEndpointConfig;
use crate::errors::{classify, Classification, IngestError, SourceFailure};

/// Backoff parameters for one source.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl From<&ServiceEndpointConfig> for RetryPolicy {
    fn from(config: &ServiceEndpointConfig) -> Self {
        Self {
            max_attempts: config.max_retry_attempts,
            initial_backoff: config.initial_backoff,
            max_backoff: config.max_backoff,
            multiplier: config.backoff_multiplier,
        }
    }
}

impl RetryPolicy {
    /// Delay after failed attempt `attempt` (1-based), before jitter:
    /// `min(initial * multiplier^(attempt-1), max_backoff)`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exponent);

        if !secs.is_finite() || secs >= self.max_backoff.as_secs_f64() {
            self.max_backoff
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Sleep before the next attempt.
    ///
    /// A server-provided hint is used verbatim (capped at `max_backoff`);
    /// otherwise the base delay is scaled by a uniform factor in `[0.5, 1.0]`.
    pub fn delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        match retry_after {
            Some(hint) => hint.min(self.max_backoff),
            None => {
                let jitter = rand::thread_rng().gen_range(0.5..=1.0);
                self.base_delay(attempt).mul_f64(jitter)
            }
        }
    }
}

/// Drives repeated attempts of one operation.
pub struct RetryExecutor {
    policy: RetryPolicy,
    classifier: fn(&SourceFailure) -> Classification,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            classifier: classify,
        }
    }

    /// Replace the failure classifier.
    pub fn with_classifier(mut self, classifier: fn(&SourceFailure) -> Classification) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `operation` until it succeeds, fails permanently, or runs out of attempts.
    ///
    /// `operation` receives the 1-based attempt number. Only
    /// `IngestError::Source` failures are classified and possibly retried;
    /// any other error (an open circuit, cancellation) is returned as is.
    ///
    /// # Errors
    ///
    /// - `Permanent` on the first permanent failure, without further attempts
    /// - `RetryExhausted` wrapping the last failure once `max_attempts` is reached
    /// - `Cancelled` if the token fires during an attempt or a backoff sleep
    pub async fn execute<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> Result<T, IngestError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, IngestError>>,
    {
        let mut attempt = 1;

        loop {
            if cancel.is_cancelled() {
                return Err(IngestError::Cancelled);
            }

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(IngestError::Cancelled),
                outcome = operation(attempt) => outcome,
            };

            let failure = match outcome {
                Ok(value) => return Ok(value),
                Err(IngestError::Source(failure)) => failure,
                Err(other) => return Err(other),
            };

            let classification = (self.classifier)(&failure);
            if !classification.kind.is_retryable() {
                debug!("Retry: attempt {} failed permanently: {}", attempt, failure);
                return Err(IngestError::Permanent(failure));
            }

            if attempt >= self.policy.max_attempts {
                warn!(
                    "Retry: giving up after {} attempt(s), last failure: {}",
                    attempt, failure
                );
                return Err(IngestError::RetryExhausted {
                    attempts: attempt,
                    kind: classification.kind,
                    last: failure,
                });
            }

            let delay = self.policy.delay(attempt, classification.retry_after);
            debug!(
                "Retry: attempt {}/{} failed ({}: {}), retrying in {:?}",
                attempt, self.policy.max_attempts, classification.kind, failure, delay
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(IngestError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }
}
