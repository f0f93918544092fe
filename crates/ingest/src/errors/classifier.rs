//! Failure classification.
//!
//! Every failure coming back from a source is mapped to one of three kinds.
//! The retry executor uses the kind to decide whether another attempt can
//! help, and the circuit breaker uses it to decide whether the failure says
//! anything about the source's availability.
//!
//! # Precedence
//!
//! | Rule | Failure | Kind | Hint |
//! |------|---------|------|------|
//! | 1 | any response carrying `Retry-After` | `Transient` | yes |
//! | 2 | 5xx, 408, 429, timeout, connection failure | `Transient` | no |
//! | 3 | other 4xx (400, 401, 403, 404, 422, ...) | `Permanent` | no |
//! | 4 | anything else (decode errors, 1xx/3xx, unexpected shapes) | `System` | no |

use std::fmt;
use std::time::Duration;

use serde::Serialize;

use super::SourceFailure;

/// Retryability class of a failure.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Network trouble, overload or throttling. Worth retrying.
    Transient,
    /// The request itself is wrong. Retrying never helps.
    Permanent,
    /// Unclassified. Retried cautiously, then surfaced.
    System,
}

impl FailureKind {
    /// Whether the retry executor may attempt the call again.
    pub fn is_retryable(self) -> bool {
        !matches!(self, Self::Permanent)
    }

    /// Whether the failure counts toward opening the circuit.
    pub fn trips_circuit(self) -> bool {
        !matches!(self, Self::Permanent)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::Permanent => write!(f, "permanent"),
            Self::System => write!(f, "system"),
        }
    }
}

/// Outcome of [`classify`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Classification {
    pub kind: FailureKind,
    /// Server-directed delay before the next attempt.
    pub retry_after: Option<Duration>,
}

impl Classification {
    fn of(kind: FailureKind) -> Self {
        Self {
            kind,
            retry_after: None,
        }
    }
}

/// Classify a source failure. Pure; the same failure always yields the same result.
pub fn classify(failure: &SourceFailure) -> Classification {
    if let Some(hint) = failure.retry_after() {
        return Classification {
            kind: FailureKind::Transient,
            retry_after: Some(hint),
        };
    }

    match failure {
        SourceFailure::Http { status, .. } => Classification::of(classify_status(*status)),
        SourceFailure::Timeout | SourceFailure::Connection(_) => {
            Classification::of(FailureKind::Transient)
        }
        SourceFailure::Decode(_) | SourceFailure::Other(_) => {
            Classification::of(FailureKind::System)
        }
    }
}

fn classify_status(status: u16) -> FailureKind {
    match status {
        500..=599 | 408 | 429 => FailureKind::Transient,
        400..=499 => FailureKind::Permanent,
        _ => FailureKind::System,
    }
}
