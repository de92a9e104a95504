//! Errors returned by the circuit breaker.

use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

/// Fault raised while reading or updating breaker state
#[derive(Debug, Error)]
pub enum StateError {
    /// The storage backend failed; accounting stops at the failed operation
    #[error("circuit breaker storage failed: {0:#}")]
    Storage(anyhow::Error),
    /// A listener rejected a notification
    #[error("circuit breaker listener failed: {0:#}")]
    Listener(anyhow::Error),
}

/// Error returned by a call routed through a circuit breaker
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    /// The circuit is open and the call was not attempted
    #[error(
        "circuit breaker {} is open, next trial call permitted in {:?}",
        .name.as_deref().unwrap_or("(unnamed)"),
        .remaining
    )]
    Open {
        name: Option<String>,
        remaining: Duration,
        reopens_at: DateTime<Utc>,
    },
    /// The protected function failed; the error is passed through untouched
    #[error(transparent)]
    Inner(E),
    /// Breaker bookkeeping failed
    #[error(transparent)]
    State(#[from] StateError),
}

impl<E> BreakerError<E> {
    /// Whether the call was rejected because the circuit is open
    pub fn is_open(&self) -> bool {
        matches!(self, BreakerError::Open { .. })
    }

    /// Time left before a trial call is permitted, for open-circuit errors
    pub fn remaining(&self) -> Option<Duration> {
        match self {
            BreakerError::Open { remaining, .. } => Some(*remaining),
            _ => None,
        }
    }

    /// The protected function's own error, if that is what failed
    pub fn inner(&self) -> Option<&E> {
        match self {
            BreakerError::Inner(err) => Some(err),
            _ => None,
        }
    }

    pub fn into_inner(self) -> Option<E> {
        match self {
            BreakerError::Inner(err) => Some(err),
            _ => None,
        }
    }
}
