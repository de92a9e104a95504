//! Circuit breaker states.
//!
//! A breaker is always in exactly one of three states. Each state is a small
//! immutable value; a transition builds a new value instead of mutating the
//! old one, so listeners always see a `(previous, new)` pair.
//!
//! # State Transitions
//! ```text
//! Closed → Open: consecutive failures >= fail_max
//! Open → Half-Open: first call attempt after the timeout elapsed
//! Half-Open → Closed: trial call succeeds
//! Half-Open → Open: trial call fails
//! ```

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::storage::BreakerStorage;

/// Tag identifying a circuit breaker state, as persisted in storage
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum CircuitBreakerState {
    /// Normal operation, calls pass through and failures are counted
    #[default]
    Closed,
    /// Calls are rejected until the timeout elapses
    Open,
    /// A single trial call decides the next state
    HalfOpen,
}

impl std::fmt::Display for CircuitBreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitBreakerState::Closed => write!(f, "closed"),
            CircuitBreakerState::Open => write!(f, "open"),
            CircuitBreakerState::HalfOpen => write!(f, "half-open"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClosedState;

/// Open state, remembering when the circuit was opened
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OpenState {
    opened_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HalfOpenState;

impl OpenState {
    pub fn new(opened_at: DateTime<Utc>) -> Self {
        Self { opened_at }
    }

    /// Instant the circuit was opened
    pub fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    /// Time left before a trial call is permitted, zero once the timeout elapsed
    pub fn remaining(&self, timeout: Duration, now: DateTime<Utc>) -> Duration {
        // A clock that moved backwards counts as no time elapsed.
        let elapsed = (now - self.opened_at).to_std().unwrap_or(Duration::ZERO);
        timeout.saturating_sub(elapsed)
    }

    fn admit(&self, timeout: Duration, now: DateTime<Utc>) -> Admission {
        let remaining = self.remaining(timeout, now);
        if remaining.is_zero() {
            return Admission::Trial;
        }

        let reopens_at = chrono::Duration::from_std(remaining)
            .ok()
            .and_then(|delta| now.checked_add_signed(delta))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Admission::Reject { remaining, reopens_at }
    }
}

/// Decision taken before a protected call runs
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Admission {
    /// Run the call under the current state
    Proceed,
    /// Timeout elapsed: move to half-open, then run the call as its trial
    Trial,
    /// Reject without running the call
    Reject {
        remaining: Duration,
        reopens_at: DateTime<Utc>,
    },
}

/// Current state of a circuit breaker
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Closed(ClosedState),
    Open(OpenState),
    HalfOpen(HalfOpenState),
}

impl State {
    /// Tag of this state
    pub fn tag(&self) -> CircuitBreakerState {
        match self {
            State::Closed(_) => CircuitBreakerState::Closed,
            State::Open(_) => CircuitBreakerState::Open,
            State::HalfOpen(_) => CircuitBreakerState::HalfOpen,
        }
    }

    /// Instant the circuit was opened, for the open state
    pub fn opened_at(&self) -> Option<DateTime<Utc>> {
        match self {
            State::Open(open) => Some(open.opened_at()),
            _ => None,
        }
    }

    /// Build the state value matching what storage currently holds.
    ///
    /// An open record without an opened-at instant is stamped with the
    /// current time so the timeout has a starting point.
    pub(crate) fn load(storage: &dyn BreakerStorage) -> Result<Self> {
        Ok(match storage.state()? {
            CircuitBreakerState::Closed => State::Closed(ClosedState),
            CircuitBreakerState::HalfOpen => State::HalfOpen(HalfOpenState),
            CircuitBreakerState::Open => {
                let opened_at = match storage.opened_at()? {
                    Some(at) => at,
                    None => {
                        let now = Utc::now();
                        storage.set_opened_at(now)?;
                        now
                    }
                };
                State::Open(OpenState::new(opened_at))
            }
        })
    }

    /// Write the entry bookkeeping of `target` to storage and build its value.
    ///
    /// Entering closed resets the counter, entering open records `now` as the
    /// opened-at instant. The tag is written last so readers sharing the
    /// storage never observe a new tag with stale bookkeeping.
    pub(crate) fn enter(
        target: CircuitBreakerState,
        storage: &dyn BreakerStorage,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let next = match target {
            CircuitBreakerState::Closed => {
                storage.reset_counter()?;
                State::Closed(ClosedState)
            }
            CircuitBreakerState::Open => {
                storage.set_opened_at(now)?;
                State::Open(OpenState::new(now))
            }
            CircuitBreakerState::HalfOpen => State::HalfOpen(HalfOpenState),
        };
        storage.set_state(target)?;
        Ok(next)
    }

    pub(crate) fn admit(&self, timeout: Duration, now: DateTime<Utc>) -> Admission {
        match self {
            State::Open(open) => open.admit(timeout, now),
            State::Closed(_) | State::HalfOpen(_) => Admission::Proceed,
        }
    }

    /// Account for a successful call; returns the state to move to, if any
    pub(crate) fn record_success(
        &self,
        storage: &dyn BreakerStorage,
    ) -> Result<Option<CircuitBreakerState>> {
        match self {
            State::Closed(_) => {
                storage.reset_counter()?;
                Ok(None)
            }
            State::HalfOpen(_) => {
                storage.reset_counter()?;
                Ok(Some(CircuitBreakerState::Closed))
            }
            // Opened while the call ran; the open timer stands.
            State::Open(_) => Ok(None),
        }
    }

    /// Account for a counted failure; returns the state to move to, if any
    pub(crate) fn record_failure(
        &self,
        storage: &dyn BreakerStorage,
        fail_max: u32,
    ) -> Result<Option<CircuitBreakerState>> {
        match self {
            State::Closed(_) => {
                let failures = storage.increment_counter()?;
                Ok((failures >= fail_max).then_some(CircuitBreakerState::Open))
            }
            State::HalfOpen(_) => Ok(Some(CircuitBreakerState::Open)),
            State::Open(_) => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::storage::InMemoryCircuitBreakerStorage;

    #[test]
    fn display_uses_lowercase_names() {
        assert_eq!(CircuitBreakerState::Closed.to_string(), "closed");
        assert_eq!(CircuitBreakerState::Open.to_string(), "open");
        assert_eq!(CircuitBreakerState::HalfOpen.to_string(), "half-open");
    }

    #[test]
    fn open_rejects_until_timeout_then_allows_trial() {
        let opened_at = Utc::now();
        let state = State::Open(OpenState::new(opened_at));
        let timeout = Duration::from_secs(10);

        match state.admit(timeout, opened_at + chrono::Duration::seconds(4)) {
            Admission::Reject { remaining, reopens_at } => {
                assert_eq!(remaining, Duration::from_secs(6));
                assert_eq!(reopens_at, opened_at + chrono::Duration::seconds(10));
            }
            other => panic!("expected rejection, got {:?}", other),
        }

        assert_eq!(
            state.admit(timeout, opened_at + chrono::Duration::seconds(10)),
            Admission::Trial
        );
        assert_eq!(
            state.admit(timeout, opened_at + chrono::Duration::seconds(60)),
            Admission::Trial
        );
    }

    #[test]
    fn clock_going_backwards_keeps_full_timeout() {
        let opened_at = Utc::now();
        let open = OpenState::new(opened_at);
        let earlier = opened_at - chrono::Duration::seconds(5);
        assert_eq!(open.remaining(Duration::from_secs(10), earlier), Duration::from_secs(10));
    }

    #[test]
    fn closed_and_half_open_always_proceed() {
        let now = Utc::now();
        assert_eq!(State::Closed(ClosedState).admit(Duration::ZERO, now), Admission::Proceed);
        assert_eq!(
            State::HalfOpen(HalfOpenState).admit(Duration::from_secs(60), now),
            Admission::Proceed
        );
    }

    #[test]
    fn entering_states_writes_storage() -> Result<()> {
        let storage = InMemoryCircuitBreakerStorage::new();
        storage.increment_counter()?;
        let now = Utc::now();

        let open = State::enter(CircuitBreakerState::Open, &storage, now)?;
        assert_eq!(open.opened_at(), Some(now));
        assert_eq!(storage.state()?, CircuitBreakerState::Open);
        assert_eq!(storage.opened_at()?, Some(now));

        State::enter(CircuitBreakerState::HalfOpen, &storage, now)?;
        assert_eq!(storage.state()?, CircuitBreakerState::HalfOpen);
        assert_eq!(storage.counter()?, 1);

        State::enter(CircuitBreakerState::Closed, &storage, now)?;
        assert_eq!(storage.state()?, CircuitBreakerState::Closed);
        assert_eq!(storage.counter()?, 0);
        Ok(())
    }

    #[test]
    fn loading_open_without_timestamp_stamps_now() -> Result<()> {
        let storage = InMemoryCircuitBreakerStorage::with_state(CircuitBreakerState::Open);
        let before = Utc::now();

        let state = State::load(&storage)?;

        let opened_at = state.opened_at().expect("open state carries a timestamp");
        assert!(opened_at >= before);
        assert_eq!(storage.opened_at()?, Some(opened_at));
        Ok(())
    }

    #[test]
    fn closed_failures_trip_at_threshold() -> Result<()> {
        let storage = InMemoryCircuitBreakerStorage::new();
        let closed = State::Closed(ClosedState);

        assert_eq!(closed.record_failure(&storage, 2)?, None);
        assert_eq!(closed.record_failure(&storage, 2)?, Some(CircuitBreakerState::Open));
        assert_eq!(closed.record_success(&storage)?, None);
        assert_eq!(storage.counter()?, 0);
        Ok(())
    }

    #[test]
    fn half_open_resolves_on_first_outcome() -> Result<()> {
        let storage = InMemoryCircuitBreakerStorage::new();
        let half_open = State::HalfOpen(HalfOpenState);

        assert_eq!(half_open.record_success(&storage)?, Some(CircuitBreakerState::Closed));
        assert_eq!(half_open.record_failure(&storage, 5)?, Some(CircuitBreakerState::Open));
        assert_eq!(storage.counter()?, 0);
        Ok(())
    }

    #[test]
    fn outcomes_settled_while_open_leave_storage_alone() -> Result<()> {
        let storage = InMemoryCircuitBreakerStorage::new();
        storage.increment_counter()?;
        let open = State::Open(OpenState::new(Utc::now()));

        assert_eq!(open.record_success(&storage)?, None);
        assert_eq!(open.record_failure(&storage, 1)?, None);
        assert_eq!(storage.counter()?, 1);
        Ok(())
    }
}
