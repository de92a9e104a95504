//! Circuit breaker storage.
//!
//! Storage is the authoritative record of a breaker: its state tag, the
//! consecutive-failure counter and the instant the circuit was last opened.
//! Breakers sharing one storage share their fault state.

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU32, Ordering};
use parking_lot::RwLock;
use std::sync::Arc;

use super::state::CircuitBreakerState;

/// Circuit breaker storage trait
///
/// Every operation must be atomic on its own: a reader never observes a
/// half-written tag, counter or timestamp.
#[cfg_attr(test, mockall::automock)]
pub trait BreakerStorage: Send + Sync {
    /// Get circuit breaker state
    fn state(&self) -> Result<CircuitBreakerState>;

    /// Set circuit breaker state
    fn set_state(&self, state: CircuitBreakerState) -> Result<()>;

    /// Get the number of consecutive failures
    fn counter(&self) -> Result<u32>;

    /// Increment the failure counter, returning the new value
    fn increment_counter(&self) -> Result<u32>;

    /// Reset the failure counter to zero
    fn reset_counter(&self) -> Result<()>;

    /// Get the instant the circuit was last opened
    fn opened_at(&self) -> Result<Option<DateTime<Utc>>>;

    /// Record the instant the circuit was opened
    fn set_opened_at(&self, at: DateTime<Utc>) -> Result<()>;
}

/// In-memory circuit breaker storage
///
/// Clones share the same cells, so handing clones to several breakers makes
/// them observe each other's transitions.
#[derive(Clone, Debug, Default)]
pub struct InMemoryCircuitBreakerStorage {
    state: Arc<RwLock<CircuitBreakerState>>,
    counter: Arc<AtomicU32>,
    opened_at: Arc<RwLock<Option<DateTime<Utc>>>>,
}

impl InMemoryCircuitBreakerStorage {
    /// Create a new in-memory storage in the closed state
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new in-memory storage starting in `state`
    pub fn with_state(state: CircuitBreakerState) -> Self {
        Self {
            state: Arc::new(RwLock::new(state)),
            ..Self::default()
        }
    }
}

impl BreakerStorage for InMemoryCircuitBreakerStorage {
    fn state(&self) -> Result<CircuitBreakerState> {
        Ok(*self.state.read())
    }

    fn set_state(&self, state: CircuitBreakerState) -> Result<()> {
        *self.state.write() = state;
        Ok(())
    }

    fn counter(&self) -> Result<u32> {
        Ok(self.counter.load(Ordering::SeqCst))
    }

    fn increment_counter(&self) -> Result<u32> {
        let previous = self
            .counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
                Some(count.saturating_add(1))
            })
            .unwrap_or_else(|count| count);
        Ok(previous.saturating_add(1))
    }

    fn reset_counter(&self) -> Result<()> {
        self.counter.store(0, Ordering::SeqCst);
        Ok(())
    }

    fn opened_at(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(*self.opened_at.read())
    }

    fn set_opened_at(&self, at: DateTime<Utc>) -> Result<()> {
        *self.opened_at.write() = Some(at);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_closed_with_zero_counter() -> Result<()> {
        let storage = InMemoryCircuitBreakerStorage::new();
        assert_eq!(storage.state()?, CircuitBreakerState::Closed);
        assert_eq!(storage.counter()?, 0);
        assert_eq!(storage.opened_at()?, None);
        Ok(())
    }

    #[test]
    fn counter_increments_and_resets() -> Result<()> {
        let storage = InMemoryCircuitBreakerStorage::new();
        assert_eq!(storage.increment_counter()?, 1);
        assert_eq!(storage.increment_counter()?, 2);
        assert_eq!(storage.counter()?, 2);

        storage.reset_counter()?;
        assert_eq!(storage.counter()?, 0);
        Ok(())
    }

    #[test]
    fn clones_share_cells() -> Result<()> {
        let storage = InMemoryCircuitBreakerStorage::with_state(CircuitBreakerState::HalfOpen);
        let sibling = storage.clone();
        let now = Utc::now();

        sibling.set_state(CircuitBreakerState::Open)?;
        sibling.set_opened_at(now)?;
        sibling.increment_counter()?;

        assert_eq!(storage.state()?, CircuitBreakerState::Open);
        assert_eq!(storage.opened_at()?, Some(now));
        assert_eq!(storage.counter()?, 1);
        Ok(())
    }
}
