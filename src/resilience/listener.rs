//! Circuit breaker listeners.
//!
//! Listeners are notified synchronously, in registration order, from the
//! thread or task performing the triggering operation. A listener returning
//! an error stops the notification round and the error reaches the caller of
//! that operation as [`StateError::Listener`](super::StateError::Listener).

use anyhow::Result;
use std::error::Error;

use super::circuit_breaker::CircuitBreaker;
use super::state::CircuitBreakerState;

/// Hooks invoked by a circuit breaker
pub trait CircuitBreakerListener: Send + Sync {
    /// Called before the protected function of an admitted call runs
    fn before_call(&self, _breaker: &CircuitBreaker) -> Result<()> {
        Ok(())
    }

    /// Called after the protected function succeeded
    fn on_success(&self, _breaker: &CircuitBreaker) -> Result<()> {
        Ok(())
    }

    /// Called after the protected function failed with a counted error
    fn on_failure(&self, _breaker: &CircuitBreaker, _error: &(dyn Error + 'static)) -> Result<()> {
        Ok(())
    }

    /// Called on every state transition, including transitions another
    /// breaker instance made through shared storage
    fn state_change(
        &self,
        breaker: &CircuitBreaker,
        previous: CircuitBreakerState,
        new: CircuitBreakerState,
    ) -> Result<()>;
}

impl<F> CircuitBreakerListener for F
where
    F: Fn(&CircuitBreaker, CircuitBreakerState, CircuitBreakerState) -> Result<()> + Send + Sync,
{
    fn state_change(
        &self,
        breaker: &CircuitBreaker,
        previous: CircuitBreakerState,
        new: CircuitBreakerState,
    ) -> Result<()> {
        self(breaker, previous, new)
    }
}
