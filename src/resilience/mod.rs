//! Circuit breaker resilience pattern
//!
//! A circuit breaker wraps calls to an operation that may fail, counts
//! consecutive failures and, once a threshold is reached, rejects calls for
//! a timeout so the operation can recover:
//! - `state`: the Closed / Open / Half-Open state machine
//! - `storage`: the authoritative, shareable record of state and counter
//! - `circuit_breaker`: the controller coordinating calls and transitions
//! - `listener`: hooks notified on calls and transitions
//! - `exclusion`: errors that must not trip the breaker
//! - `protected`: functions permanently bound to a breaker

mod circuit_breaker;
mod error;
mod exclusion;
mod listener;
mod protected;
mod state;
mod storage;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerBuilder};

pub use error::{BreakerError, StateError};

pub use exclusion::Exclusion;

pub use listener::CircuitBreakerListener;

pub use protected::Protected;

pub use state::{CircuitBreakerState, ClosedState, HalfOpenState, OpenState, State};

pub use storage::{BreakerStorage, InMemoryCircuitBreakerStorage};

#[cfg(test)]
pub(crate) use storage::MockBreakerStorage;
