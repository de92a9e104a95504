//! Storage-backed circuit breaker.
//!
//! ```
//! use std::time::Duration;
//! use tripswitch::{BreakerError, CircuitBreaker, CircuitBreakerState};
//!
//! #[derive(Debug, thiserror::Error)]
//! #[error("backend unavailable")]
//! struct BackendDown;
//!
//! let breaker = CircuitBreaker::builder()
//!     .fail_max(2)
//!     .timeout_duration(Duration::from_secs(30))
//!     .build()?;
//!
//! for _ in 0..2 {
//!     let result = breaker.call(|| Err::<(), _>(BackendDown));
//!     assert!(matches!(result, Err(BreakerError::Inner(BackendDown))));
//! }
//! assert_eq!(breaker.current_state()?, CircuitBreakerState::Open);
//!
//! let rejected = breaker.call(|| Ok::<_, BackendDown>(1)).unwrap_err();
//! assert!(rejected.is_open());
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod config;
pub mod logging;
pub mod resilience;

#[cfg(test)]
mod tests;

pub use config::BreakerConfig;
pub use resilience::{
    BreakerError, BreakerStorage, CircuitBreaker, CircuitBreakerBuilder, CircuitBreakerListener,
    CircuitBreakerState, Exclusion, InMemoryCircuitBreakerStorage, Protected, State, StateError,
};
