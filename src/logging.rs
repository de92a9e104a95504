use std::sync::Once;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::resilience::CircuitBreakerState;

static INIT: Once = Once::new();

/// Initialize the logging system
///
/// Honors `RUST_LOG`, defaulting to `info`. Safe to call more than once.
pub fn init_logging() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        // Another subscriber may already be installed by the host application.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init();
    });
}

/// Log a state transition
pub fn log_transition(
    breaker: &str,
    from: CircuitBreakerState,
    to: CircuitBreakerState,
    external: bool,
) {
    if external {
        info!(
            "Circuit breaker {} adopted state {} (was {}) written by another instance",
            breaker, to, from
        );
    } else {
        info!(
            "Circuit breaker {} transitioned from {} to {}",
            breaker, from, to
        );
    }
}

/// Log a call rejected because the circuit is open
pub fn log_rejected(breaker: &str, remaining: std::time::Duration) {
    debug!(
        "Circuit breaker {} rejected call, {:?} until next trial",
        breaker, remaining
    );
}

/// Log a failure counted towards the threshold
pub fn log_counted_failure(breaker: &str, error: &dyn std::error::Error) {
    debug!("Circuit breaker {} counted failure: {}", breaker, error);
}

/// Log a failure ignored because its error type is excluded
pub fn log_excluded_failure(breaker: &str, error: &dyn std::error::Error) {
    debug!("Circuit breaker {} ignored excluded error: {}", breaker, error);
}

/// Log a listener that rejected a notification
pub fn log_listener_failure(breaker: &str, err: &anyhow::Error) {
    warn!("Listener of circuit breaker {} failed: {:#}", breaker, err);
}

/// Log a storage operation failure
pub fn log_storage_failure(breaker: &str, operation: &str, err: &anyhow::Error) {
    error!(
        "Circuit breaker {} storage failed to {}: {:#}",
        breaker, operation, err
    );
}
