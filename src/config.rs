//! Circuit breaker configuration.

use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Circuit breaker configuration
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BreakerConfig {
    /// Number of consecutive failures before opening the circuit
    pub fail_max: u32,
    /// Time to keep the circuit open before a trial call, in milliseconds
    pub timeout_ms: u64,
    /// Name used in logs and open-circuit errors
    pub name: Option<String>,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            fail_max: 5,
            timeout_ms: 60_000,
            name: None,
        }
    }
}

impl BreakerConfig {
    /// Parse a JSON configuration, filling missing fields with defaults
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).context("invalid circuit breaker configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_fail_max(mut self, fail_max: u32) -> Self {
        self.fail_max = fail_max;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Open-state timeout as a duration
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.fail_max >= 1,
            "fail_max must be at least 1, got {}",
            self.fail_max
        );
        Ok(())
    }
}
