//! Per-endpoint circuit breakers.
//!
//! A breaker trips open after `failure_threshold` consecutive failures and
//! rejects calls without invoking the endpoint until `recovery_timeout`
//! elapses. The first check after that window flips to half-open and lets a
//! single probe through; its outcome decides between closed and open.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::CircuitBreakerConfig;
use crate::error::{Result, WardenError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerEntry {
    state: CircuitState,
    failure_count: u32,
    opened_at: Option<Instant>,
    last_failure: Option<Instant>,
}

impl Default for BreakerEntry {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            opened_at: None,
            last_failure: None,
        }
    }
}

pub struct CircuitBreaker {
    endpoints: DashMap<String, BreakerEntry>,
    failure_threshold: u32,
    recovery_timeout: Duration,
}

impl CircuitBreaker {
    pub fn new(config: &CircuitBreakerConfig) -> Self {
        Self {
            endpoints: DashMap::new(),
            failure_threshold: config.failure_threshold,
            recovery_timeout: config.recovery_timeout(),
        }
    }

    /// Whether a call to the endpoint may proceed right now. Handles the
    /// open-to-half-open transition; while half-open, exactly the call that
    /// performed the transition is in flight and everyone else is rejected.
    pub fn check(&self, endpoint: &str) -> Result<()> {
        let mut entry = self.endpoints.entry(endpoint.to_string()).or_default();
        match entry.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let elapsed = entry
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.recovery_timeout {
                    entry.state = CircuitState::HalfOpen;
                    debug!(endpoint, "Circuit half-open, probing");
                    Ok(())
                } else {
                    let retry_in = self.recovery_timeout.saturating_sub(elapsed);
                    Err(WardenError::CircuitOpen {
                        endpoint: endpoint.to_string(),
                        retry_in_ms: retry_in.as_millis() as u64,
                    })
                }
            }
            CircuitState::HalfOpen => Err(WardenError::CircuitOpen {
                endpoint: endpoint.to_string(),
                retry_in_ms: self.recovery_timeout.as_millis() as u64,
            }),
        }
    }

    pub fn record_success(&self, endpoint: &str) {
        let mut entry = self.endpoints.entry(endpoint.to_string()).or_default();
        if entry.state != CircuitState::Closed {
            debug!(endpoint, "Circuit closed after successful probe");
        }
        entry.state = CircuitState::Closed;
        entry.failure_count = 0;
        entry.opened_at = None;
    }

    pub fn record_failure(&self, endpoint: &str) {
        let mut entry = self.endpoints.entry(endpoint.to_string()).or_default();
        entry.failure_count += 1;
        entry.last_failure = Some(Instant::now());

        let should_open = entry.state == CircuitState::HalfOpen
            || (entry.state == CircuitState::Closed
                && entry.failure_count >= self.failure_threshold);
        if should_open {
            entry.state = CircuitState::Open;
            entry.opened_at = Some(Instant::now());
            warn!(
                endpoint,
                failures = entry.failure_count,
                "Circuit opened"
            );
        }
    }

    pub fn state(&self, endpoint: &str) -> CircuitState {
        self.endpoints
            .get(endpoint)
            .map(|e| e.state)
            .unwrap_or(CircuitState::Closed)
    }

    pub fn failure_count(&self, endpoint: &str) -> u32 {
        self.endpoints
            .get(endpoint)
            .map(|e| e.failure_count)
            .unwrap_or(0)
    }
}
