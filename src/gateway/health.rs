//! Connection health checks for external endpoints.
//!
//! Each endpoint is probed through a [`Pinger`] on a check window. A failed
//! probe marks the endpoint unhealthy and short-circuits calls until the next
//! window re-probes it.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use tracing::{debug, warn};

use crate::config::HealthCheckConfig;
use crate::error::{Result, WardenError};

/// Probe seam implemented by the hosting system (an HTTP HEAD, a protocol
/// handshake, whatever "is this endpoint alive" means for the transport).
#[async_trait]
pub trait Pinger: Send + Sync {
    async fn ping(&self, endpoint: &str) -> Result<()>;
}

#[derive(Debug, Clone, Copy)]
struct EndpointHealth {
    healthy: bool,
    last_check: Option<Instant>,
    consecutive_failures: u32,
}

impl Default for EndpointHealth {
    fn default() -> Self {
        Self {
            healthy: true,
            last_check: None,
            consecutive_failures: 0,
        }
    }
}

pub struct ConnectionHealthMonitor {
    pinger: Arc<dyn Pinger>,
    endpoints: DashMap<String, EndpointHealth>,
    check_interval: std::time::Duration,
}

impl ConnectionHealthMonitor {
    pub fn new(config: &HealthCheckConfig, pinger: Arc<dyn Pinger>) -> Self {
        Self {
            pinger,
            endpoints: DashMap::new(),
            check_interval: config.check_interval(),
        }
    }

    /// Register an endpoint for periodic checks. Unseen endpoints are
    /// assumed healthy until the first probe says otherwise.
    pub fn register(&self, endpoint: &str) {
        self.endpoints
            .entry(endpoint.to_string())
            .or_default();
    }

    pub fn is_healthy(&self, endpoint: &str) -> bool {
        self.endpoints
            .get(endpoint)
            .map(|e| e.healthy)
            .unwrap_or(true)
    }

    fn check_due(&self, endpoint: &str) -> bool {
        self.endpoints
            .get(endpoint)
            .and_then(|e| e.last_check)
            .map(|at| at.elapsed() >= self.check_interval)
            .unwrap_or(true)
    }

    /// Probe one endpoint now and record the outcome.
    pub async fn check_endpoint(&self, endpoint: &str) -> bool {
        let healthy = match self.pinger.ping(endpoint).await {
            Ok(()) => true,
            Err(e) => {
                warn!(endpoint, error = %e, "Health probe failed");
                false
            }
        };

        let mut entry = self.endpoints.entry(endpoint.to_string()).or_default();
        entry.last_check = Some(Instant::now());
        if healthy {
            if !entry.healthy {
                debug!(endpoint, "Endpoint recovered");
            }
            entry.healthy = true;
            entry.consecutive_failures = 0;
        } else {
            entry.healthy = false;
            entry.consecutive_failures += 1;
        }
        healthy
    }

    /// Probe every endpoint whose check window elapsed, concurrently.
    /// Returns the number of unhealthy endpoints afterwards.
    pub async fn run_checks(&self) -> usize {
        let due: Vec<String> = self
            .endpoints
            .iter()
            .filter(|entry| {
                entry
                    .last_check
                    .map(|at| at.elapsed() >= self.check_interval)
                    .unwrap_or(true)
            })
            .map(|entry| entry.key().clone())
            .collect();

        join_all(due.iter().map(|endpoint| self.check_endpoint(endpoint))).await;

        self.endpoints.iter().filter(|e| !e.healthy).count()
    }

    /// Gate an outbound call: healthy endpoints pass, unhealthy ones are
    /// rejected until the next window, at which point the gate re-probes
    /// inline before deciding.
    pub async fn gate(&self, endpoint: &str) -> Result<()> {
        self.register(endpoint);

        if self.is_healthy(endpoint) {
            return Ok(());
        }
        if self.check_due(endpoint) && self.check_endpoint(endpoint).await {
            return Ok(());
        }
        Err(WardenError::EndpointUnhealthy {
            endpoint: endpoint.to_string(),
        })
    }

    pub fn consecutive_failures(&self, endpoint: &str) -> u32 {
        self.endpoints
            .get(endpoint)
            .map(|e| e.consecutive_failures)
            .unwrap_or(0)
    }
}
