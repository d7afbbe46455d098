//! Shared types for resource coordination.
//!
//! Foundation types used across the coordination layer: agent identification,
//! lock snapshots consumed by the deadlock detector, component health, and the
//! typed context threaded through external calls.

use std::collections::HashMap;
use std::fmt;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct AgentId(String);

impl AgentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for AgentId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for AgentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for AgentId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<AgentId> for String {
    fn from(id: AgentId) -> Self {
        id.0
    }
}

/// A granted lock, as seen by the deadlock detector.
#[derive(Debug, Clone)]
pub struct Allocation {
    pub resource: String,
    pub holder: AgentId,
    pub locked_at: Instant,
    pub locked_at_utc: DateTime<Utc>,
}

/// A queued lock request, as seen by the deadlock detector.
#[derive(Debug, Clone)]
pub struct WaitingRequest {
    pub resource: String,
    pub agent: AgentId,
    pub priority: i32,
    pub enqueued_at: Instant,
}

/// Health status levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Critical,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }

    /// The worse of two statuses.
    pub fn worst(self, other: Self) -> Self {
        self.max(other)
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Critical => "critical",
        };
        write!(f, "{s}")
    }
}

/// Health as reported by one component or collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub component: String,
    pub status: HealthStatus,
    pub metrics: HashMap<String, f64>,
    pub detail: Option<String>,
}

impl ComponentHealth {
    pub fn healthy(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            status: HealthStatus::Healthy,
            metrics: HashMap::new(),
            detail: None,
        }
    }

    pub fn critical(component: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            status: HealthStatus::Critical,
            metrics: HashMap::new(),
            detail: Some(detail.into()),
        }
    }

    pub fn with_metric(mut self, key: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(key.into(), value);
        self
    }
}

/// Aggregated health across the coordination layer and its collaborators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub components: Vec<ComponentHealth>,
    /// Metric maps merged under `component.metric` keys.
    pub metrics: HashMap<String, f64>,
    pub checked_at: DateTime<Utc>,
}

/// Typed context carried on every external call, so timeout handling never
/// probes payload shapes at runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallContext {
    pub agent: AgentId,
    pub endpoint: String,
    pub operation: String,
}

impl CallContext {
    pub fn new(
        agent: impl Into<AgentId>,
        endpoint: impl Into<String>,
        operation: impl Into<String>,
    ) -> Self {
        Self {
            agent: agent.into(),
            endpoint: endpoint.into(),
            operation: operation.into(),
        }
    }
}

/// Point-in-time coordination counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoordinationMetrics {
    pub resources_locked: usize,
    pub agents_holding: usize,
    pub requests_waiting: usize,
    pub grants_total: u64,
    pub timeouts_total: u64,
    pub cancellations_total: u64,
    pub forced_releases_total: u64,
    pub deadlocks_detected: u64,
    pub deadlocks_resolved: u64,
    pub conflicts_open: usize,
    pub conflicts_resolved: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_id_round_trip() {
        let id = AgentId::new("coder-1");
        assert_eq!(id.as_str(), "coder-1");
        assert_eq!(String::from(id.clone()), "coder-1");
        assert_eq!(AgentId::from("coder-1"), id);
    }

    #[test]
    fn test_health_status_worst() {
        assert_eq!(
            HealthStatus::Healthy.worst(HealthStatus::Degraded),
            HealthStatus::Degraded
        );
        assert_eq!(
            HealthStatus::Critical.worst(HealthStatus::Healthy),
            HealthStatus::Critical
        );
    }

    #[test]
    fn test_component_health_builder() {
        let health = ComponentHealth::healthy("scheduler").with_metric("tasks", 3.0);
        assert!(health.status.is_healthy());
        assert_eq!(health.metrics.get("tasks"), Some(&3.0));
    }
}
