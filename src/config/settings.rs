use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::coordination::conflict::ResolutionStrategy;
use crate::error::{Result, WardenError};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WardenConfig {
    pub locks: LockConfig,
    pub coordination: CoordinationConfig,
    pub conflicts: ConflictConfig,
    pub gateway: GatewayConfig,
}

impl WardenConfig {
    pub async fn load(config_dir: &Path) -> Result<Self> {
        let config_path = config_dir.join("warden.toml");
        let config = if config_path.exists() {
            let content = fs::read_to_string(&config_path).await?;
            toml::from_str(&content)?
        } else {
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub async fn save(&self, config_dir: &Path) -> Result<()> {
        self.validate()?;
        let config_path = config_dir.join("warden.toml");
        let content =
            toml::to_string_pretty(self).map_err(|e| WardenError::Config(e.to_string()))?;
        fs::write(&config_path, content).await?;
        Ok(())
    }

    /// Validate configuration values for consistency and safety.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.locks.resource_timeout_ms == 0 {
            errors.push("locks.resource_timeout_ms must be greater than 0");
        }
        if self.locks.stale_lock_factor < 1 {
            errors.push("locks.stale_lock_factor must be at least 1");
        }
        if self.locks.maintenance_interval_secs == 0 {
            errors.push("locks.maintenance_interval_secs must be greater than 0");
        }

        if self.coordination.detection_interval_secs == 0 {
            errors.push("coordination.detection_interval_secs must be greater than 0");
        }
        if self.coordination.event_capacity == 0 {
            errors.push("coordination.event_capacity must be greater than 0");
        }

        if self.conflicts.retention_hours == 0 {
            errors.push("conflicts.retention_hours must be greater than 0");
        }

        if self.gateway.call_timeout_ms == 0 {
            errors.push("gateway.call_timeout_ms must be greater than 0");
        }
        if self.gateway.breaker.failure_threshold == 0 {
            errors.push("gateway.breaker.failure_threshold must be greater than 0");
        }
        if self.gateway.breaker.recovery_timeout_ms == 0 {
            errors.push("gateway.breaker.recovery_timeout_ms must be greater than 0");
        }
        if self.gateway.retry.max_attempts == 0 {
            errors.push("gateway.retry.max_attempts must be greater than 0");
        }
        if self.gateway.retry.multiplier < 1.0 {
            errors.push("gateway.retry.multiplier must be at least 1.0");
        }
        if self.gateway.retry.max_delay_ms < self.gateway.retry.initial_delay_ms {
            errors.push("gateway.retry.max_delay_ms must not be below initial_delay_ms");
        }
        if self.gateway.health.check_interval_secs == 0 {
            errors.push("gateway.health.check_interval_secs must be greater than 0");
        }
        if self.gateway.monitor.window_size == 0 {
            errors.push("gateway.monitor.window_size must be greater than 0");
        }
        if !(0.0..=1.0).contains(&self.gateway.monitor.min_success_rate) {
            errors.push("gateway.monitor.min_success_rate must be between 0.0 and 1.0");
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(WardenError::Config(errors.join("; ")))
        }
    }
}

/// Lock table settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// How long an acquire may wait in queue before failing.
    pub resource_timeout_ms: u64,
    /// A lock held longer than `stale_lock_factor * resource_timeout` is
    /// assumed abandoned and force-released by maintenance.
    pub stale_lock_factor: u32,
    pub maintenance_interval_secs: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            resource_timeout_ms: 30_000,
            stale_lock_factor: 2,
            maintenance_interval_secs: 30,
        }
    }
}

impl LockConfig {
    pub fn resource_timeout(&self) -> Duration {
        Duration::from_millis(self.resource_timeout_ms)
    }

    pub fn stale_lock_age(&self) -> Duration {
        Duration::from_millis(self.resource_timeout_ms * u64::from(self.stale_lock_factor))
    }
}

/// Which agent loses its resources when a deadlock cycle must be broken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VictimPolicy {
    /// First agent encountered in the detected cycle.
    #[default]
    FirstInCycle,
    /// The cycle participant holding the fewest resources.
    FewestResourcesHeld,
    /// The cycle participant whose waiting request has the lowest priority.
    LowestPriority,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationConfig {
    pub detection_interval_secs: u64,
    pub victim_policy: VictimPolicy,
    /// Capacity of the broadcast event channel.
    pub event_capacity: usize,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            detection_interval_secs: 10,
            victim_policy: VictimPolicy::FirstInCycle,
            event_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConflictConfig {
    pub default_strategy: ResolutionStrategy,
    /// Unresolved conflicts older than this are purged by the sweep.
    pub retention_hours: u64,
}

impl Default for ConflictConfig {
    fn default() -> Self {
        Self {
            default_strategy: ResolutionStrategy::Priority,
            retention_hours: 24,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub call_timeout_ms: u64,
    pub breaker: CircuitBreakerConfig,
    pub retry: RetryConfig,
    pub health: HealthCheckConfig,
    pub monitor: MonitorConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: 10_000,
            breaker: CircuitBreakerConfig::default(),
            retry: RetryConfig::default(),
            health: HealthCheckConfig::default(),
            monitor: MonitorConfig::default(),
        }
    }
}

impl GatewayConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the breaker opens.
    pub failure_threshold: u32,
    /// How long an open breaker rejects before allowing a half-open probe.
    pub recovery_timeout_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_ms: 60_000,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 100,
            multiplier: 2.0,
            max_delay_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    pub check_interval_secs: u64,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 30,
        }
    }
}

impl HealthCheckConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Rolling sample window kept per endpoint/operation.
    pub window_size: usize,
    pub max_avg_latency_ms: u64,
    pub min_success_rate: f64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            window_size: 100,
            max_avg_latency_ms: 30_000,
            min_success_rate: 0.8,
        }
    }
}
