//! Configuration types and loading.
//!
//! Provides all configuration structures for warden:
//! - `WardenConfig`: Top-level configuration with validation
//! - `LockConfig`, `CoordinationConfig`: lock table and detection loop settings
//! - `ConflictConfig`, `GatewayConfig`: conflict retention and outbound-call guards

mod settings;

pub use settings::{
    CircuitBreakerConfig, ConflictConfig, CoordinationConfig, GatewayConfig, HealthCheckConfig,
    LockConfig, MonitorConfig, RetryConfig, VictimPolicy, WardenConfig,
};
