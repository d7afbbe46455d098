//! Resource coordination: locks, deadlock detection, and conflict resolution.

pub mod conflict;
pub mod events;
pub mod lock_manager;
pub mod manager;
pub mod router;
pub mod scheduler;
pub mod types;
pub mod wait_graph;

pub use conflict::{
    Claim, Conflict, ConflictKind, ConflictResolver, Resolution, ResolutionStrategy,
};
pub use events::{CoordinationEvent, EventBus, EventReceiver};
pub use lock_manager::{MaintenanceReport, ResourceLockManager};
pub use manager::CoordinationManager;
pub use router::MessageRouter;
pub use scheduler::{TaskScheduler, TaskSpec};
pub use types::{
    AgentId, Allocation, CallContext, ComponentHealth, CoordinationMetrics, HealthReport,
    HealthStatus, WaitingRequest,
};
pub use wait_graph::{DeadlockCycle, WaitForGraph};
