pub mod config;
pub mod coordination;
pub mod error;
pub mod gateway;

pub use config::{VictimPolicy, WardenConfig};
pub use coordination::{
    AgentId, CallContext, CoordinationEvent, CoordinationManager, EventBus, MessageRouter,
    ResourceLockManager, TaskScheduler, TaskSpec,
};
pub use error::{Result, WardenError};
pub use gateway::{CircuitState, Pinger, SafeGateway};
