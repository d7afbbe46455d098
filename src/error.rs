use thiserror::Error;

#[derive(Error, Debug)]
pub enum WardenError {
    #[error("lock acquisition timed out: {resource} (agent {agent}, waited {waited_ms}ms)")]
    LockTimeout {
        resource: String,
        agent: String,
        waited_ms: u64,
    },

    #[error("lock request cancelled: {resource} (agent {agent})")]
    LockCancelled { resource: String, agent: String },

    #[error("resource already held by caller: {resource} (agent {agent})")]
    ResourceHeld { resource: String, agent: String },

    #[error("deadlock resolution failed: {0}")]
    Deadlock(String),

    #[error("coordination error: {0}")]
    Coordination(String),

    #[error("circuit open for endpoint {endpoint}, retry in {retry_in_ms}ms")]
    CircuitOpen { endpoint: String, retry_in_ms: u64 },

    #[error("endpoint unhealthy: {endpoint}")]
    EndpointUnhealthy { endpoint: String },

    #[error("call to {endpoint}/{operation} timed out after {timeout_ms}ms")]
    CallTimeout {
        endpoint: String,
        operation: String,
        timeout_ms: u64,
    },

    #[error("remote operation failed on {endpoint}: {message}")]
    Remote { endpoint: String, message: String },

    #[error("conflict resolution error: {0}")]
    Conflict(String),

    #[error("scheduler error: {0}")]
    Scheduler(String),

    #[error("router error: {0}")]
    Router(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl WardenError {
    /// Whether the caller can reasonably retry or fall back.
    ///
    /// Lock timeouts and cancellations leave the system consistent; the agent
    /// decides whether to re-request or fail its own task. Open circuits and
    /// call timeouts clear once the endpoint recovers. Lifecycle misuse and
    /// failed deadlock resolution are not retryable.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::LockTimeout { .. }
                | Self::LockCancelled { .. }
                | Self::CircuitOpen { .. }
                | Self::EndpointUnhealthy { .. }
                | Self::CallTimeout { .. }
                | Self::Remote { .. }
        )
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Coordination(_) | Self::Deadlock(_))
    }
}

pub type Result<T> = std::result::Result<T, WardenError>;
