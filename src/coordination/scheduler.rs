//! Task scheduler collaborator contract.
//!
//! The coordinator does not own task lifecycle; it delegates to a scheduler
//! implemented by the hosting system. Deadlock resolution calls back into
//! `reschedule_agent_tasks` when a victim's work has to be resubmitted.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

use super::types::{AgentId, ComponentHealth};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: String,
    pub description: String,
    pub priority: i32,
    #[serde(default)]
    pub payload: Value,
}

impl TaskSpec {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            priority: 0,
            payload: Value::Null,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}

#[async_trait]
pub trait TaskScheduler: Send + Sync {
    async fn assign_task(&self, task: TaskSpec, agent: &AgentId) -> Result<()>;

    async fn cancel_task(&self, task_id: &str, reason: &str) -> Result<()>;

    async fn complete_task(&self, task_id: &str, result: Value) -> Result<()>;

    async fn fail_task(&self, task_id: &str, error: &str) -> Result<()>;

    /// Resubmit everything the agent was running. Returns how many tasks
    /// were rescheduled.
    async fn reschedule_agent_tasks(&self, agent: &AgentId) -> Result<usize>;

    /// Cancel everything the agent was running. Returns how many tasks were
    /// cancelled.
    async fn cancel_agent_tasks(&self, agent: &AgentId, reason: &str) -> Result<usize>;

    async fn agent_task_count(&self, agent: &AgentId) -> usize;

    async fn agent_tasks(&self, agent: &AgentId) -> Vec<TaskSpec>;

    async fn health_status(&self) -> Result<ComponentHealth>;
}
