//! Message router collaborator contract.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;

use super::types::{AgentId, ComponentHealth};

#[async_trait]
pub trait MessageRouter: Send + Sync {
    async fn send(&self, from: &AgentId, to: &AgentId, message: Value) -> Result<()>;

    async fn health_status(&self) -> Result<ComponentHealth>;
}
