//! Typed coordination event channel.
//!
//! Lock grants, releases, deadlock reports, and gateway alerts are published
//! on a bounded broadcast channel rather than callback registration, so
//! ordering and backpressure are explicit. Slow subscribers observe a skip
//! count instead of stalling publishers.

use tokio::sync::broadcast;
use tracing::debug;

use super::types::{AgentId, CallContext};

const DEFAULT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum CoordinationEvent {
    ResourceAcquired {
        resource: String,
        agent: AgentId,
    },
    ResourceReleased {
        resource: String,
        agent: AgentId,
    },
    /// A lock was force-released by maintenance or deadlock resolution.
    ResourcePreempted {
        resource: String,
        agent: AgentId,
        reason: String,
    },
    DeadlockDetected {
        agents: Vec<AgentId>,
        resources: Vec<String>,
    },
    DeadlockResolved {
        victim: AgentId,
        released: Vec<String>,
    },
    ConflictReported {
        conflict_id: String,
        subject: String,
    },
    ConflictResolved {
        conflict_id: String,
        winner: AgentId,
    },
    /// An outbound call exceeded its hard timeout; carries the typed context
    /// used by the emergency cleanup path.
    ExternalCallTimeout {
        context: CallContext,
    },
    PerformanceAlert {
        endpoint: String,
        operation: String,
        message: String,
    },
}

pub struct EventBus {
    sender: broadcast::Sender<CoordinationEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event. Events with no subscribers are dropped silently;
    /// publishing is never an error path for the coordinator.
    pub fn publish(&self, event: CoordinationEvent) {
        let receivers = self.sender.receiver_count();
        if self.sender.send(event).is_err() {
            debug!(receivers, "Event dropped, no active subscribers");
        }
    }

    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
        }
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

pub struct EventReceiver {
    receiver: broadcast::Receiver<CoordinationEvent>,
}

impl EventReceiver {
    /// Receive the next event. Returns `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<CoordinationEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Closed) => return None,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!(skipped = n, "Event receiver lagged");
                    continue;
                }
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<CoordinationEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Empty) => return None,
                Err(broadcast::error::TryRecvError::Closed) => return None,
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            }
        }
    }
}
