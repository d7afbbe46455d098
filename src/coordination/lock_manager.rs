//! Exclusive locks on named resources with priority-ordered wait queues.
//!
//! A resource is a lazily-created, exclusively lockable name. Contended
//! acquires queue by priority (descending) then arrival (ascending) and are
//! woken by a oneshot grant resolved inside the releasing critical section,
//! so observable grant order is exactly queue order. Maintenance drops
//! over-age wait entries and force-releases stale locks.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::config::LockConfig;
use crate::error::{Result, WardenError};

use super::events::{CoordinationEvent, EventBus};
use super::types::{AgentId, Allocation, WaitingRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GrantOutcome {
    Granted,
    /// The request was removed out-of-band (maintenance sweep or shutdown).
    Cancelled,
}

struct QueuedRequest {
    agent: AgentId,
    priority: i32,
    seq: u64,
    enqueued_at: Instant,
    waker: oneshot::Sender<GrantOutcome>,
}

struct ResourceState {
    holder: AgentId,
    locked_at: Instant,
    locked_at_utc: chrono::DateTime<Utc>,
}

#[derive(Default)]
struct LockState {
    resources: HashMap<String, ResourceState>,
    queues: HashMap<String, Vec<QueuedRequest>>,
    agent_resources: HashMap<AgentId, HashSet<String>>,
    next_seq: u64,
}

impl LockState {
    fn record_grant(&mut self, resource: &str, agent: &AgentId) {
        self.resources.insert(
            resource.to_string(),
            ResourceState {
                holder: agent.clone(),
                locked_at: Instant::now(),
                locked_at_utc: Utc::now(),
            },
        );
        self.agent_resources
            .entry(agent.clone())
            .or_default()
            .insert(resource.to_string());
    }

    fn clear_holder(&mut self, resource: &str) -> Option<AgentId> {
        let state = self.resources.remove(resource)?;
        if let Some(held) = self.agent_resources.get_mut(&state.holder) {
            held.remove(resource);
            if held.is_empty() {
                self.agent_resources.remove(&state.holder);
            }
        }
        Some(state.holder)
    }
}

/// Outcome of one maintenance pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub expired_requests: usize,
    pub forced_releases: usize,
}

pub struct ResourceLockManager {
    state: Mutex<LockState>,
    events: Arc<EventBus>,
    resource_timeout: Duration,
    stale_lock_age: Duration,
    grants: AtomicU64,
    timeouts: AtomicU64,
    cancellations: AtomicU64,
    forced_releases: AtomicU64,
}

impl ResourceLockManager {
    pub fn new(config: &LockConfig, events: Arc<EventBus>) -> Self {
        Self {
            state: Mutex::new(LockState::default()),
            events,
            resource_timeout: config.resource_timeout(),
            stale_lock_age: config.stale_lock_age(),
            grants: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            cancellations: AtomicU64::new(0),
            forced_releases: AtomicU64::new(0),
        }
    }

    /// Acquire an exclusive lock, waiting in the priority queue up to the
    /// configured resource timeout.
    ///
    /// Re-entrant acquisition by the current holder is rejected outright:
    /// with exclusive locks it can never be granted and is the local form of
    /// self-deadlock.
    pub async fn acquire(&self, resource: &str, agent: &AgentId, priority: i32) -> Result<()> {
        let started = Instant::now();

        let (seq, mut rx) = {
            let mut state = self.state.lock();
            match state.resources.get(resource) {
                None => {
                    state.record_grant(resource, agent);
                    self.grants.fetch_add(1, Ordering::Relaxed);
                    debug!(resource, agent = %agent, priority, "Lock granted immediately");
                    self.events.publish(CoordinationEvent::ResourceAcquired {
                        resource: resource.to_string(),
                        agent: agent.clone(),
                    });
                    return Ok(());
                }
                Some(current) if current.holder == *agent => {
                    return Err(WardenError::ResourceHeld {
                        resource: resource.to_string(),
                        agent: agent.to_string(),
                    });
                }
                Some(_) => {
                    let seq = state.next_seq;
                    state.next_seq += 1;

                    let (tx, rx) = oneshot::channel();
                    let queue = state.queues.entry(resource.to_string()).or_default();
                    let insert_pos = queue
                        .iter()
                        .position(|r| r.priority < priority)
                        .unwrap_or(queue.len());
                    queue.insert(
                        insert_pos,
                        QueuedRequest {
                            agent: agent.clone(),
                            priority,
                            seq,
                            enqueued_at: Instant::now(),
                            waker: tx,
                        },
                    );
                    debug!(
                        resource,
                        agent = %agent,
                        priority,
                        position = insert_pos,
                        queue_depth = queue.len(),
                        "Lock contended, request queued"
                    );
                    (seq, rx)
                }
            }
        };

        tokio::select! {
            outcome = &mut rx => match outcome {
                Ok(GrantOutcome::Granted) => {
                    debug!(
                        resource,
                        agent = %agent,
                        waited_ms = started.elapsed().as_millis() as u64,
                        "Lock granted from queue"
                    );
                    Ok(())
                }
                Ok(GrantOutcome::Cancelled) | Err(_) => Err(WardenError::LockCancelled {
                    resource: resource.to_string(),
                    agent: agent.to_string(),
                }),
            },
            _ = tokio::time::sleep(self.resource_timeout) => {
                self.finish_timed_out(resource, agent, seq, &mut rx, started)
            }
        }
    }

    /// Resolve a request whose wait timer fired. The grant path and this
    /// cleanup run under the same mutex, so exactly one of them wins: if the
    /// queue entry is gone a grant or cancellation already landed in the
    /// channel and takes precedence over the timeout.
    fn finish_timed_out(
        &self,
        resource: &str,
        agent: &AgentId,
        seq: u64,
        rx: &mut oneshot::Receiver<GrantOutcome>,
        started: Instant,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let removed = match state.queues.get_mut(resource) {
            Some(queue) => {
                let before = queue.len();
                queue.retain(|r| r.seq != seq);
                let removed = queue.len() < before;
                if queue.is_empty() {
                    state.queues.remove(resource);
                }
                removed
            }
            None => false,
        };
        drop(state);

        if removed {
            self.timeouts.fetch_add(1, Ordering::Relaxed);
            warn!(
                resource,
                agent = %agent,
                waited_ms = started.elapsed().as_millis() as u64,
                "Lock acquisition timed out"
            );
            return Err(WardenError::LockTimeout {
                resource: resource.to_string(),
                agent: agent.to_string(),
                waited_ms: started.elapsed().as_millis() as u64,
            });
        }

        match rx.try_recv() {
            Ok(GrantOutcome::Granted) => Ok(()),
            Ok(GrantOutcome::Cancelled) => Err(WardenError::LockCancelled {
                resource: resource.to_string(),
                agent: agent.to_string(),
            }),
            Err(_) => Err(WardenError::LockTimeout {
                resource: resource.to_string(),
                agent: agent.to_string(),
                waited_ms: started.elapsed().as_millis() as u64,
            }),
        }
    }

    /// Release a held lock and hand it to the queue head, if any.
    ///
    /// Releasing a resource the caller does not hold is a logged no-op.
    pub fn release(&self, resource: &str, agent: &AgentId) {
        let mut state = self.state.lock();
        match state.resources.get(resource) {
            None => {
                warn!(resource, agent = %agent, "Release of unlocked resource ignored");
                return;
            }
            Some(current) if current.holder != *agent => {
                warn!(
                    resource,
                    agent = %agent,
                    holder = %current.holder,
                    "Release by non-holder ignored"
                );
                return;
            }
            Some(_) => {}
        }

        let _ = state.clear_holder(resource);
        debug!(resource, agent = %agent, "Lock released");
        self.events.publish(CoordinationEvent::ResourceReleased {
            resource: resource.to_string(),
            agent: agent.clone(),
        });
        self.grant_next(&mut state, resource);
    }

    /// Release everything the agent holds. Used on agent termination and as
    /// the deadlock-victim preemption path. Returns the released resources.
    pub fn release_all_for_agent(&self, agent: &AgentId) -> Vec<String> {
        let held: Vec<String> = {
            let state = self.state.lock();
            state
                .agent_resources
                .get(agent)
                .map(|set| set.iter().cloned().collect())
                .unwrap_or_default()
        };

        for resource in &held {
            self.release(resource, agent);
        }

        if !held.is_empty() {
            debug!(agent = %agent, count = held.len(), "Bulk release completed");
        }
        held
    }

    /// Hand the resource to the highest-priority waiter still listening.
    /// Waiters that abandoned their request (dropped future) are skipped.
    fn grant_next(&self, state: &mut LockState, resource: &str) {
        loop {
            let request = match state.queues.get_mut(resource) {
                Some(queue) if !queue.is_empty() => queue.remove(0),
                _ => {
                    state.queues.remove(resource);
                    return;
                }
            };

            state.record_grant(resource, &request.agent);
            if request.waker.send(GrantOutcome::Granted).is_ok() {
                self.grants.fetch_add(1, Ordering::Relaxed);
                debug!(
                    resource,
                    agent = %request.agent,
                    priority = request.priority,
                    "Lock granted to queue head"
                );
                self.events.publish(CoordinationEvent::ResourceAcquired {
                    resource: resource.to_string(),
                    agent: request.agent.clone(),
                });
                return;
            }

            // Waiter vanished between queuing and grant; undo and try the next.
            let _ = state.clear_holder(resource);
        }
    }

    /// Current holder of a resource, if locked.
    pub fn holder(&self, resource: &str) -> Option<AgentId> {
        self.state
            .lock()
            .resources
            .get(resource)
            .map(|r| r.holder.clone())
    }

    /// Resources currently held by an agent.
    pub fn held_by(&self, agent: &AgentId) -> Vec<String> {
        self.state
            .lock()
            .agent_resources
            .get(agent)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn queue_depth(&self, resource: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(resource)
            .map(|q| q.len())
            .unwrap_or(0)
    }

    /// Point-in-time allocations, for the deadlock detector.
    pub fn allocations(&self) -> Vec<Allocation> {
        self.state
            .lock()
            .resources
            .iter()
            .map(|(resource, state)| Allocation {
                resource: resource.clone(),
                holder: state.holder.clone(),
                locked_at: state.locked_at,
                locked_at_utc: state.locked_at_utc,
            })
            .collect()
    }

    /// Point-in-time wait queues, for the deadlock detector.
    pub fn waiting_requests(&self) -> Vec<WaitingRequest> {
        self.state
            .lock()
            .queues
            .iter()
            .flat_map(|(resource, queue)| {
                queue.iter().map(|r| WaitingRequest {
                    resource: resource.clone(),
                    agent: r.agent.clone(),
                    priority: r.priority,
                    enqueued_at: r.enqueued_at,
                })
            })
            .collect()
    }

    /// Allocations and wait queues captured in one critical section, so the
    /// detector never sees a request and its own grant at the same time.
    pub fn snapshot(&self) -> (Vec<Allocation>, Vec<WaitingRequest>) {
        let state = self.state.lock();
        let allocations = state
            .resources
            .iter()
            .map(|(resource, rs)| Allocation {
                resource: resource.clone(),
                holder: rs.holder.clone(),
                locked_at: rs.locked_at,
                locked_at_utc: rs.locked_at_utc,
            })
            .collect();
        let waiting = state
            .queues
            .iter()
            .flat_map(|(resource, queue)| {
                queue.iter().map(|r| WaitingRequest {
                    resource: resource.clone(),
                    agent: r.agent.clone(),
                    priority: r.priority,
                    enqueued_at: r.enqueued_at,
                })
            })
            .collect();
        (allocations, waiting)
    }

    /// Drop over-age wait entries and force-release stale locks.
    ///
    /// A lock held past `stale_lock_factor x resource_timeout` is assumed
    /// abandoned and released even with no waiters. This trades safety for
    /// liveness: a holder that is merely slow loses its lock.
    pub fn maintain(&self) -> MaintenanceReport {
        let mut report = MaintenanceReport::default();
        let mut cancelled = Vec::new();
        let mut preempted = Vec::new();

        {
            let mut state = self.state.lock();

            for (resource, queue) in state.queues.iter_mut() {
                let before = queue.len();
                // Dropping the entry drops its waker; a still-live waiter
                // observes the closed channel as cancellation.
                queue.retain(|request| {
                    if request.enqueued_at.elapsed() > self.resource_timeout {
                        cancelled.push((resource.clone(), request.agent.clone(), request.seq));
                        false
                    } else {
                        true
                    }
                });
                report.expired_requests += before - queue.len();
            }
            state.queues.retain(|_, queue| !queue.is_empty());

            let stale: Vec<String> = state
                .resources
                .iter()
                .filter(|(_, rs)| rs.locked_at.elapsed() > self.stale_lock_age)
                .map(|(resource, _)| resource.clone())
                .collect();
            for resource in stale {
                if let Some(holder) = state.clear_holder(&resource) {
                    preempted.push((resource.clone(), holder));
                    report.forced_releases += 1;
                    self.grant_next(&mut state, &resource);
                }
            }
        }

        for (resource, agent, seq) in cancelled {
            self.cancellations.fetch_add(1, Ordering::Relaxed);
            warn!(resource = %resource, agent = %agent, seq, "Expired wait entry dropped");
        }
        for (resource, agent) in preempted {
            self.forced_releases.fetch_add(1, Ordering::Relaxed);
            warn!(resource = %resource, agent = %agent, "Stale lock force-released");
            self.events.publish(CoordinationEvent::ResourcePreempted {
                resource,
                agent,
                reason: "stale lock".to_string(),
            });
        }

        report
    }

    /// Cancel an agent's queued requests, waking its waiters with a
    /// cancellation outcome. Used when a deadlock victim is preempted.
    pub fn cancel_waiters_for_agent(&self, agent: &AgentId) -> usize {
        let mut state = self.state.lock();
        let mut count = 0;
        for queue in state.queues.values_mut() {
            let before = queue.len();
            queue.retain(|r| r.agent != *agent);
            count += before - queue.len();
        }
        state.queues.retain(|_, queue| !queue.is_empty());
        self.cancellations.fetch_add(count as u64, Ordering::Relaxed);
        if count > 0 {
            debug!(agent = %agent, count, "Queued lock requests cancelled for agent");
        }
        count
    }

    /// Cancel every queued request, waking waiters with a cancellation
    /// outcome. Used on coordinator shutdown.
    pub fn cancel_all_waiters(&self) -> usize {
        let mut state = self.state.lock();
        let mut count = 0;
        for (_, queue) in state.queues.drain() {
            for request in queue {
                let _ = request.waker.send(GrantOutcome::Cancelled);
                count += 1;
            }
        }
        self.cancellations.fetch_add(count as u64, Ordering::Relaxed);
        if count > 0 {
            debug!(count, "All queued lock requests cancelled");
        }
        count
    }

    pub fn grants_total(&self) -> u64 {
        self.grants.load(Ordering::Relaxed)
    }

    pub fn timeouts_total(&self) -> u64 {
        self.timeouts.load(Ordering::Relaxed)
    }

    pub fn cancellations_total(&self) -> u64 {
        self.cancellations.load(Ordering::Relaxed)
    }

    pub fn forced_releases_total(&self) -> u64 {
        self.forced_releases.load(Ordering::Relaxed)
    }

    pub fn locked_count(&self) -> usize {
        self.state.lock().resources.len()
    }

    pub fn waiting_count(&self) -> usize {
        self.state.lock().queues.values().map(|q| q.len()).sum()
    }

    pub fn holding_agent_count(&self) -> usize {
        self.state.lock().agent_resources.len()
    }
}
