//! Coordination manager: composition root for the resource-safety layer.
//!
//! Owns the lock manager, conflict resolver, and event bus; delegates task
//! and messaging operations to injected collaborators; runs the periodic
//! deadlock-detection and maintenance loops between explicit `start` and
//! `shutdown` calls.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::{VictimPolicy, WardenConfig};
use crate::error::{Result, WardenError};

use super::conflict::{Claim, Conflict, ConflictKind, ConflictResolver, Resolution};
use super::events::{CoordinationEvent, EventBus, EventReceiver};
use super::lock_manager::{MaintenanceReport, ResourceLockManager};
use super::router::MessageRouter;
use super::scheduler::{TaskScheduler, TaskSpec};
use super::types::{
    AgentId, CallContext, ComponentHealth, CoordinationMetrics, HealthReport, HealthStatus,
    WaitingRequest,
};
use super::wait_graph::{DeadlockCycle, WaitForGraph};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Created,
    Running,
    ShutDown,
}

pub struct CoordinationManager {
    config: WardenConfig,
    locks: Arc<ResourceLockManager>,
    conflicts: Arc<ConflictResolver>,
    events: Arc<EventBus>,
    scheduler: Arc<dyn TaskScheduler>,
    router: Arc<dyn MessageRouter>,
    lifecycle: RwLock<Lifecycle>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    background: Mutex<Vec<JoinHandle<()>>>,
    deadlocks_detected: AtomicU64,
    deadlocks_resolved: AtomicU64,
}

impl CoordinationManager {
    pub fn new(
        config: WardenConfig,
        scheduler: Arc<dyn TaskScheduler>,
        router: Arc<dyn MessageRouter>,
    ) -> Self {
        let events = Arc::new(EventBus::new(config.coordination.event_capacity));
        let locks = Arc::new(ResourceLockManager::new(&config.locks, Arc::clone(&events)));
        let conflicts = Arc::new(ConflictResolver::new(&config.conflicts));
        Self {
            config,
            locks,
            conflicts,
            events,
            scheduler,
            router,
            lifecycle: RwLock::new(Lifecycle::Created),
            shutdown: Mutex::new(None),
            background: Mutex::new(Vec::new()),
            deadlocks_detected: AtomicU64::new(0),
            deadlocks_resolved: AtomicU64::new(0),
        }
    }

    /// Shared event bus; subscribe for lock, deadlock, and gateway events.
    pub fn events(&self) -> Arc<EventBus> {
        Arc::clone(&self.events)
    }

    /// Shared lock manager; the gateway acquires its declared resources
    /// through the same lock table this manager watches for deadlocks.
    pub fn lock_manager(&self) -> Arc<ResourceLockManager> {
        Arc::clone(&self.locks)
    }

    pub fn conflict_resolver(&self) -> Arc<ConflictResolver> {
        Arc::clone(&self.conflicts)
    }

    fn ensure_running(&self) -> Result<()> {
        match *self.lifecycle.read() {
            Lifecycle::Running => Ok(()),
            Lifecycle::Created => Err(WardenError::Coordination(
                "coordination manager used before start".to_string(),
            )),
            Lifecycle::ShutDown => Err(WardenError::Coordination(
                "coordination manager used after shutdown".to_string(),
            )),
        }
    }

    /// Start the detection, maintenance, and emergency-cleanup loops.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        {
            let mut lifecycle = self.lifecycle.write();
            match *lifecycle {
                Lifecycle::Created => *lifecycle = Lifecycle::Running,
                Lifecycle::Running => {
                    return Err(WardenError::Coordination(
                        "coordination manager already started".to_string(),
                    ));
                }
                Lifecycle::ShutDown => {
                    return Err(WardenError::Coordination(
                        "coordination manager cannot restart after shutdown".to_string(),
                    ));
                }
            }
        }

        let (tx, rx) = watch::channel(false);
        *self.shutdown.lock() = Some(tx);

        let mut handles = self.background.lock();
        handles.push(self.spawn_detection_loop(rx.clone()));
        handles.push(self.spawn_maintenance_loop(rx.clone()));
        handles.push(self.spawn_timeout_listener(rx));

        info!(
            detection_interval_secs = self.config.coordination.detection_interval_secs,
            maintenance_interval_secs = self.config.locks.maintenance_interval_secs,
            "Coordination manager started"
        );
        Ok(())
    }

    /// Stop the background loops and wake all queued waiters with a
    /// cancellation. Idempotent once shut down.
    pub async fn shutdown(&self) {
        {
            let mut lifecycle = self.lifecycle.write();
            if *lifecycle == Lifecycle::ShutDown {
                warn!("Shutdown called twice, ignoring");
                return;
            }
            *lifecycle = Lifecycle::ShutDown;
        }

        if let Some(tx) = self.shutdown.lock().take() {
            let _ = tx.send(true);
        }
        let handles: Vec<JoinHandle<()>> = self.background.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }

        let cancelled = self.locks.cancel_all_waiters();
        info!(cancelled_waiters = cancelled, "Coordination manager stopped");
    }

    fn spawn_detection_loop(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let interval = Duration::from_secs(self.config.coordination.detection_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = manager.run_deadlock_detection().await {
                            error!(error = %e, "Deadlock detection pass failed");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    }

    fn spawn_maintenance_loop(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let interval = Duration::from_secs(self.config.locks.maintenance_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        manager.perform_maintenance();
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    }

    fn spawn_timeout_listener(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let mut receiver: EventReceiver = self.events.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = receiver.recv() => match event {
                        Some(CoordinationEvent::ExternalCallTimeout { context }) => {
                            manager.handle_external_timeout(&context).await;
                        }
                        Some(_) => {}
                        None => break,
                    },
                    _ = shutdown.changed() => break,
                }
            }
        })
    }

    // === Delegation surface ===

    pub async fn acquire_resource(
        &self,
        resource: &str,
        agent: &AgentId,
        priority: i32,
    ) -> Result<()> {
        self.ensure_running()?;
        self.locks.acquire(resource, agent, priority).await
    }

    pub fn release_resource(&self, resource: &str, agent: &AgentId) -> Result<()> {
        self.ensure_running()?;
        self.locks.release(resource, agent);
        Ok(())
    }

    pub fn release_all_for_agent(&self, agent: &AgentId) -> Result<Vec<String>> {
        self.ensure_running()?;
        Ok(self.locks.release_all_for_agent(agent))
    }

    pub async fn assign_task(&self, task: TaskSpec, agent: &AgentId) -> Result<()> {
        self.ensure_running()?;
        self.scheduler.assign_task(task, agent).await
    }

    pub async fn cancel_task(&self, task_id: &str, reason: &str) -> Result<()> {
        self.ensure_running()?;
        self.scheduler.cancel_task(task_id, reason).await
    }

    pub async fn agent_tasks(&self, agent: &AgentId) -> Result<Vec<TaskSpec>> {
        self.ensure_running()?;
        Ok(self.scheduler.agent_tasks(agent).await)
    }

    /// Terminate an agent: cancel its tasks and free everything it holds.
    pub async fn terminate_agent(&self, agent: &AgentId, reason: &str) -> Result<Vec<String>> {
        self.ensure_running()?;
        let cancelled = self.scheduler.cancel_agent_tasks(agent, reason).await?;
        self.locks.cancel_waiters_for_agent(agent);
        let released = self.locks.release_all_for_agent(agent);
        info!(
            agent = %agent,
            cancelled_tasks = cancelled,
            released = released.len(),
            reason,
            "Agent terminated"
        );
        Ok(released)
    }

    pub async fn send_message(&self, from: &AgentId, to: &AgentId, message: Value) -> Result<()> {
        self.ensure_running()?;
        self.router.send(from, to, message).await
    }

    // === Conflicts ===

    /// Record a conflict and immediately attempt auto-resolution with the
    /// configured default strategy. Resolution failure is logged, never
    /// returned to the reporter.
    pub fn report_conflict(
        &self,
        kind: ConflictKind,
        subject: impl Into<String>,
        claims: Vec<Claim>,
    ) -> Result<Conflict> {
        self.ensure_running()?;
        let conflict = self.conflicts.report(kind, subject, claims)?;
        self.events.publish(CoordinationEvent::ConflictReported {
            conflict_id: conflict.id.clone(),
            subject: conflict.subject.clone(),
        });

        if let Some(resolution) = self.conflicts.auto_resolve(&conflict.id) {
            self.events.publish(CoordinationEvent::ConflictResolved {
                conflict_id: conflict.id.clone(),
                winner: resolution.winner.clone(),
            });
        }

        Ok(self.conflicts.get(&conflict.id).unwrap_or(conflict))
    }

    pub fn resolve_conflict_with_votes(
        &self,
        conflict_id: &str,
        votes: &HashMap<AgentId, AgentId>,
    ) -> Result<Resolution> {
        self.ensure_running()?;
        let resolution = self.conflicts.resolve_with_votes(conflict_id, votes)?;
        self.events.publish(CoordinationEvent::ConflictResolved {
            conflict_id: conflict_id.to_string(),
            winner: resolution.winner.clone(),
        });
        Ok(resolution)
    }

    // === Deadlock detection ===

    /// One detection pass: snapshot the lock table, build the wait-for
    /// graph, and resolve every cycle found. Returns the detected cycles.
    pub async fn run_deadlock_detection(&self) -> Result<Vec<DeadlockCycle>> {
        let (allocations, waiting) = self.locks.snapshot();
        if waiting.is_empty() {
            return Ok(Vec::new());
        }

        let graph = WaitForGraph::from_snapshot(&allocations, &waiting);
        let cycles = graph.detect_cycles();
        if cycles.is_empty() {
            return Ok(cycles);
        }

        for cycle in &cycles {
            self.deadlocks_detected.fetch_add(1, Ordering::Relaxed);
            warn!(
                agents = ?cycle.agents,
                resources = ?cycle.resources,
                "Deadlock detected"
            );
            self.events.publish(CoordinationEvent::DeadlockDetected {
                agents: cycle.agents.clone(),
                resources: cycle.resources.clone(),
            });
            self.resolve_deadlock(cycle, &waiting).await?;
        }

        Ok(cycles)
    }

    /// Break one cycle by preempting a victim: force-release its resources,
    /// drop its queued requests, and hand its tasks back to the scheduler.
    async fn resolve_deadlock(
        &self,
        cycle: &DeadlockCycle,
        waiting: &[WaitingRequest],
    ) -> Result<()> {
        let victim = self.select_victim(cycle, waiting);

        self.locks.cancel_waiters_for_agent(&victim);
        let released = self.locks.release_all_for_agent(&victim);

        let rescheduled = self
            .scheduler
            .reschedule_agent_tasks(&victim)
            .await
            .map_err(|e| {
                error!(victim = %victim, error = %e, "Deadlock resolution failed");
                WardenError::Deadlock(format!(
                    "victim {victim} preempted but task rescheduling failed: {e}"
                ))
            })?;

        self.deadlocks_resolved.fetch_add(1, Ordering::Relaxed);
        info!(
            victim = %victim,
            released = released.len(),
            rescheduled,
            "Deadlock resolved by preemption"
        );
        self.events.publish(CoordinationEvent::DeadlockResolved {
            victim,
            released,
        });
        Ok(())
    }

    fn select_victim(&self, cycle: &DeadlockCycle, waiting: &[WaitingRequest]) -> AgentId {
        match self.config.coordination.victim_policy {
            VictimPolicy::FirstInCycle => cycle.agents[0].clone(),
            VictimPolicy::FewestResourcesHeld => cycle
                .agents
                .iter()
                .min_by_key(|agent| (self.locks.held_by(agent).len(), (*agent).clone()))
                .cloned()
                .unwrap_or_else(|| cycle.agents[0].clone()),
            VictimPolicy::LowestPriority => cycle
                .agents
                .iter()
                .min_by_key(|agent| {
                    let priority = waiting
                        .iter()
                        .filter(|w| w.agent == **agent)
                        .map(|w| w.priority)
                        .min()
                        .unwrap_or(i32::MAX);
                    (priority, (*agent).clone())
                })
                .cloned()
                .unwrap_or_else(|| cycle.agents[0].clone()),
        }
    }

    // === Emergency cleanup ===

    /// An external call timed out; assume the calling agent is wedged and
    /// free everything it holds so the rest of the fleet keeps moving.
    pub async fn handle_external_timeout(&self, context: &CallContext) {
        warn!(
            agent = %context.agent,
            endpoint = %context.endpoint,
            operation = %context.operation,
            "External call timeout, running emergency cleanup"
        );

        self.locks.cancel_waiters_for_agent(&context.agent);
        let released = self.locks.release_all_for_agent(&context.agent);
        if !released.is_empty() {
            debug!(agent = %context.agent, released = released.len(), "Emergency release");
        }

        if let Err(e) = self.scheduler.reschedule_agent_tasks(&context.agent).await {
            error!(agent = %context.agent, error = %e, "Emergency rescheduling failed");
        }
    }

    // === Health and metrics ===

    /// Aggregate health across collaborators and the lock table. A failing
    /// collaborator health check degrades the report instead of failing it.
    pub async fn health_status(&self) -> HealthReport {
        let mut components = Vec::new();

        components.push(match self.scheduler.health_status().await {
            Ok(health) => health,
            Err(e) => ComponentHealth::critical("scheduler", e.to_string()),
        });
        components.push(match self.router.health_status().await {
            Ok(health) => health,
            Err(e) => ComponentHealth::critical("router", e.to_string()),
        });
        components.push(
            ComponentHealth::healthy("locks")
                .with_metric("resources_locked", self.locks.locked_count() as f64)
                .with_metric("requests_waiting", self.locks.waiting_count() as f64)
                .with_metric("grants_total", self.locks.grants_total() as f64)
                .with_metric("timeouts_total", self.locks.timeouts_total() as f64),
        );
        components.push(
            ComponentHealth::healthy("conflicts")
                .with_metric("open", self.conflicts.open_count() as f64)
                .with_metric("resolved_total", self.conflicts.resolved_total() as f64),
        );

        let status = components
            .iter()
            .map(|c| c.status)
            .fold(HealthStatus::Healthy, HealthStatus::worst);

        let mut metrics = HashMap::new();
        for component in &components {
            for (key, value) in &component.metrics {
                metrics.insert(format!("{}.{}", component.component, key), *value);
            }
        }

        HealthReport {
            status,
            components,
            metrics,
            checked_at: chrono::Utc::now(),
        }
    }

    pub fn coordination_metrics(&self) -> CoordinationMetrics {
        CoordinationMetrics {
            resources_locked: self.locks.locked_count(),
            agents_holding: self.locks.holding_agent_count(),
            requests_waiting: self.locks.waiting_count(),
            grants_total: self.locks.grants_total(),
            timeouts_total: self.locks.timeouts_total(),
            cancellations_total: self.locks.cancellations_total(),
            forced_releases_total: self.locks.forced_releases_total(),
            deadlocks_detected: self.deadlocks_detected.load(Ordering::Relaxed),
            deadlocks_resolved: self.deadlocks_resolved.load(Ordering::Relaxed),
            conflicts_open: self.conflicts.open_count(),
            conflicts_resolved: self.conflicts.resolved_total(),
        }
    }

    /// Lock and conflict table sweep. Also invoked by the background loop;
    /// hosts may call it directly between intervals. Never fails: one bad
    /// sweep must not stall the detection loop.
    pub fn perform_maintenance(&self) -> MaintenanceReport {
        let report = self.locks.maintain();
        let swept = self.conflicts.sweep();
        if report.expired_requests > 0 || report.forced_releases > 0 || swept > 0 {
            debug!(
                expired_requests = report.expired_requests,
                forced_releases = report.forced_releases,
                conflicts_swept = swept,
                "Maintenance pass"
            );
        }
        report
    }
}
