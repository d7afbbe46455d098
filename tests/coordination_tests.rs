//! End-to-end coordination tests: mutual exclusion, grant ordering, deadlock
//! detection and resolution, stale-lock cleanup, and lifecycle errors.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use warden::config::WardenConfig;
use warden::coordination::{
    AgentId, ComponentHealth, CoordinationEvent, CoordinationManager, MessageRouter, TaskScheduler,
    TaskSpec,
};
use warden::error::{Result, WardenError};

#[derive(Default)]
struct RecordingScheduler {
    rescheduled: Mutex<Vec<AgentId>>,
}

#[async_trait]
impl TaskScheduler for RecordingScheduler {
    async fn assign_task(&self, _task: TaskSpec, _agent: &AgentId) -> Result<()> {
        Ok(())
    }

    async fn cancel_task(&self, _task_id: &str, _reason: &str) -> Result<()> {
        Ok(())
    }

    async fn complete_task(&self, _task_id: &str, _result: Value) -> Result<()> {
        Ok(())
    }

    async fn fail_task(&self, _task_id: &str, _error: &str) -> Result<()> {
        Ok(())
    }

    async fn reschedule_agent_tasks(&self, agent: &AgentId) -> Result<usize> {
        self.rescheduled.lock().push(agent.clone());
        Ok(1)
    }

    async fn cancel_agent_tasks(&self, _agent: &AgentId, _reason: &str) -> Result<usize> {
        Ok(0)
    }

    async fn agent_task_count(&self, _agent: &AgentId) -> usize {
        0
    }

    async fn agent_tasks(&self, _agent: &AgentId) -> Vec<TaskSpec> {
        Vec::new()
    }

    async fn health_status(&self) -> Result<ComponentHealth> {
        Ok(ComponentHealth::healthy("scheduler"))
    }
}

struct NullRouter;

#[async_trait]
impl MessageRouter for NullRouter {
    async fn send(&self, _from: &AgentId, _to: &AgentId, _message: Value) -> Result<()> {
        Ok(())
    }

    async fn health_status(&self) -> Result<ComponentHealth> {
        Ok(ComponentHealth::healthy("router"))
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn manager_with(
    mutate: impl FnOnce(&mut WardenConfig),
) -> (Arc<CoordinationManager>, Arc<RecordingScheduler>) {
    init_tracing();
    let mut config = WardenConfig::default();
    config.locks.resource_timeout_ms = 2_000;
    mutate(&mut config);

    let scheduler = Arc::new(RecordingScheduler::default());
    let manager = Arc::new(CoordinationManager::new(
        config,
        Arc::clone(&scheduler) as Arc<dyn TaskScheduler>,
        Arc::new(NullRouter),
    ));
    manager.start().unwrap();
    (manager, scheduler)
}

#[tokio::test]
async fn mutual_exclusion_under_contention() {
    let (manager, _) = manager_with(|c| c.locks.resource_timeout_ms = 5_000);

    let concurrent = Arc::new(AtomicUsize::new(0));
    let max_concurrent = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::new();
    for i in 0..8 {
        let manager = Arc::clone(&manager);
        let concurrent = Arc::clone(&concurrent);
        let max_concurrent = Arc::clone(&max_concurrent);
        tasks.push(tokio::spawn(async move {
            let agent = AgentId::new(format!("agent-{i}"));
            manager.acquire_resource("shared", &agent, 0).await.unwrap();

            let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
            max_concurrent.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            concurrent.fetch_sub(1, Ordering::SeqCst);

            manager.release_resource("shared", &agent).unwrap();
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(max_concurrent.load(Ordering::SeqCst), 1);
    manager.shutdown().await;
}

#[tokio::test]
async fn grants_follow_priority_then_arrival() {
    let (manager, _) = manager_with(|c| c.locks.resource_timeout_ms = 5_000);
    let holder = AgentId::new("holder");
    manager.acquire_resource("shared", &holder, 0).await.unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));
    let mut tasks = Vec::new();
    for (name, priority) in [("p1", 1), ("p5", 5), ("p3", 3)] {
        let manager = Arc::clone(&manager);
        let order = Arc::clone(&order);
        let agent = AgentId::new(name);
        tasks.push(tokio::spawn(async move {
            manager.acquire_resource("shared", &agent, priority).await.unwrap();
            order.lock().push(name);
            manager.release_resource("shared", &agent).unwrap();
        }));
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    manager.release_resource("shared", &holder).unwrap();
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(*order.lock(), vec!["p5", "p3", "p1"]);
    manager.shutdown().await;
}

#[tokio::test]
async fn acquire_times_out_within_bound() {
    let (manager, _) = manager_with(|c| c.locks.resource_timeout_ms = 100);
    let holder = AgentId::new("holder");
    let waiter = AgentId::new("waiter");

    manager.acquire_resource("shared", &holder, 0).await.unwrap();

    let started = Instant::now();
    let err = manager
        .acquire_resource("shared", &waiter, 0)
        .await
        .unwrap_err();
    let waited = started.elapsed();

    assert!(matches!(err, WardenError::LockTimeout { .. }));
    assert!(err.is_recoverable());
    assert!(waited >= Duration::from_millis(100));
    assert!(waited <= Duration::from_millis(250), "waited {waited:?}");
    manager.shutdown().await;
}

#[tokio::test]
async fn detection_loop_breaks_cross_wait_within_interval() {
    let (manager, scheduler) = manager_with(|c| {
        c.coordination.detection_interval_secs = 1;
        c.locks.resource_timeout_ms = 30_000;
    });
    let mut events = manager.events().subscribe();

    let a = AgentId::new("agent-a");
    let b = AgentId::new("agent-b");
    manager.acquire_resource("r1", &a, 0).await.unwrap();
    manager.acquire_resource("r2", &b, 0).await.unwrap();

    let wait_a = {
        let manager = Arc::clone(&manager);
        let a = a.clone();
        tokio::spawn(async move { manager.acquire_resource("r2", &a, 0).await })
    };
    let wait_b = {
        let manager = Arc::clone(&manager);
        let b = b.clone();
        tokio::spawn(async move { manager.acquire_resource("r1", &b, 0).await })
    };

    // One detection interval plus margin.
    let deadline = Instant::now() + Duration::from_secs(3);
    let mut detected = None;
    while Instant::now() < deadline {
        match tokio::time::timeout(Duration::from_millis(200), events.recv()).await {
            Ok(Some(CoordinationEvent::DeadlockDetected { agents, resources })) => {
                detected = Some((agents, resources));
                break;
            }
            Ok(Some(_)) => continue,
            _ => continue,
        }
    }

    let (agents, resources) = detected.expect("deadlock not detected within interval");
    assert_eq!(agents.len(), 2);
    assert!(agents.contains(&a));
    assert!(agents.contains(&b));
    assert!(resources.contains(&"r1".to_string()));
    assert!(resources.contains(&"r2".to_string()));

    // Exactly one participant was preempted and rescheduled; the survivor's
    // pending acquire went through.
    let survivor_result = tokio::time::timeout(Duration::from_secs(2), wait_b)
        .await
        .unwrap()
        .unwrap();
    survivor_result.unwrap();
    let victim_result = tokio::time::timeout(Duration::from_secs(2), wait_a)
        .await
        .unwrap()
        .unwrap();
    assert!(victim_result.is_err());

    let rescheduled = scheduler.rescheduled.lock().clone();
    assert_eq!(rescheduled, vec![a.clone()]);
    assert!(manager.lock_manager().held_by(&a).is_empty());

    let metrics = manager.coordination_metrics();
    assert!(metrics.deadlocks_detected >= 1);
    assert!(metrics.deadlocks_resolved >= 1);

    manager.shutdown().await;
}

#[tokio::test]
async fn maintenance_force_releases_stale_lock() {
    let (manager, _) = manager_with(|c| {
        c.locks.resource_timeout_ms = 50;
        c.locks.stale_lock_factor = 2;
    });

    let agent = AgentId::new("slow");
    manager.acquire_resource("shared", &agent, 0).await.unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;

    let report = manager.perform_maintenance();
    assert_eq!(report.forced_releases, 1);
    assert!(manager.lock_manager().holder("shared").is_none());

    manager.shutdown().await;
}

#[tokio::test]
async fn double_release_is_silent() {
    let (manager, _) = manager_with(|_| {});
    let agent = AgentId::new("agent");

    manager.acquire_resource("shared", &agent, 0).await.unwrap();
    manager.release_resource("shared", &agent).unwrap();
    manager.release_resource("shared", &agent).unwrap();
    manager
        .release_resource("never-locked", &agent)
        .unwrap();

    manager.shutdown().await;
}

#[tokio::test]
async fn lifecycle_misuse_is_fatal() {
    let config = WardenConfig::default();
    let manager = Arc::new(CoordinationManager::new(
        config,
        Arc::new(RecordingScheduler::default()) as Arc<dyn TaskScheduler>,
        Arc::new(NullRouter),
    ));

    let err = manager
        .acquire_resource("shared", &AgentId::new("a"), 0)
        .await
        .unwrap_err();
    assert!(err.is_fatal());

    manager.start().unwrap();
    manager.shutdown().await;

    let err = manager
        .send_message(&AgentId::new("a"), &AgentId::new("b"), Value::Null)
        .await
        .unwrap_err();
    assert!(matches!(err, WardenError::Coordination(_)));
}

#[tokio::test]
async fn shutdown_cancels_pending_waiters() {
    let (manager, _) = manager_with(|c| c.locks.resource_timeout_ms = 30_000);
    let holder = AgentId::new("holder");
    manager.acquire_resource("shared", &holder, 0).await.unwrap();

    let waiter_task = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move {
            manager
                .acquire_resource("shared", &AgentId::new("waiter"), 0)
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    manager.shutdown().await;

    let err = tokio::time::timeout(Duration::from_secs(1), waiter_task)
        .await
        .unwrap()
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, WardenError::LockCancelled { .. }));
}

#[tokio::test]
async fn health_report_merges_collaborator_metrics() {
    let (manager, _) = manager_with(|_| {});

    let agent = AgentId::new("agent");
    manager.acquire_resource("shared", &agent, 0).await.unwrap();

    let report = manager.health_status().await;
    assert!(report.status.is_healthy());
    assert_eq!(report.metrics.get("locks.resources_locked"), Some(&1.0));
    assert!(report.components.iter().any(|c| c.component == "scheduler"));
    assert!(report.components.iter().any(|c| c.component == "router"));

    manager.shutdown().await;
}

#[tokio::test]
async fn reported_conflict_is_auto_resolved_by_priority() {
    let (manager, _) = manager_with(|_| {});

    use warden::coordination::{Claim, ConflictKind};
    let conflict = manager
        .report_conflict(
            ConflictKind::Resource,
            "shared",
            vec![Claim::new("weak", 1), Claim::new("strong", 8)],
        )
        .unwrap();

    let resolution = conflict.resolution.expect("auto-resolution should succeed");
    assert_eq!(resolution.winner, AgentId::new("strong"));

    let metrics = manager.coordination_metrics();
    assert_eq!(metrics.conflicts_resolved, 1);
    assert_eq!(metrics.conflicts_open, 0);

    manager.shutdown().await;
}

#[tokio::test]
async fn voting_resolution_reaches_quorum() {
    let (manager, _) = manager_with(|_| {});

    use warden::coordination::{Claim, ConflictKind};
    let resolver = manager.conflict_resolver();
    let conflict = resolver
        .report(
            ConflictKind::Task,
            "task-9",
            vec![Claim::new("a", 0), Claim::new("b", 0), Claim::new("c", 0)],
        )
        .unwrap();

    let mut votes = HashMap::new();
    votes.insert(AgentId::new("a"), AgentId::new("c"));
    votes.insert(AgentId::new("b"), AgentId::new("c"));
    let resolution = manager
        .resolve_conflict_with_votes(&conflict.id, &votes)
        .unwrap();
    assert_eq!(resolution.winner, AgentId::new("c"));
    assert!(resolution.rationale.contains("quorum"));

    manager.shutdown().await;
}
