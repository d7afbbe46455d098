//! Guarded outbound calls to external tool/service endpoints.
//!
//! Every call runs behind, in order: the endpoint health gate, the caller's
//! self-hold pre-check, canonical-order resource acquisition through the
//! shared lock manager, and a circuit breaker with a hard timeout. Retries
//! with exponential backoff wrap only the remote operation; declared
//! resources are held across retries and released in reverse order.

mod breaker;
mod health;
mod monitor;
mod retry;

pub use breaker::{CircuitBreaker, CircuitState};
pub use health::{ConnectionHealthMonitor, Pinger};
pub use monitor::{OperationStats, PerformanceMonitor};
pub use retry::RetryPolicy;

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, warn};

use crate::config::GatewayConfig;
use crate::coordination::{
    CallContext, CoordinationEvent, EventBus, ResourceLockManager,
};
use crate::error::{Result, WardenError};

pub struct SafeGateway {
    config: GatewayConfig,
    locks: Arc<ResourceLockManager>,
    events: Arc<EventBus>,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
    health: ConnectionHealthMonitor,
    monitor: PerformanceMonitor,
}

impl SafeGateway {
    pub fn new(
        config: GatewayConfig,
        locks: Arc<ResourceLockManager>,
        events: Arc<EventBus>,
        pinger: Arc<dyn Pinger>,
    ) -> Self {
        let breaker = CircuitBreaker::new(&config.breaker);
        let retry = RetryPolicy::new(&config.retry);
        let health = ConnectionHealthMonitor::new(&config.health, pinger);
        let monitor = PerformanceMonitor::new(&config.monitor, Arc::clone(&events));
        Self {
            config,
            locks,
            events,
            breaker,
            retry,
            health,
            monitor,
        }
    }

    /// Call an external endpoint with the full protection stack. Declared
    /// resources are acquired in sorted order before the first attempt and
    /// released in reverse order after the last.
    pub async fn call<T, F, Fut>(
        &self,
        context: &CallContext,
        resources: &[String],
        op: F,
    ) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.health.gate(&context.endpoint).await?;

        // Fast local guard: a caller re-acquiring something it already holds
        // can never be granted. The manager's cycle detector covers the
        // cross-agent cases.
        for resource in resources {
            if self.locks.holder(resource).as_ref() == Some(&context.agent) {
                return Err(WardenError::ResourceHeld {
                    resource: resource.clone(),
                    agent: context.agent.to_string(),
                });
            }
        }

        let mut ordered: Vec<String> = resources.to_vec();
        ordered.sort();
        ordered.dedup();

        let mut acquired: Vec<String> = Vec::with_capacity(ordered.len());
        for resource in &ordered {
            match self.locks.acquire(resource, &context.agent, 0).await {
                Ok(()) => acquired.push(resource.clone()),
                Err(e) => {
                    warn!(
                        agent = %context.agent,
                        endpoint = %context.endpoint,
                        resource = %resource,
                        error = %e,
                        "Ordered acquisition failed, rolling back"
                    );
                    self.release_reverse(&mut acquired, context);
                    return Err(e);
                }
            }
        }

        let result = self
            .retry
            .run(&context.operation, || self.execute_protected(context, &op))
            .await;

        self.release_reverse(&mut acquired, context);

        if let Err(WardenError::CallTimeout { .. }) = &result {
            self.events.publish(CoordinationEvent::ExternalCallTimeout {
                context: context.clone(),
            });
        }
        result
    }

    fn release_reverse(&self, acquired: &mut Vec<String>, context: &CallContext) {
        while let Some(resource) = acquired.pop() {
            self.locks.release(&resource, &context.agent);
        }
    }

    /// One breaker-gated, timeout-bounded attempt.
    async fn execute_protected<T, F, Fut>(&self, context: &CallContext, op: &F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.breaker.check(&context.endpoint)?;

        let started = Instant::now();
        let outcome = tokio::time::timeout(self.config.call_timeout(), op()).await;
        let elapsed = started.elapsed();

        match outcome {
            Ok(Ok(value)) => {
                self.breaker.record_success(&context.endpoint);
                self.monitor
                    .record(&context.endpoint, &context.operation, elapsed, true);
                debug!(
                    endpoint = %context.endpoint,
                    operation = %context.operation,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Call succeeded"
                );
                Ok(value)
            }
            Ok(Err(e)) => {
                self.breaker.record_failure(&context.endpoint);
                self.monitor
                    .record(&context.endpoint, &context.operation, elapsed, false);
                warn!(
                    endpoint = %context.endpoint,
                    operation = %context.operation,
                    error = %e,
                    "Call failed"
                );
                Err(e)
            }
            Err(_) => {
                self.breaker.record_failure(&context.endpoint);
                self.monitor
                    .record(&context.endpoint, &context.operation, elapsed, false);
                warn!(
                    endpoint = %context.endpoint,
                    operation = %context.operation,
                    timeout_ms = self.config.call_timeout_ms,
                    "Call timed out"
                );
                Err(WardenError::CallTimeout {
                    endpoint: context.endpoint.clone(),
                    operation: context.operation.clone(),
                    timeout_ms: self.config.call_timeout_ms,
                })
            }
        }
    }

    pub fn circuit_state(&self, endpoint: &str) -> CircuitState {
        self.breaker.state(endpoint)
    }

    pub fn endpoint_stats(&self, endpoint: &str, operation: &str) -> Option<OperationStats> {
        self.monitor.stats(endpoint, operation)
    }

    /// Probe all registered endpoints whose check window elapsed. Invoked by
    /// the host on its maintenance cadence.
    pub async fn run_health_checks(&self) -> usize {
        self.health.run_checks().await
    }

    pub fn health_monitor(&self) -> &ConnectionHealthMonitor {
        &self.health
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WardenConfig;
    use crate::coordination::AgentId;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct OkPinger;

    #[async_trait]
    impl Pinger for OkPinger {
        async fn ping(&self, _endpoint: &str) -> Result<()> {
            Ok(())
        }
    }

    fn gateway(mut mutate: impl FnMut(&mut GatewayConfig)) -> (SafeGateway, Arc<ResourceLockManager>) {
        let config = WardenConfig::default();
        let events = Arc::new(EventBus::new(64));
        let locks = Arc::new(ResourceLockManager::new(&config.locks, Arc::clone(&events)));

        let mut gateway_config = config.gateway;
        gateway_config.retry.initial_delay_ms = 1;
        gateway_config.retry.max_delay_ms = 5;
        mutate(&mut gateway_config);

        let gateway = SafeGateway::new(
            gateway_config,
            Arc::clone(&locks),
            events,
            Arc::new(OkPinger),
        );
        (gateway, locks)
    }

    fn context() -> CallContext {
        CallContext::new("caller-1", "search", "query")
    }

    #[tokio::test]
    async fn test_plain_call_passes_through() {
        let (gateway, _locks) = gateway(|_| {});
        let result = gateway
            .call(&context(), &[], || async { Ok(7) })
            .await
            .unwrap();
        assert_eq!(result, 7);
        assert_eq!(gateway.circuit_state("search"), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_resources_acquired_and_released() {
        let (gateway, locks) = gateway(|_| {});
        let ctx = context();

        let resources = vec!["b".to_string(), "a".to_string()];
        let holders = Arc::new(parking_lot::Mutex::new(Vec::new()));
        {
            let locks = Arc::clone(&locks);
            let holders = Arc::clone(&holders);
            gateway
                .call(&ctx, &resources, || {
                    let locks = Arc::clone(&locks);
                    let holders = Arc::clone(&holders);
                    async move {
                        holders.lock().push((locks.holder("a"), locks.holder("b")));
                        Ok(())
                    }
                })
                .await
                .unwrap();
        }

        // Both held during the call, both free afterwards.
        let seen = holders.lock();
        assert_eq!(
            seen[0],
            (
                Some(AgentId::new("caller-1")),
                Some(AgentId::new("caller-1"))
            )
        );
        assert_eq!(locks.holder("a"), None);
        assert_eq!(locks.holder("b"), None);
    }

    #[tokio::test]
    async fn test_precheck_rejects_held_resource() {
        let (gateway, locks) = gateway(|_| {});
        let ctx = context();

        locks.acquire("a", &ctx.agent, 0).await.unwrap();

        let err = gateway
            .call(&ctx, &[String::from("a")], || async { Ok(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, WardenError::ResourceHeld { .. }));
        // The pre-existing hold is untouched.
        assert_eq!(locks.holder("a"), Some(ctx.agent.clone()));
    }

    #[tokio::test]
    async fn test_breaker_opens_after_threshold() {
        let (gateway, _locks) = gateway(|c| {
            c.breaker.failure_threshold = 2;
            c.retry.max_attempts = 1;
        });
        let ctx = context();

        for _ in 0..2 {
            let _ = gateway
                .call(&ctx, &[], || async {
                    Err::<(), _>(WardenError::Remote {
                        endpoint: "search".into(),
                        message: "boom".into(),
                    })
                })
                .await;
        }
        assert_eq!(gateway.circuit_state("search"), CircuitState::Open);

        // Rejected without invoking the operation.
        let invoked = Arc::new(AtomicU32::new(0));
        let err = {
            let invoked = Arc::clone(&invoked);
            gateway
                .call(&ctx, &[], move || {
                    let invoked = Arc::clone(&invoked);
                    async move {
                        invoked.fetch_add(1, Ordering::Relaxed);
                        Ok(())
                    }
                })
                .await
                .unwrap_err()
        };
        assert!(matches!(err, WardenError::CircuitOpen { .. }));
        assert_eq!(invoked.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_breaker_recovers_through_half_open() {
        let (gateway, _locks) = gateway(|c| {
            c.breaker.failure_threshold = 1;
            c.breaker.recovery_timeout_ms = 30;
            c.retry.max_attempts = 1;
        });
        let ctx = context();

        let _ = gateway
            .call(&ctx, &[], || async {
                Err::<(), _>(WardenError::Remote {
                    endpoint: "search".into(),
                    message: "boom".into(),
                })
            })
            .await;
        assert_eq!(gateway.circuit_state("search"), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(50)).await;

        // Half-open probe succeeds and closes the circuit.
        gateway.call(&ctx, &[], || async { Ok(()) }).await.unwrap();
        assert_eq!(gateway.circuit_state("search"), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_timeout_emits_typed_event() {
        let (gateway, locks) = gateway(|c| {
            c.call_timeout_ms = 30;
            c.retry.max_attempts = 1;
        });
        let ctx = context();
        let mut receiver = gateway.events.subscribe();

        let err = gateway
            .call(&ctx, &[String::from("a")], || async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, WardenError::CallTimeout { .. }));

        // Resources were released before the event was published.
        assert_eq!(locks.holder("a"), None);

        let mut saw_timeout = false;
        while let Some(event) = receiver.try_recv() {
            if let CoordinationEvent::ExternalCallTimeout { context } = event {
                assert_eq!(context, ctx);
                saw_timeout = true;
            }
        }
        assert!(saw_timeout);
    }

    #[tokio::test]
    async fn test_retry_recovers_transient_failure() {
        let (gateway, _locks) = gateway(|c| {
            c.retry.max_attempts = 3;
            // Keep the breaker out of the way.
            c.breaker.failure_threshold = 10;
        });
        let ctx = context();

        let attempts = Arc::new(AtomicU32::new(0));
        let result = {
            let attempts = Arc::clone(&attempts);
            gateway
                .call(&ctx, &[], move || {
                    let attempts = Arc::clone(&attempts);
                    async move {
                        if attempts.fetch_add(1, Ordering::Relaxed) < 2 {
                            Err(WardenError::Remote {
                                endpoint: "search".into(),
                                message: "flaky".into(),
                            })
                        } else {
                            Ok("recovered")
                        }
                    }
                })
                .await
        };

        assert_eq!(result.unwrap(), "recovered");
        assert_eq!(attempts.load(Ordering::Relaxed), 3);
        // The final success reset the breaker.
        assert_eq!(gateway.circuit_state("search"), CircuitState::Closed);
    }
}
