//! Obligation executor contract, registry, and async worker pool

use aegis_core::{DecisionContext, Error, ObligationSpec, PolicyDecision, Result};
use aegis_telemetry::{AuditOutcome, EnforcementRecord, ObligationResult, PolicySnapshot, StepStatus};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// When an executor runs relative to the response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionClass {
    /// Runs before the response is returned
    Sync,
    /// Queued to the background worker pool
    Async,
}

/// Everything an executor may read about the finished request
#[derive(Debug, Clone)]
pub struct ObligationExchange {
    /// Enriched decision context
    pub ctx: DecisionContext,

    /// The decision being enforced
    pub decision: PolicyDecision,

    /// Snapshot of the deciding policy, when one exists
    pub policy: Option<PolicySnapshot>,

    /// What enforcement did up to this point
    pub enforcement: EnforcementRecord,

    /// Total request duration so far
    pub duration_ms: u64,

    /// Terminal enforcement outcome
    pub outcome: AuditOutcome,
}

/// An action performed as part of enforcement.
///
/// Sync executors run before the response; a failing `critical` executor
/// suppresses the response entirely. Async executors run on the worker pool
/// and their failures are recorded but never affect the response.
#[async_trait]
pub trait ObligationExecutor: Send + Sync {
    /// Kind prefixes this executor handles
    fn prefixes(&self) -> &[&str];

    /// Whether the executor runs before the response or in the background
    fn class(&self) -> ExecutionClass;

    /// Whether a failure must suppress the response
    fn critical(&self) -> bool {
        false
    }

    /// Perform the obligation
    async fn execute(&self, spec: &ObligationSpec, exchange: &ObligationExchange) -> Result<()>;

    /// Accept a runtime configuration update
    fn update_config(&self, _config: &Value) -> Result<()> {
        Ok(())
    }
}

struct Job {
    executor: Arc<dyn ObligationExecutor>,
    spec: ObligationSpec,
    exchange: Arc<ObligationExchange>,
}

/// Counters exposed by the registry
#[derive(Debug, Clone, Copy, Default)]
pub struct ObligationStats {
    /// Executors currently registered
    pub registered: usize,

    /// Executions completed (sync and async)
    pub executed: u64,

    /// Executions failed
    pub failed: u64,
}

/// Registry of obligation executors with a supervised worker pool
pub struct ObligationRegistry {
    executors: RwLock<Vec<Arc<dyn ObligationExecutor>>>,
    queue: mpsc::UnboundedSender<Job>,
    executed: Arc<AtomicU64>,
    failed: Arc<AtomicU64>,
}

impl ObligationRegistry {
    /// Create a registry with `workers` background tasks
    pub fn new(workers: usize) -> Self {
        let (queue, receiver) = mpsc::unbounded_channel::<Job>();
        let executed = Arc::new(AtomicU64::new(0));
        let failed = Arc::new(AtomicU64::new(0));

        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        for worker in 0..workers.max(1) {
            let receiver = Arc::clone(&receiver);
            let executed = Arc::clone(&executed);
            let failed = Arc::clone(&failed);
            tokio::spawn(async move {
                loop {
                    let job = { receiver.lock().await.recv().await };
                    let Some(job) = job else { break };
                    match job.executor.execute(&job.spec, &job.exchange).await {
                        Ok(()) => {
                            executed.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => {
                            failed.fetch_add(1, Ordering::Relaxed);
                            error!(worker, kind = %job.spec.kind(),
                                "async obligation failed: {}", e);
                        }
                    }
                }
                debug!(worker, "obligation worker stopped");
            });
        }

        Self {
            executors: RwLock::new(Vec::new()),
            queue,
            executed,
            failed,
        }
    }

    /// Register an executor at runtime
    pub fn register(&self, executor: Arc<dyn ObligationExecutor>) {
        self.executors.write().push(executor);
    }

    /// Remove every executor handling the given prefix
    pub fn unregister(&self, prefix: &str) {
        self.executors
            .write()
            .retain(|e| !e.prefixes().contains(&prefix));
    }

    /// Forward a configuration update to the executor for a prefix
    pub fn update_config(&self, prefix: &str, config: &Value) -> Result<()> {
        let executor = self
            .find(prefix)
            .ok_or_else(|| Error::config(format!("no obligation executor for '{}'", prefix)))?;
        executor.update_config(config)
    }

    /// Registry counters
    pub fn stats(&self) -> ObligationStats {
        ObligationStats {
            registered: self.executors.read().len(),
            executed: self.executed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    fn find(&self, kind: &str) -> Option<Arc<dyn ObligationExecutor>> {
        self.executors
            .read()
            .iter()
            .find(|e| e.prefixes().iter().any(|prefix| kind.starts_with(prefix)))
            .cloned()
    }

    /// Execute the decision's obligations in order.
    ///
    /// Sync executors run inline; async ones are queued. Returns the
    /// per-obligation results, or an error when a critical sync executor
    /// failed (the caller must suppress the response).
    pub async fn execute_all(
        &self,
        specs: &[ObligationSpec],
        exchange: Arc<ObligationExchange>,
    ) -> Result<Vec<ObligationResult>> {
        let mut results = Vec::with_capacity(specs.len());

        for spec in specs {
            let kind = spec.kind().to_string();
            let Some(executor) = self.find(&kind) else {
                warn!(kind = %kind, "no executor registered, obligation skipped");
                results.push(ObligationResult {
                    kind,
                    status: StepStatus::Skipped,
                    detail: Some("no executor registered".to_string()),
                });
                continue;
            };

            match executor.class() {
                ExecutionClass::Sync => match executor.execute(spec, &exchange).await {
                    Ok(()) => {
                        self.executed.fetch_add(1, Ordering::Relaxed);
                        results.push(ObligationResult {
                            kind,
                            status: StepStatus::Applied,
                            detail: None,
                        });
                    }
                    Err(e) if executor.critical() => {
                        self.failed.fetch_add(1, Ordering::Relaxed);
                        error!(kind = %kind, "critical obligation failed: {}", e);
                        return Err(Error::Obligation(format!(
                            "critical obligation '{}' failed: {}",
                            kind, e
                        )));
                    }
                    Err(e) => {
                        self.failed.fetch_add(1, Ordering::Relaxed);
                        warn!(kind = %kind, "obligation failed: {}", e);
                        results.push(ObligationResult {
                            kind,
                            status: StepStatus::Failed,
                            detail: Some(e.to_string()),
                        });
                    }
                },
                ExecutionClass::Async => {
                    let job = Job {
                        executor,
                        spec: spec.clone(),
                        exchange: Arc::clone(&exchange),
                    };
                    if self.queue.send(job).is_err() {
                        warn!(kind = %kind, "worker pool gone, obligation dropped");
                        results.push(ObligationResult {
                            kind,
                            status: StepStatus::Failed,
                            detail: Some("worker pool unavailable".to_string()),
                        });
                    } else {
                        results.push(ObligationResult {
                            kind,
                            status: StepStatus::Queued,
                            detail: None,
                        });
                    }
                }
            }
        }

        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_core::{AuditLevel, DecisionMetadata};
    use std::sync::atomic::AtomicU32;

    fn exchange() -> Arc<ObligationExchange> {
        Arc::new(ObligationExchange {
            ctx: DecisionContext::new("a", "tools/call", "r"),
            decision: PolicyDecision::permit("ok", DecisionMetadata::structured("p1")),
            policy: None,
            enforcement: EnforcementRecord::default(),
            duration_ms: 1,
            outcome: AuditOutcome::Success,
        })
    }

    struct Recording {
        class: ExecutionClass,
        critical: bool,
        fail: bool,
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl ObligationExecutor for Recording {
        fn prefixes(&self) -> &[&str] {
            &["audit-log", "notify"]
        }

        fn class(&self) -> ExecutionClass {
            self.class
        }

        fn critical(&self) -> bool {
            self.critical
        }

        async fn execute(
            &self,
            _spec: &ObligationSpec,
            _exchange: &ObligationExchange,
        ) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(Error::Obligation("boom".to_string()))
            } else {
                Ok(())
            }
        }
    }

    fn audit_spec() -> ObligationSpec {
        ObligationSpec::AuditLog {
            level: AuditLevel::Detailed,
            format: None,
        }
    }

    #[tokio::test]
    async fn test_sync_executor_runs_inline() {
        let registry = ObligationRegistry::new(1);
        let calls = Arc::new(AtomicU32::new(0));
        registry.register(Arc::new(Recording {
            class: ExecutionClass::Sync,
            critical: false,
            fail: false,
            calls: Arc::clone(&calls),
        }));

        let results = registry
            .execute_all(&[audit_spec()], exchange())
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(results[0].status, StepStatus::Applied);
    }

    #[tokio::test]
    async fn test_critical_failure_propagates() {
        let registry = ObligationRegistry::new(1);
        registry.register(Arc::new(Recording {
            class: ExecutionClass::Sync,
            critical: true,
            fail: true,
            calls: Arc::new(AtomicU32::new(0)),
        }));

        let err = registry
            .execute_all(&[audit_spec()], exchange())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Obligation(_)));
    }

    #[tokio::test]
    async fn test_noncritical_failure_recorded_and_continues() {
        let registry = ObligationRegistry::new(1);
        registry.register(Arc::new(Recording {
            class: ExecutionClass::Sync,
            critical: false,
            fail: true,
            calls: Arc::new(AtomicU32::new(0)),
        }));

        let results = registry
            .execute_all(&[audit_spec(), audit_spec()], exchange())
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.status == StepStatus::Failed));
    }

    #[tokio::test]
    async fn test_async_executor_queued_to_pool() {
        let registry = ObligationRegistry::new(2);
        let calls = Arc::new(AtomicU32::new(0));
        registry.register(Arc::new(Recording {
            class: ExecutionClass::Async,
            critical: false,
            fail: false,
            calls: Arc::clone(&calls),
        }));

        let results = registry
            .execute_all(&[audit_spec()], exchange())
            .await
            .unwrap();
        assert_eq!(results[0].status, StepStatus::Queued);

        // give the pool a moment to drain
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(registry.stats().executed, 1);
    }

    #[tokio::test]
    async fn test_unknown_kind_is_skipped() {
        let registry = ObligationRegistry::new(1);
        let results = registry
            .execute_all(
                &[ObligationSpec::Custom {
                    kind: "webhook".to_string(),
                    text: String::new(),
                }],
                exchange(),
            )
            .await
            .unwrap();
        assert_eq!(results[0].status, StepStatus::Skipped);
    }
}
