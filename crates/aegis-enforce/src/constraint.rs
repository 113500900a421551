//! Constraint processor contract and registry

use aegis_core::{ConstraintSpec, DecisionContext, Error, Result};
use aegis_telemetry::{ConstraintResult, StepStatus};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// A payload transformation applied on behalf of a decision.
///
/// Processors transform the payload they are given and nothing else; any
/// failure is deny-worthy and stops the request before partial data leaks.
#[async_trait]
pub trait ConstraintProcessor: Send + Sync {
    /// Kind prefixes this processor handles
    fn prefixes(&self) -> &[&str];

    /// Apply the constraint, returning the transformed payload
    async fn apply(
        &self,
        spec: &ConstraintSpec,
        payload: Value,
        ctx: &DecisionContext,
    ) -> Result<Value>;

    /// Accept a runtime configuration update
    fn update_config(&self, _config: &Value) -> Result<()> {
        Ok(())
    }
}

/// Counters exposed by a registry
#[derive(Debug, Clone, Copy, Default)]
pub struct RegistryStats {
    /// Processors currently registered
    pub registered: usize,

    /// Successful applications since start
    pub applied: u64,

    /// Failed applications since start
    pub failed: u64,
}

/// Result of applying a decision's constraint list
#[derive(Debug)]
pub struct ApplyOutcome {
    /// Transformed payload; absent when a processor failed
    pub payload: Option<Value>,

    /// Per-constraint results in application order
    pub results: Vec<ConstraintResult>,

    /// The failure that stopped application, if any
    pub error: Option<Error>,
}

/// Registry of constraint processors keyed by kind prefix
pub struct ConstraintRegistry {
    processors: RwLock<Vec<Arc<dyn ConstraintProcessor>>>,
    applied: AtomicU64,
    failed: AtomicU64,
}

impl ConstraintRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            processors: RwLock::new(Vec::new()),
            applied: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Register a processor at runtime
    pub fn register(&self, processor: Arc<dyn ConstraintProcessor>) {
        self.processors.write().push(processor);
    }

    /// Remove every processor handling the given prefix
    pub fn unregister(&self, prefix: &str) {
        self.processors
            .write()
            .retain(|p| !p.prefixes().contains(&prefix));
    }

    /// Forward a configuration update to the processor for a prefix
    pub fn update_config(&self, prefix: &str, config: &Value) -> Result<()> {
        let processor = self
            .find(prefix)
            .ok_or_else(|| Error::config(format!("no constraint processor for '{}'", prefix)))?;
        processor.update_config(config)
    }

    /// Registry counters
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            registered: self.processors.read().len(),
            applied: self.applied.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    fn find(&self, kind: &str) -> Option<Arc<dyn ConstraintProcessor>> {
        self.processors
            .read()
            .iter()
            .find(|p| p.prefixes().iter().any(|prefix| kind.starts_with(prefix)))
            .cloned()
    }

    /// Apply the decision's constraints to the payload, in listed order.
    ///
    /// Application stops at the first failure: no partial payload is ever
    /// returned past a processor that raised.
    pub async fn apply_all(
        &self,
        specs: &[ConstraintSpec],
        mut payload: Value,
        ctx: &DecisionContext,
    ) -> ApplyOutcome {
        let mut results = Vec::with_capacity(specs.len());

        for spec in specs {
            let kind = spec.kind().to_string();
            let Some(processor) = self.find(&kind) else {
                // An unhandled constraint is a gap in enforcement; fail safe.
                self.failed.fetch_add(1, Ordering::Relaxed);
                results.push(ConstraintResult {
                    kind: kind.clone(),
                    status: StepStatus::Failed,
                    detail: Some("no processor registered".to_string()),
                });
                return ApplyOutcome {
                    payload: None,
                    results,
                    error: Some(Error::constraint(format!(
                        "no processor registered for constraint '{}'",
                        kind
                    ))),
                };
            };

            match processor.apply(spec, payload, ctx).await {
                Ok(transformed) => {
                    debug!(kind = %kind, "constraint applied");
                    self.applied.fetch_add(1, Ordering::Relaxed);
                    results.push(ConstraintResult {
                        kind,
                        status: StepStatus::Applied,
                        detail: None,
                    });
                    payload = transformed;
                }
                Err(e) => {
                    warn!(kind = %kind, "constraint failed: {}", e);
                    self.failed.fetch_add(1, Ordering::Relaxed);
                    results.push(ConstraintResult {
                        kind,
                        status: StepStatus::Failed,
                        detail: Some(e.to_string()),
                    });
                    return ApplyOutcome {
                        payload: None,
                        results,
                        error: Some(e),
                    };
                }
            }
        }

        ApplyOutcome {
            payload: Some(payload),
            results,
            error: None,
        }
    }
}

impl Default for ConstraintRegistry {
    fn default() -> Self {
        Self::new()
    }
}
