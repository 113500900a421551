//! Audit-log obligation executor
//!
//! Sync and critical: a request whose audit record cannot be accepted must
//! not succeed. The detail level controls how much of the exchange lands in
//! the entry.

use crate::obligation::{ExecutionClass, ObligationExchange, ObligationExecutor};
use aegis_core::{AuditLevel, Error, ObligationSpec, Result};
use aegis_telemetry::{AuditEntry, AuditService};
use async_trait::async_trait;
use std::sync::Arc;

/// Executor writing the request's audit entry
pub struct AuditLogExecutor {
    service: Arc<AuditService>,
}

impl AuditLogExecutor {
    /// Create over the shared audit service
    pub fn new(service: Arc<AuditService>) -> Self {
        Self { service }
    }

    fn build_entry(exchange: &ObligationExchange, level: AuditLevel) -> AuditEntry {
        let mut context = exchange.ctx.clone();
        let mut decision = exchange.decision.clone();

        if level == AuditLevel::Basic {
            // Outcome and identity only; the enrichment bag stays out.
            context.environment.clear();
            decision.constraints.clear();
            decision.obligations.clear();
        }

        let mut entry = AuditEntry::new(
            context,
            decision,
            exchange.outcome,
            exchange.duration_ms,
        );
        if level != AuditLevel::Basic {
            entry = entry.with_enforcement(exchange.enforcement.clone());
        }
        if let Some(snapshot) = &exchange.policy {
            entry = entry.with_policy(snapshot.clone());
        }
        entry
    }
}

#[async_trait]
impl ObligationExecutor for AuditLogExecutor {
    fn prefixes(&self) -> &[&str] {
        &["audit-log"]
    }

    fn class(&self) -> ExecutionClass {
        ExecutionClass::Sync
    }

    fn critical(&self) -> bool {
        true
    }

    async fn execute(&self, spec: &ObligationSpec, exchange: &ObligationExchange) -> Result<()> {
        let level = match spec {
            ObligationSpec::AuditLog { level, .. } => *level,
            ObligationSpec::Custom { .. } => AuditLevel::Detailed,
            other => {
                return Err(Error::Obligation(format!(
                    "audit executor given a '{}' descriptor",
                    other.kind()
                )))
            }
        };

        self.service.try_record(Self::build_entry(exchange, level))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_core::{DecisionContext, DecisionMetadata, PolicyDecision};
    use aegis_telemetry::{
        AuditOutcome, AuditQuery, AuditStoreConfig, ConstraintResult, EnforcementRecord,
        StepStatus,
    };
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn exchange() -> ObligationExchange {
        let mut ctx = DecisionContext::new("agent-1", "tools/call", "fs__read_file");
        let mut bag = BTreeMap::new();
        bag.insert("hour".to_string(), serde_json::json!(10));
        ctx.merge_attributes("time", bag);

        ObligationExchange {
            ctx,
            decision: PolicyDecision::permit("ok", DecisionMetadata::structured("p1")),
            policy: None,
            enforcement: EnforcementRecord {
                constraints: vec![ConstraintResult {
                    kind: "anonymize".to_string(),
                    status: StepStatus::Applied,
                    detail: None,
                }],
                obligations: vec![],
                upstream: Some("fs: ok".to_string()),
            },
            duration_ms: 9,
            outcome: AuditOutcome::Success,
        }
    }

    async fn service(dir: &TempDir) -> Arc<AuditService> {
        Arc::new(
            AuditService::new(AuditStoreConfig {
                dir: dir.path().to_path_buf(),
                flush_every: 1,
                retention_days: 7,
            })
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_detailed_entry_carries_enforcement() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir).await;
        let executor = AuditLogExecutor::new(Arc::clone(&service));

        executor
            .execute(
                &ObligationSpec::AuditLog {
                    level: AuditLevel::Detailed,
                    format: None,
                },
                &exchange(),
            )
            .await
            .unwrap();

        service.flush();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let entries = service.query(&AuditQuery::new()).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].enforcement.constraints.len(), 1);
        assert_eq!(entries[0].enforcement.upstream.as_deref(), Some("fs: ok"));
        assert_eq!(entries[0].request_id, entries[0].context.request_id);
    }

    #[tokio::test]
    async fn test_basic_entry_trims_context() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir).await;
        let executor = AuditLogExecutor::new(Arc::clone(&service));

        executor
            .execute(
                &ObligationSpec::AuditLog {
                    level: AuditLevel::Basic,
                    format: None,
                },
                &exchange(),
            )
            .await
            .unwrap();

        service.flush();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let entries = service.query(&AuditQuery::new()).unwrap();
        assert!(entries[0].context.environment.is_empty());
        assert!(entries[0].enforcement.constraints.is_empty());
    }
}
