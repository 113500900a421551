//! Aegis enforcement layer
//!
//! Two near-identical registries: constraint processors transform permitted
//! payloads in the order the decision lists them, obligation executors carry
//! out the actions enforcement owes (audit, notification, lifecycle). Both
//! support dynamic registration so deployments add kinds without a restart.

pub mod anonymize;
pub mod audit_exec;
pub mod constraint;
pub mod geo;
pub mod lifecycle;
pub mod notify;
pub mod obligation;
pub mod rate_limit;

pub use anonymize::Anonymizer;
pub use audit_exec::AuditLogExecutor;
pub use constraint::{ApplyOutcome, ConstraintProcessor, ConstraintRegistry, RegistryStats};
pub use geo::GeoRestrictor;
pub use lifecycle::{DataHook, LifecycleExecutor, LogOnlyHook};
pub use notify::{NoopChannel, NotificationChannel, NotifyExecutor};
pub use obligation::{
    ExecutionClass, ObligationExchange, ObligationExecutor, ObligationRegistry, ObligationStats,
};
pub use rate_limit::RateLimiter;

use aegis_telemetry::AuditService;
use std::sync::Arc;

/// Build the constraint registry with the mandatory processors
pub fn standard_constraints() -> ConstraintRegistry {
    let registry = ConstraintRegistry::new();
    registry.register(Arc::new(Anonymizer::new()));
    registry.register(Arc::new(RateLimiter::new()));
    registry.register(Arc::new(GeoRestrictor::new()));
    registry
}

/// Build the obligation registry with the mandatory executors
pub fn standard_obligations(audit: Arc<AuditService>, workers: usize) -> ObligationRegistry {
    let registry = ObligationRegistry::new(workers);
    registry.register(Arc::new(AuditLogExecutor::new(audit)));
    registry.register(Arc::new(NotifyExecutor::default()));
    registry.register(Arc::new(LifecycleExecutor::new(Arc::new(LogOnlyHook))));
    registry
}
