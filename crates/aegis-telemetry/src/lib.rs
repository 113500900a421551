//! Aegis telemetry
//!
//! The append-only, hash-chained audit trail with daily rotation and a query
//! layer, plus the Prometheus metrics bootstrap.

pub mod entry;
pub mod metrics;
pub mod service;
pub mod store;

pub use entry::{
    verify_chain, AuditEntry, AuditOutcome, ConstraintResult, EnforcementRecord, ObligationResult,
    PolicySnapshot, StepStatus,
};
pub use metrics::init_metrics;
pub use service::AuditService;
pub use store::{AuditQuery, AuditReader, AuditStats, AuditStoreConfig, AuditWriter};
