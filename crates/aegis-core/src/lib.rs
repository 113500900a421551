//! Aegis core types
//!
//! Shared vocabulary of the Aegis policy enforcement proxy: the decision
//! context assembled per request, the decision model produced by the decision
//! point, the constraint/obligation descriptors consumed by the enforcement
//! layer, the JSON-RPC wire format, and the crate-wide error type.

pub mod context;
pub mod decision;
pub mod descriptors;
pub mod error;
pub mod rpc;

pub use context::{AgentAttributes, DecisionContext, ResourceAttributes};
pub use decision::{
    DecisionMetadata, DecisionOutcome, EngineKind, PolicyDecision, TokenUsage,
};
pub use descriptors::{
    AnonymizeMethod, AuditLevel, ConstraintSpec, LifecycleAction, ObligationSpec, RateLimitScope,
};
pub use error::{Error, Result};
