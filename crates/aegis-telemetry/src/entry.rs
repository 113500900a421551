//! Audit entry model
//!
//! Entries are immutable once accepted and hash-chained by the writer so
//! tampering with the on-disk log is detectable.

use aegis_core::{DecisionContext, PolicyDecision};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Terminal outcome of enforcing one request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditOutcome {
    /// Enforcement completed, response delivered
    Success,
    /// Upstream or critical-obligation failure; error returned
    Failure,
    /// Internal failure (decision timeout, constraint exception)
    Error,
}

/// Result of one enforcement step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    /// Step ran and transformed/recorded as intended
    Applied,
    /// Step raised; the request was denied or the failure logged
    Failed,
    /// Async obligation handed to the worker pool
    Queued,
    /// No processor registered for the kind
    Skipped,
}

/// Outcome of applying one constraint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConstraintResult {
    /// Constraint kind prefix
    pub kind: String,

    /// What happened
    pub status: StepStatus,

    /// Processor detail (fields masked, retry hint, ...)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Outcome of executing one obligation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObligationResult {
    /// Obligation kind prefix
    pub kind: String,

    /// What happened
    pub status: StepStatus,

    /// Executor detail
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Everything enforcement did for one request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnforcementRecord {
    /// Constraints applied, in order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub constraints: Vec<ConstraintResult>,

    /// Obligations executed or queued, in order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub obligations: Vec<ObligationResult>,

    /// One-line summary of the upstream exchange
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream: Option<String>,
}

/// Snapshot of the policy behind a decision
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicySnapshot {
    /// Policy id
    pub id: String,

    /// Version at decision time
    pub version: String,

    /// Name at decision time
    pub name: String,
}

/// One append-only audit record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Unique entry id
    pub id: String,

    /// When the entry was accepted
    pub timestamp: DateTime<Utc>,

    /// Correlation id shared with the response
    pub request_id: String,

    /// Full decision context
    pub context: DecisionContext,

    /// Full decision
    pub decision: PolicyDecision,

    /// Policy snapshot, when a policy produced the outcome
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy: Option<PolicySnapshot>,

    /// What enforcement did
    #[serde(default)]
    pub enforcement: EnforcementRecord,

    /// Total request duration
    pub duration_ms: u64,

    /// Terminal outcome
    pub outcome: AuditOutcome,

    /// Chain hash of this entry (set by the writer)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,

    /// Hash of the previous entry (set by the writer)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_hash: Option<String>,
}

impl AuditEntry {
    /// Build an entry for a finished request
    pub fn new(
        context: DecisionContext,
        decision: PolicyDecision,
        outcome: AuditOutcome,
        duration_ms: u64,
    ) -> Self {
        Self {
            id: format!("aud_{}", uuid::Uuid::new_v4()),
            timestamp: Utc::now(),
            request_id: context.request_id.clone(),
            context,
            decision,
            policy: None,
            enforcement: EnforcementRecord::default(),
            duration_ms,
            outcome,
            hash: None,
            previous_hash: None,
        }
    }

    /// Attach the policy snapshot
    pub fn with_policy(mut self, snapshot: PolicySnapshot) -> Self {
        self.policy = Some(snapshot);
        self
    }

    /// Attach the enforcement record
    pub fn with_enforcement(mut self, enforcement: EnforcementRecord) -> Self {
        self.enforcement = enforcement;
        self
    }

    /// Chain hash over the entry's identifying fields and the previous hash
    pub fn compute_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.id.as_bytes());
        hasher.update(self.request_id.as_bytes());
        hasher.update(self.timestamp.to_rfc3339().as_bytes());
        hasher.update(self.decision.reason.as_bytes());
        hasher.update(format!("{:?}", self.outcome).as_bytes());
        if let Some(prev) = &self.previous_hash {
            hasher.update(prev.as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }
}

/// Verify a chain of entries in write order
pub fn verify_chain(entries: &[AuditEntry]) -> bool {
    let mut prev: Option<&str> = None;
    for entry in entries {
        if entry.previous_hash.as_deref() != prev {
            return false;
        }
        match &entry.hash {
            Some(hash) if *hash == entry.compute_hash() => prev = Some(hash),
            _ => return false,
        }
    }
    true
}
