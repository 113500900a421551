//! Policy decision model

use crate::descriptors::{ConstraintSpec, ObligationSpec};
use serde::{Deserialize, Serialize};

/// Outcome of a policy evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionOutcome {
    /// Request may proceed, subject to constraints and obligations
    Permit,
    /// Request is rejected
    Deny,
    /// Evaluation could not reach a confident answer; enforced as deny
    Indeterminate,
    /// No policy matched the request; enforced as deny
    NotApplicable,
}

impl DecisionOutcome {
    /// Collapse to the outcome the enforcement point acts on.
    ///
    /// Indeterminate and not-applicable are both denied on the wire but stay
    /// distinguishable in the decision and the audit trail.
    pub fn enforced(self) -> DecisionOutcome {
        match self {
            Self::Permit => Self::Permit,
            _ => Self::Deny,
        }
    }
}

impl std::fmt::Display for DecisionOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Permit => "PERMIT",
            Self::Deny => "DENY",
            Self::Indeterminate => "INDETERMINATE",
            Self::NotApplicable => "NOT_APPLICABLE",
        };
        f.write_str(s)
    }
}

/// Which engine produced a decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// Structured rule evaluator
    Structured,
    /// Language-model judge
    Llm,
    /// Served from the decision cache
    Cache,
}

/// Token accounting for an LLM-judged decision
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Prompt tokens consumed
    pub prompt: u32,
    /// Completion tokens consumed
    pub completion: u32,
}

/// Metadata about how a decision was produced
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionMetadata {
    /// Policy that produced the outcome, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy_id: Option<String>,

    /// Why this policy was selected
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selection_reason: Option<String>,

    /// Engine that produced the outcome
    pub engine: EngineKind,

    /// Wall-clock evaluation time in milliseconds
    pub processing_time_ms: u64,

    /// Model identifier when the LLM judge was involved
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Judge attempts including retries
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,

    /// Token usage when the LLM judge was involved
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens: Option<TokenUsage>,
}

impl DecisionMetadata {
    /// Metadata for a structured-engine decision
    pub fn structured(policy_id: impl Into<String>) -> Self {
        Self {
            policy_id: Some(policy_id.into()),
            selection_reason: None,
            engine: EngineKind::Structured,
            processing_time_ms: 0,
            model: None,
            attempts: None,
            tokens: None,
        }
    }

    /// Metadata for an LLM-judged decision
    pub fn llm(policy_id: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            policy_id: Some(policy_id.into()),
            selection_reason: None,
            engine: EngineKind::Llm,
            processing_time_ms: 0,
            model: Some(model.into()),
            attempts: None,
            tokens: None,
        }
    }

    /// Metadata for a decision with no applicable policy
    pub fn none() -> Self {
        Self {
            policy_id: None,
            selection_reason: None,
            engine: EngineKind::Structured,
            processing_time_ms: 0,
            model: None,
            attempts: None,
            tokens: None,
        }
    }
}

/// A single policy decision returned by the decision point
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyDecision {
    /// The outcome
    pub outcome: DecisionOutcome,

    /// Human-readable explanation
    pub reason: String,

    /// Confidence in [0, 1]; 1.0 for structured rules
    pub confidence: f64,

    /// Transformations to apply, in order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub constraints: Vec<ConstraintSpec>,

    /// Actions that must accompany enforcement, in order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub obligations: Vec<ObligationSpec>,

    /// Provenance and accounting
    pub metadata: DecisionMetadata,
}

impl PolicyDecision {
    /// A full-confidence permit
    pub fn permit(reason: impl Into<String>, metadata: DecisionMetadata) -> Self {
        Self {
            outcome: DecisionOutcome::Permit,
            reason: reason.into(),
            confidence: 1.0,
            constraints: Vec::new(),
            obligations: Vec::new(),
            metadata,
        }
    }

    /// A full-confidence deny
    pub fn deny(reason: impl Into<String>, metadata: DecisionMetadata) -> Self {
        Self {
            outcome: DecisionOutcome::Deny,
            reason: reason.into(),
            confidence: 1.0,
            constraints: Vec::new(),
            obligations: Vec::new(),
            metadata,
        }
    }

    /// An indeterminate result (enforced as deny, audited distinctly)
    pub fn indeterminate(reason: impl Into<String>, metadata: DecisionMetadata) -> Self {
        Self {
            outcome: DecisionOutcome::Indeterminate,
            reason: reason.into(),
            confidence: 0.0,
            constraints: Vec::new(),
            obligations: Vec::new(),
            metadata,
        }
    }

    /// No policy matched the request
    pub fn not_applicable() -> Self {
        Self {
            outcome: DecisionOutcome::NotApplicable,
            reason: "no applicable policy".to_string(),
            confidence: 1.0,
            constraints: Vec::new(),
            obligations: Vec::new(),
            metadata: DecisionMetadata::none(),
        }
    }

    /// Attach constraints
    pub fn with_constraints(mut self, constraints: Vec<ConstraintSpec>) -> Self {
        self.constraints = constraints;
        self
    }

    /// Attach obligations
    pub fn with_obligations(mut self, obligations: Vec<ObligationSpec>) -> Self {
        self.obligations = obligations;
        self
    }

    /// Set the confidence
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }

    /// Whether enforcement lets the request through
    pub fn is_permit(&self) -> bool {
        self.outcome == DecisionOutcome::Permit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enforced_outcome_collapse() {
        assert_eq!(DecisionOutcome::Permit.enforced(), DecisionOutcome::Permit);
        assert_eq!(DecisionOutcome::Deny.enforced(), DecisionOutcome::Deny);
        assert_eq!(
            DecisionOutcome::Indeterminate.enforced(),
            DecisionOutcome::Deny
        );
        assert_eq!(
            DecisionOutcome::NotApplicable.enforced(),
            DecisionOutcome::Deny
        );
    }

    #[test]
    fn test_confidence_is_clamped() {
        let d = PolicyDecision::permit("ok", DecisionMetadata::structured("p1"))
            .with_confidence(1.7);
        assert_eq!(d.confidence, 1.0);
    }

    #[test]
    fn test_not_applicable_reason() {
        let d = PolicyDecision::not_applicable();
        assert_eq!(d.outcome, DecisionOutcome::NotApplicable);
        assert_eq!(d.reason, "no applicable policy");
        assert!(!d.is_permit());
    }

    #[test]
    fn test_outcome_wire_format() {
        let json = serde_json::to_string(&DecisionOutcome::NotApplicable).unwrap();
        assert_eq!(json, "\"NOT_APPLICABLE\"");
    }
}
