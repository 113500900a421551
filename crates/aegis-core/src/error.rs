//! Error types for Aegis

use crate::rpc;

/// Result type alias using Aegis's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for Aegis operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed JSON-RPC payload or closed transport
    #[error("transport error: {0}")]
    Transport(String),

    /// Missing or invalid bearer token
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Request rejected by a policy decision
    #[error("denied by policy: {reason}")]
    PolicyDeny {
        /// Human-readable denial reason
        reason: String,
        /// Policy that produced the decision, if any
        policy_id: Option<String>,
    },

    /// A constraint processor raised during enforcement
    #[error("constraint failure: {0}")]
    Constraint(String),

    /// Sliding-window rate limit exceeded
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited {
        /// Milliseconds until the oldest admission leaves the window
        retry_after_ms: u64,
    },

    /// Upstream failed to spawn, crashed, or timed out
    #[error("upstream unavailable: {0}")]
    Upstream(String),

    /// The decision engine exceeded its deadline
    #[error("decision timed out after {0}ms")]
    DecisionTimeout(u64),

    /// Transient failure from the LLM judge (network, 5xx)
    #[error("llm transient failure: {0}")]
    LlmTransient(String),

    /// The LLM response did not match the expected schema
    #[error("llm schema violation: {0}")]
    LlmSchema(String),

    /// A critical obligation executor failed
    #[error("obligation failure: {0}")]
    Obligation(String),

    /// Policy store errors
    #[error("policy store error: {0}")]
    Store(String),

    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    /// Network/IO errors
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic internal errors
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create a new authentication error
    pub fn auth(msg: impl Into<String>) -> Self {
        Self::Auth(msg.into())
    }

    /// Create a policy denial error
    pub fn deny(reason: impl Into<String>, policy_id: Option<String>) -> Self {
        Self::PolicyDeny {
            reason: reason.into(),
            policy_id,
        }
    }

    /// Create a new constraint failure
    pub fn constraint(msg: impl Into<String>) -> Self {
        Self::Constraint(msg.into())
    }

    /// Create a new upstream error
    pub fn upstream(msg: impl Into<String>) -> Self {
        Self::Upstream(msg.into())
    }

    /// Create a new policy store error
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether this error is worth retrying (LLM judge retry loop)
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::LlmTransient(_))
    }

    /// JSON-RPC error code this error maps to on the wire
    pub fn rpc_code(&self) -> i64 {
        match self {
            Self::Transport(_) => rpc::INVALID_REQUEST,
            Self::Auth(_) => rpc::INVALID_REQUEST,
            Self::PolicyDeny { .. } => rpc::ACCESS_DENIED,
            Self::Constraint(_) | Self::Obligation(_) => rpc::POLICY_VIOLATION,
            Self::RateLimited { .. } => rpc::RATE_LIMITED,
            Self::Upstream(_) => rpc::ACCESS_DENIED,
            Self::DecisionTimeout(_) => rpc::ACCESS_DENIED,
            Self::Serialization(_) => rpc::PARSE_ERROR,
            _ => rpc::INTERNAL_ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::LlmTransient("connection reset".into()).is_transient());
        assert!(!Error::LlmSchema("missing field".into()).is_transient());
        assert!(!Error::internal("boom").is_transient());
    }

    #[test]
    fn test_rpc_code_mapping() {
        assert_eq!(Error::deny("no", None).rpc_code(), rpc::ACCESS_DENIED);
        assert_eq!(
            Error::RateLimited { retry_after_ms: 50 }.rpc_code(),
            rpc::RATE_LIMITED
        );
        assert_eq!(Error::constraint("boom").rpc_code(), rpc::POLICY_VIOLATION);
        assert_eq!(Error::internal("boom").rpc_code(), rpc::INTERNAL_ERROR);
    }
}
