//! Constraint and obligation descriptors carried by decisions
//!
//! A descriptor names *what* enforcement must happen; the registered
//! processors in the enforcement layer decide *how*. Descriptors are
//! dispatched by kind prefix, so deployments can register new kinds without
//! touching the decision model.

use serde::{Deserialize, Serialize};

/// How anonymized fields are rewritten
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AnonymizeMethod {
    /// Keep the first and last character, star the middle
    #[default]
    Mask,
    /// Replace with a stable opaque token
    Tokenize,
    /// Replace with a sha-256 hex digest
    Hash,
}

/// Rate-limit scope key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RateLimitScope {
    /// One window per agent id
    #[default]
    PerAgent,
    /// A single shared window
    Global,
}

/// A transformation applied to a permitted request or response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
#[serde(rename_all = "kebab-case")]
pub enum ConstraintSpec {
    /// Mask, tokenize, or hash sensitive fields in the payload
    Anonymize {
        /// Rewrite method
        #[serde(default)]
        method: AnonymizeMethod,

        /// Fields to rewrite; when absent, PII is auto-detected
        #[serde(skip_serializing_if = "Option::is_none")]
        fields: Option<Vec<String>>,
    },

    /// Sliding-window admission control
    RateLimit {
        /// Maximum admissions per window
        limit: u32,

        /// Window length in milliseconds
        window_ms: u64,

        /// Scope key
        #[serde(default)]
        scope: RateLimitScope,
    },

    /// Restrict by request origin
    GeoRestrict {
        /// Locations that are always admitted
        #[serde(skip_serializing_if = "Option::is_none")]
        allow: Option<Vec<String>>,

        /// Locations that are rejected
        #[serde(skip_serializing_if = "Option::is_none")]
        block: Option<Vec<String>>,

        /// Require the security enricher's VPN flag
        #[serde(default)]
        require_vpn: bool,
    },

    /// Free-text constraint for processors registered at runtime
    Custom {
        /// Kind prefix used for registry dispatch
        kind: String,

        /// Processor-specific description
        text: String,
    },
}

impl ConstraintSpec {
    /// Kind prefix used to select a registered processor
    pub fn kind(&self) -> &str {
        match self {
            Self::Anonymize { .. } => "anonymize",
            Self::RateLimit { .. } => "rate-limit",
            Self::GeoRestrict { .. } => "geo-restrict",
            Self::Custom { kind, .. } => kind,
        }
    }

    /// Stable key for deduplicating descriptors merged from several policies
    pub fn dedup_key(&self) -> String {
        // serde field order is declaration order, so the encoding is canonical
        format!(
            "{}:{}",
            self.kind(),
            serde_json::to_string(self).unwrap_or_default()
        )
    }
}

/// Audit detail level requested by an obligation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AuditLevel {
    /// Outcome and ids only
    Basic,
    /// Adds the enforcement record
    #[default]
    Detailed,
    /// Full context and decision
    Full,
}

/// Deferred data-lifecycle action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleAction {
    /// Remove the data
    Delete,
    /// Move to cold storage
    Archive,
    /// Pin against deletion
    Retain,
}

/// An action that must be performed as part of enforcement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
#[serde(rename_all = "kebab-case")]
pub enum ObligationSpec {
    /// Record the decision in the audit store
    AuditLog {
        /// Detail level
        #[serde(default)]
        level: AuditLevel,

        /// Output format hint
        #[serde(skip_serializing_if = "Option::is_none")]
        format: Option<String>,
    },

    /// Notify a channel about the decision
    Notify {
        /// Delivery channel name
        channel: String,

        /// Recipient identifiers
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        recipients: Vec<String>,

        /// Only notify on this outcome (e.g. "deny")
        #[serde(skip_serializing_if = "Option::is_none")]
        on_decision: Option<String>,
    },

    /// Schedule a future lifecycle action against the resource
    Lifecycle {
        /// What happens when the timer fires
        action: LifecycleAction,

        /// Delay before the action in milliseconds
        after_ms: u64,
    },

    /// Free-text obligation for executors registered at runtime
    Custom {
        /// Kind prefix used for registry dispatch
        kind: String,

        /// Executor-specific description
        text: String,
    },
}

impl ObligationSpec {
    /// Kind prefix used to select a registered executor
    pub fn kind(&self) -> &str {
        match self {
            Self::AuditLog { .. } => "audit-log",
            Self::Notify { .. } => "notify",
            Self::Lifecycle { .. } => "lifecycle",
            Self::Custom { kind, .. } => kind,
        }
    }

    /// Stable key for deduplicating descriptors merged from several policies
    pub fn dedup_key(&self) -> String {
        format!(
            "{}:{}",
            self.kind(),
            serde_json::to_string(self).unwrap_or_default()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constraint_tagged_encoding() {
        let spec = ConstraintSpec::Anonymize {
            method: AnonymizeMethod::Mask,
            fields: Some(vec!["email".into(), "phone".into()]),
        };
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["type"], "anonymize");
        assert_eq!(json["fields"][0], "email");

        let back: ConstraintSpec = serde_json::from_value(json).unwrap();
        assert_eq!(back, spec);
    }

    #[test]
    fn test_kind_dispatch_prefixes() {
        let rl = ConstraintSpec::RateLimit {
            limit: 1000,
            window_ms: 60_000,
            scope: RateLimitScope::PerAgent,
        };
        assert_eq!(rl.kind(), "rate-limit");

        let custom = ObligationSpec::Custom {
            kind: "webhook".into(),
            text: "post to the incident channel".into(),
        };
        assert_eq!(custom.kind(), "webhook");
    }

    #[test]
    fn test_dedup_key_distinguishes_parameters() {
        let a = ConstraintSpec::RateLimit {
            limit: 10,
            window_ms: 1000,
            scope: RateLimitScope::PerAgent,
        };
        let b = ConstraintSpec::RateLimit {
            limit: 20,
            window_ms: 1000,
            scope: RateLimitScope::PerAgent,
        };
        assert_ne!(a.dedup_key(), b.dedup_key());
        assert_eq!(a.dedup_key(), a.clone().dedup_key());
    }
}
