//! Policy entity, versioning, and lifecycle

use crate::rules::RuleSet;
use aegis_core::{DecisionContext, Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Minimum length of a natural-language policy body
const MIN_BODY_LEN: usize = 10;

/// Semantic version, monotonically increasing per policy id
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl Version {
    /// The version every policy starts at
    pub fn initial() -> Self {
        Self {
            major: 1,
            minor: 0,
            patch: 0,
        }
    }

    /// Apply a bump, returning the next version
    pub fn bumped(self, bump: VersionBump) -> Self {
        match bump {
            VersionBump::Major => Self {
                major: self.major + 1,
                minor: 0,
                patch: 0,
            },
            VersionBump::Minor => Self {
                major: self.major,
                minor: self.minor + 1,
                patch: 0,
            },
            VersionBump::Patch => Self {
                major: self.major,
                minor: self.minor,
                patch: self.patch + 1,
            },
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for Version {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.splitn(3, '.');
        let mut next = || -> Result<u32> {
            parts
                .next()
                .ok_or_else(|| Error::store(format!("malformed version: {}", s)))?
                .parse()
                .map_err(|_| Error::store(format!("malformed version: {}", s)))
        };
        Ok(Self {
            major: next()?,
            minor: next()?,
            patch: next()?,
        })
    }
}

impl Serialize for Version {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Which component of the version an update bumps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionBump {
    Major,
    Minor,
    #[default]
    Patch,
}

/// Policy lifecycle status; transitions are one-way draft → active → deprecated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyStatus {
    Draft,
    Active,
    Deprecated,
}

impl PolicyStatus {
    /// Whether the lifecycle permits moving to `next`
    pub fn can_transition_to(self, next: PolicyStatus) -> bool {
        matches!(
            (self, next),
            (Self::Draft, Self::Active) | (Self::Active, Self::Deprecated)
        )
    }
}

/// Declared applicability used by policy selection.
///
/// An empty set means "applies to all"; a non-empty set must intersect the
/// context. Entries support a trailing `*` wildcard.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApplicableContexts {
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub agents: BTreeSet<String>,

    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub resources: BTreeSet<String>,

    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub actions: BTreeSet<String>,
}

impl ApplicableContexts {
    /// Whether the declared sets intersect the request context
    pub fn matches(&self, ctx: &DecisionContext) -> bool {
        set_matches(&self.agents, &ctx.agent_id)
            && set_matches(&self.resources, &ctx.resource)
            && set_matches(&self.actions, &ctx.action)
    }
}

fn set_matches(set: &BTreeSet<String>, value: &str) -> bool {
    if set.is_empty() {
        return true;
    }
    set.iter().any(|entry| match entry.strip_suffix('*') {
        Some(prefix) => value.starts_with(prefix),
        None => entry == value,
    })
}

/// Bookkeeping metadata attached to every policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyMetadata {
    /// Semantic version, bumped on every update
    pub version: Version,

    /// Higher priority wins ordering; more specific policies rank higher
    #[serde(default)]
    pub priority: i32,

    /// Free-form labels
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub tags: BTreeSet<String>,

    /// Principal that created the policy
    pub created_by: String,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last modification timestamp
    pub updated_at: DateTime<Utc>,

    /// Principal behind the last modification
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_by: Option<String>,

    /// Lifecycle status
    pub status: PolicyStatus,
}

/// A complete policy.
///
/// A policy carries a natural-language body and/or a structured rule set. The
/// structured form is authoritative for the rule engine; the natural text is
/// authoritative for the LLM judge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    /// Stable unique id
    pub id: Uuid,

    /// Human-readable name, unique among active policies
    pub name: String,

    /// Short description
    #[serde(default)]
    pub description: String,

    /// Natural-language body
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    /// Structured rule set
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rules: Option<RuleSet>,

    /// Versioning and lifecycle metadata
    pub metadata: PolicyMetadata,

    /// Declared applicability for selection
    #[serde(default)]
    pub applicable: ApplicableContexts,
}

impl Policy {
    /// Structural validation applied on create, update, and activation
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::store("policy name must not be empty"));
        }
        if self.text.is_none() && self.rules.is_none() {
            return Err(Error::store(
                "policy must carry natural-language text, structured rules, or both",
            ));
        }
        if let Some(text) = &self.text {
            if text.trim().len() < MIN_BODY_LEN {
                return Err(Error::store(format!(
                    "policy body must be at least {} characters",
                    MIN_BODY_LEN
                )));
            }
        }
        if let Some(rules) = &self.rules {
            if rules.is_empty() {
                return Err(Error::store("structured rule set must not be empty"));
            }
        }
        Ok(())
    }

    /// Whether this policy participates in decisions
    pub fn is_active(&self) -> bool {
        self.metadata.status == PolicyStatus::Active
    }

    /// `id@version` label used in cache keys and audit snapshots
    pub fn version_label(&self) -> String {
        format!("{}@{}", self.id, self.metadata.version)
    }
}

/// Input for creating a new draft policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyDraft {
    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub rules: Option<RuleSet>,

    #[serde(default)]
    pub priority: i32,

    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub tags: BTreeSet<String>,

    pub created_by: String,

    #[serde(default)]
    pub applicable: ApplicableContexts,
}

impl PolicyDraft {
    /// Materialize the draft into a version-1 policy
    pub fn into_policy(self) -> Policy {
        let now = Utc::now();
        Policy {
            id: Uuid::new_v4(),
            name: self.name,
            description: self.description,
            text: self.text,
            rules: self.rules,
            metadata: PolicyMetadata {
                version: Version::initial(),
                priority: self.priority,
                tags: self.tags,
                created_by: self.created_by,
                created_at: now,
                updated_at: now,
                updated_by: None,
                status: PolicyStatus::Draft,
            },
            applicable: self.applicable,
        }
    }
}

/// Input for updating an existing policy
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub rules: Option<RuleSet>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<BTreeSet<String>>,

    /// Why the update was made; recorded on the history entry
    pub reason: String,

    pub updated_by: String,

    #[serde(default)]
    pub bump: VersionBump,
}
