//! Policy store abstraction
//!
//! The store exclusively owns policy persistence; every other component works
//! on read-only snapshots obtained through the query API. Lifecycle events
//! are broadcast so the decision cache can invalidate affected entries.

use crate::model::{Policy, PolicyDraft, PolicyUpdate, Version};
use aegis_core::{DecisionContext, Result};
use async_trait::async_trait;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Lifecycle event emitted on every mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreEvent {
    /// Policy transitioned draft → active
    Activated(Uuid),
    /// Policy body or metadata changed
    Updated(Uuid),
    /// Policy transitioned active → deprecated
    Deprecated(Uuid),
}

impl StoreEvent {
    /// The policy the event concerns
    pub fn policy_id(&self) -> Uuid {
        match self {
            Self::Activated(id) | Self::Updated(id) | Self::Deprecated(id) => *id,
        }
    }
}

/// Verdict of the pre-activation clarity check
#[derive(Debug, Clone)]
pub struct ClarityVerdict {
    /// Whether the policy text is unambiguous enough to activate
    pub clear: bool,

    /// Reviewer notes when the text is ambiguous
    pub notes: Option<String>,
}

/// Judgment of whether a natural-language policy is unambiguous.
///
/// The production implementation asks the LLM judge; stores accept any
/// implementation so activation can be validated offline in tests.
#[async_trait]
pub trait ClarityCheck: Send + Sync {
    /// Review the policy text for ambiguity
    async fn check(&self, policy: &Policy) -> Result<ClarityVerdict>;
}

/// Versioned policy repository
#[async_trait]
pub trait PolicyStore: Send + Sync {
    /// Create a new draft policy; returns its id
    async fn create(&self, draft: PolicyDraft) -> Result<Uuid>;

    /// Update a policy, bumping its version and appending the prior state to
    /// history; returns the new version
    async fn update(&self, id: Uuid, update: PolicyUpdate) -> Result<Version>;

    /// Validate and transition a draft to active.
    ///
    /// Refuses when the name collides with an already-active policy or the
    /// clarity check rejects the text.
    async fn activate(&self, id: Uuid) -> Result<()>;

    /// Transition an active policy to deprecated
    async fn deprecate(&self, id: Uuid) -> Result<()>;

    /// Fetch a policy snapshot by id
    async fn get(&self, id: Uuid) -> Result<Policy>;

    /// Prior versions of a policy, oldest first
    async fn history(&self, id: Uuid) -> Result<Vec<Policy>>;

    /// All policies regardless of status
    async fn list(&self) -> Result<Vec<Policy>>;

    /// Active policies whose declared applicability intersects the context,
    /// ordered by descending priority, then descending version.
    ///
    /// The order determines decision-engine iteration.
    async fn select_applicable(&self, ctx: &DecisionContext) -> Result<Vec<Policy>>;

    /// Subscribe to lifecycle events
    fn subscribe(&self) -> broadcast::Receiver<StoreEvent>;
}

/// Shared ordering for `select_applicable` implementations
pub(crate) fn applicable_order(policies: &mut [Policy]) {
    policies.sort_by(|a, b| {
        b.metadata
            .priority
            .cmp(&a.metadata.priority)
            .then(b.metadata.version.cmp(&a.metadata.version))
    });
}
