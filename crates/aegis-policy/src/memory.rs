//! In-memory policy store
//!
//! Second reference implementation of [`PolicyStore`], used directly in tests
//! and standing in for a relational backend behind the same trait.

use crate::model::{Policy, PolicyDraft, PolicyStatus, PolicyUpdate, Version};
use crate::store::{applicable_order, ClarityCheck, PolicyStore, StoreEvent};
use aegis_core::{DecisionContext, Error, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;
use uuid::Uuid;

/// In-memory policy repository
pub struct MemoryStore {
    inner: RwLock<Inner>,
    clarity: Option<Arc<dyn ClarityCheck>>,
    events: broadcast::Sender<StoreEvent>,
}

#[derive(Default)]
struct Inner {
    policies: HashMap<Uuid, Policy>,
    history: HashMap<Uuid, Vec<Policy>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: RwLock::new(Inner::default()),
            clarity: None,
            events,
        }
    }

    /// Attach a pre-activation clarity check
    pub fn with_clarity_check(mut self, clarity: Arc<dyn ClarityCheck>) -> Self {
        self.clarity = Some(clarity);
        self
    }

    fn emit(&self, event: StoreEvent) {
        // No subscribers is fine; the cache attaches lazily.
        let _ = self.events.send(event);
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Apply an update in place, returning the snapshot to append to history
pub(crate) fn apply_update(policy: &mut Policy, update: PolicyUpdate) -> Policy {
    let prior = policy.clone();
    if let Some(text) = update.text {
        policy.text = Some(text);
    }
    if let Some(rules) = update.rules {
        policy.rules = Some(rules);
    }
    if let Some(priority) = update.priority {
        policy.metadata.priority = priority;
    }
    if let Some(tags) = update.tags {
        policy.metadata.tags = tags;
    }
    policy.metadata.version = policy.metadata.version.bumped(update.bump);
    policy.metadata.updated_at = chrono::Utc::now();
    policy.metadata.updated_by = Some(update.updated_by);
    prior
}

/// Refuse activation when another active policy holds the same name
pub(crate) fn check_name_collision<'a>(
    mut active: impl Iterator<Item = &'a Policy>,
    candidate: &Policy,
) -> Result<()> {
    if active.any(|p| p.id != candidate.id && p.is_active() && p.name == candidate.name) {
        return Err(Error::store(format!(
            "an active policy named '{}' already exists",
            candidate.name
        )));
    }
    Ok(())
}

#[async_trait]
impl PolicyStore for MemoryStore {
    async fn create(&self, draft: PolicyDraft) -> Result<Uuid> {
        let policy = draft.into_policy();
        policy.validate()?;
        let id = policy.id;
        self.inner.write().policies.insert(id, policy);
        info!(policy_id = %id, "policy created");
        Ok(id)
    }

    async fn update(&self, id: Uuid, update: PolicyUpdate) -> Result<Version> {
        let version = {
            let mut inner = self.inner.write();
            let policy = inner
                .policies
                .get_mut(&id)
                .ok_or_else(|| Error::store(format!("unknown policy: {}", id)))?;
            let prior = apply_update(policy, update);
            let version = policy.metadata.version;
            policy.validate()?;
            inner.history.entry(id).or_default().push(prior);
            version
        };
        self.emit(StoreEvent::Updated(id));
        Ok(version)
    }

    async fn activate(&self, id: Uuid) -> Result<()> {
        // Snapshot outside the lock; the clarity check may call out to an LLM.
        let candidate = self.get(id).await?;
        if !candidate.metadata.status.can_transition_to(PolicyStatus::Active) {
            return Err(Error::store(format!(
                "policy {} cannot transition from {:?} to active",
                id, candidate.metadata.status
            )));
        }
        candidate.validate()?;

        if let Some(clarity) = &self.clarity {
            if candidate.text.is_some() {
                let verdict = clarity.check(&candidate).await?;
                if !verdict.clear {
                    return Err(Error::store(format!(
                        "policy {} failed clarity check: {}",
                        id,
                        verdict.notes.unwrap_or_else(|| "ambiguous".to_string())
                    )));
                }
            }
        }

        {
            let mut inner = self.inner.write();
            check_name_collision(inner.policies.values(), &candidate)?;
            let policy = inner
                .policies
                .get_mut(&id)
                .ok_or_else(|| Error::store(format!("unknown policy: {}", id)))?;
            if policy.metadata.status != PolicyStatus::Draft {
                return Err(Error::store(format!("policy {} is no longer a draft", id)));
            }
            policy.metadata.status = PolicyStatus::Active;
            policy.metadata.updated_at = chrono::Utc::now();
        }
        info!(policy_id = %id, "policy activated");
        self.emit(StoreEvent::Activated(id));
        Ok(())
    }

    async fn deprecate(&self, id: Uuid) -> Result<()> {
        {
            let mut inner = self.inner.write();
            let policy = inner
                .policies
                .get_mut(&id)
                .ok_or_else(|| Error::store(format!("unknown policy: {}", id)))?;
            if !policy
                .metadata
                .status
                .can_transition_to(PolicyStatus::Deprecated)
            {
                return Err(Error::store(format!(
                    "policy {} cannot transition from {:?} to deprecated",
                    id, policy.metadata.status
                )));
            }
            policy.metadata.status = PolicyStatus::Deprecated;
            policy.metadata.updated_at = chrono::Utc::now();
        }
        info!(policy_id = %id, "policy deprecated");
        self.emit(StoreEvent::Deprecated(id));
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Policy> {
        self.inner
            .read()
            .policies
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::store(format!("unknown policy: {}", id)))
    }

    async fn history(&self, id: Uuid) -> Result<Vec<Policy>> {
        Ok(self.inner.read().history.get(&id).cloned().unwrap_or_default())
    }

    async fn list(&self) -> Result<Vec<Policy>> {
        Ok(self.inner.read().policies.values().cloned().collect())
    }

    async fn select_applicable(&self, ctx: &DecisionContext) -> Result<Vec<Policy>> {
        let mut selected: Vec<Policy> = self
            .inner
            .read()
            .policies
            .values()
            .filter(|p| p.is_active() && p.applicable.matches(ctx))
            .cloned()
            .collect();
        applicable_order(&mut selected);
        Ok(selected)
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ApplicableContexts;
    use std::collections::BTreeSet;

    fn draft(name: &str, priority: i32) -> PolicyDraft {
        PolicyDraft {
            name: name.to_string(),
            description: String::new(),
            text: Some("Requests are permitted during business hours.".to_string()),
            rules: None,
            priority,
            tags: BTreeSet::new(),
            created_by: "tests".to_string(),
            applicable: ApplicableContexts::default(),
        }
    }

    struct RejectAll;

    #[async_trait]
    impl ClarityCheck for RejectAll {
        async fn check(&self, _policy: &Policy) -> Result<crate::store::ClarityVerdict> {
            Ok(crate::store::ClarityVerdict {
                clear: false,
                notes: Some("could mean anything".to_string()),
            })
        }
    }

    #[tokio::test]
    async fn test_create_activate_roundtrip() {
        let store = MemoryStore::new();
        let id = store.create(draft("p1", 0)).await.unwrap();

        let fetched = store.get(id).await.unwrap();
        assert_eq!(fetched.metadata.status, PolicyStatus::Draft);
        assert_eq!(fetched.metadata.version, Version::initial());

        store.activate(id).await.unwrap();
        let fetched = store.get(id).await.unwrap();
        assert!(fetched.is_active());
        assert_eq!(
            fetched.text.as_deref(),
            Some("Requests are permitted during business hours.")
        );
    }

    #[tokio::test]
    async fn test_update_bumps_version_and_keeps_history() {
        let store = MemoryStore::new();
        let id = store.create(draft("p1", 0)).await.unwrap();

        let v2 = store
            .update(
                id,
                PolicyUpdate {
                    text: Some("Requests are permitted during weekday business hours.".to_string()),
                    reason: "clarify weekdays".to_string(),
                    updated_by: "admin".to_string(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(v2.to_string(), "1.0.1");

        let history = store.history(id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].metadata.version, Version::initial());
    }

    #[tokio::test]
    async fn test_active_name_collision_refused() {
        let store = MemoryStore::new();
        let a = store.create(draft("same-name", 0)).await.unwrap();
        let b = store.create(draft("same-name", 0)).await.unwrap();

        store.activate(a).await.unwrap();
        assert!(store.activate(b).await.is_err());
    }

    #[tokio::test]
    async fn test_deprecated_policy_not_selected() {
        let store = MemoryStore::new();
        let id = store.create(draft("p1", 0)).await.unwrap();
        store.activate(id).await.unwrap();

        let ctx = DecisionContext::new("a", "tools/call", "r");
        assert_eq!(store.select_applicable(&ctx).await.unwrap().len(), 1);

        store.deprecate(id).await.unwrap();
        assert!(store.select_applicable(&ctx).await.unwrap().is_empty());
        // one-way lifecycle
        assert!(store.activate(id).await.is_err());
    }

    #[tokio::test]
    async fn test_selection_orders_by_priority() {
        let store = MemoryStore::new();
        let low = store.create(draft("low", 1)).await.unwrap();
        let high = store.create(draft("high", 10)).await.unwrap();
        store.activate(low).await.unwrap();
        store.activate(high).await.unwrap();

        let ctx = DecisionContext::new("a", "tools/call", "r");
        let selected = store.select_applicable(&ctx).await.unwrap();
        assert_eq!(selected[0].name, "high");
        assert_eq!(selected[1].name, "low");
    }

    #[tokio::test]
    async fn test_clarity_check_blocks_activation() {
        let store = MemoryStore::new().with_clarity_check(Arc::new(RejectAll));
        let id = store.create(draft("vague", 0)).await.unwrap();
        let err = store.activate(id).await.unwrap_err();
        assert!(err.to_string().contains("clarity"));
    }

    #[tokio::test]
    async fn test_lifecycle_events_emitted() {
        let store = MemoryStore::new();
        let mut events = store.subscribe();
        let id = store.create(draft("p1", 0)).await.unwrap();
        store.activate(id).await.unwrap();
        store.deprecate(id).await.unwrap();

        assert_eq!(events.recv().await.unwrap(), StoreEvent::Activated(id));
        assert_eq!(events.recv().await.unwrap(), StoreEvent::Deprecated(id));
    }
}
