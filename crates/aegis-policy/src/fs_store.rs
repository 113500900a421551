//! Filesystem policy store
//!
//! One JSON file per policy at `policy-<id>.json`, prior versions as a JSON
//! array at `history/policy-<id>.json`. Mutations write to a temp file and
//! rename into place so readers never observe a torn policy.

use crate::memory::{apply_update, check_name_collision};
use crate::model::{Policy, PolicyDraft, PolicyStatus, PolicyUpdate, Version};
use crate::store::{applicable_order, ClarityCheck, PolicyStore, StoreEvent};
use aegis_core::{DecisionContext, Error, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

/// Filesystem-backed policy repository
pub struct FilesystemStore {
    root: PathBuf,
    index: RwLock<HashMap<Uuid, Policy>>,
    clarity: Option<Arc<dyn ClarityCheck>>,
    events: broadcast::Sender<StoreEvent>,
}

impl FilesystemStore {
    /// Open (or initialize) a store rooted at `root`
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join("history"))?;

        let mut index = HashMap::new();
        for entry in fs::read_dir(&root)? {
            let path = entry?.path();
            let is_policy_file = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("policy-") && n.ends_with(".json"));
            if !is_policy_file {
                continue;
            }
            match Self::read_policy(&path) {
                Ok(policy) => {
                    index.insert(policy.id, policy);
                }
                Err(e) => warn!(path = %path.display(), "skipping unreadable policy file: {}", e),
            }
        }
        info!(count = index.len(), root = %root.display(), "policy store opened");

        let (events, _) = broadcast::channel(64);
        Ok(Self {
            root,
            index: RwLock::new(index),
            clarity: None,
            events,
        })
    }

    /// Attach a pre-activation clarity check
    pub fn with_clarity_check(mut self, clarity: Arc<dyn ClarityCheck>) -> Self {
        self.clarity = Some(clarity);
        self
    }

    fn policy_path(&self, id: Uuid) -> PathBuf {
        self.root.join(format!("policy-{}.json", id))
    }

    fn history_path(&self, id: Uuid) -> PathBuf {
        self.root.join("history").join(format!("policy-{}.json", id))
    }

    fn read_policy(path: &Path) -> Result<Policy> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Serialize and atomically replace the target file
    fn write_atomic(path: &Path, value: &impl serde::Serialize) -> Result<()> {
        let json = serde_json::to_string_pretty(value)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    fn persist(&self, policy: &Policy) -> Result<()> {
        Self::write_atomic(&self.policy_path(policy.id), policy)
    }

    fn append_history(&self, prior: &Policy) -> Result<()> {
        let path = self.history_path(prior.id);
        let mut entries: Vec<Policy> = if path.exists() {
            serde_json::from_str(&fs::read_to_string(&path)?)?
        } else {
            Vec::new()
        };
        entries.push(prior.clone());
        Self::write_atomic(&path, &entries)
    }

    fn emit(&self, event: StoreEvent) {
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl PolicyStore for FilesystemStore {
    async fn create(&self, draft: PolicyDraft) -> Result<Uuid> {
        let policy = draft.into_policy();
        policy.validate()?;
        let id = policy.id;
        self.persist(&policy)?;
        self.index.write().insert(id, policy);
        info!(policy_id = %id, "policy created");
        Ok(id)
    }

    async fn update(&self, id: Uuid, update: PolicyUpdate) -> Result<Version> {
        // Mutate a snapshot first so a validation failure leaves no trace.
        let (updated, prior) = {
            let index = self.index.read();
            let mut policy = index
                .get(&id)
                .cloned()
                .ok_or_else(|| Error::store(format!("unknown policy: {}", id)))?;
            let prior = apply_update(&mut policy, update);
            policy.validate()?;
            (policy, prior)
        };

        self.append_history(&prior)?;
        self.persist(&updated)?;
        let version = updated.metadata.version;
        self.index.write().insert(id, updated);
        self.emit(StoreEvent::Updated(id));
        Ok(version)
    }

    async fn activate(&self, id: Uuid) -> Result<()> {
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

        let activated = {
            let mut index = self.index.write();
            check_name_collision(index.values(), &candidate)?;
            let policy = index
                .get_mut(&id)
                .ok_or_else(|| Error::store(format!("unknown policy: {}", id)))?;
            if policy.metadata.status != PolicyStatus::Draft {
                return Err(Error::store(format!("policy {} is no longer a draft", id)));
            }
            policy.metadata.status = PolicyStatus::Active;
            policy.metadata.updated_at = chrono::Utc::now();
            policy.clone()
        };

        self.persist(&activated)?;
        info!(policy_id = %id, "policy activated");
        self.emit(StoreEvent::Activated(id));
        Ok(())
    }

    async fn deprecate(&self, id: Uuid) -> Result<()> {
        let deprecated = {
            let mut index = self.index.write();
            let policy = index
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
            policy.clone()
        };

        self.persist(&deprecated)?;
        info!(policy_id = %id, "policy deprecated");
        self.emit(StoreEvent::Deprecated(id));
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Policy> {
        self.index
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::store(format!("unknown policy: {}", id)))
    }

    async fn history(&self, id: Uuid) -> Result<Vec<Policy>> {
        let path = self.history_path(id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_str(&fs::read_to_string(&path)?)?)
    }

    async fn list(&self) -> Result<Vec<Policy>> {
        Ok(self.index.read().values().cloned().collect())
    }

    async fn select_applicable(&self, ctx: &DecisionContext) -> Result<Vec<Policy>> {
        let mut selected: Vec<Policy> = self
            .index
            .read()
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
    use tempfile::TempDir;

    fn draft(name: &str) -> PolicyDraft {
        PolicyDraft {
            name: name.to_string(),
            description: String::new(),
            text: Some("External agents may not read confidential data.".to_string()),
            rules: None,
            priority: 5,
            tags: BTreeSet::new(),
            created_by: "tests".to_string(),
            applicable: ApplicableContexts::default(),
        }
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let dir = TempDir::new().unwrap();

        let id = {
            let store = FilesystemStore::open(dir.path()).unwrap();
            let id = store.create(draft("persistent")).await.unwrap();
            store.activate(id).await.unwrap();
            id
        };

        let reopened = FilesystemStore::open(dir.path()).unwrap();
        let policy = reopened.get(id).await.unwrap();
        assert_eq!(policy.name, "persistent");
        assert!(policy.is_active());
    }

    #[tokio::test]
    async fn test_policy_file_layout() {
        let dir = TempDir::new().unwrap();
        let store = FilesystemStore::open(dir.path()).unwrap();
        let id = store.create(draft("layout")).await.unwrap();

        assert!(dir.path().join(format!("policy-{}.json", id)).exists());

        store
            .update(
                id,
                PolicyUpdate {
                    text: Some("External agents may never read confidential data.".to_string()),
                    reason: "tighten wording".to_string(),
                    updated_by: "admin".to_string(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert!(dir
            .path()
            .join("history")
            .join(format!("policy-{}.json", id))
            .exists());
    }

    #[tokio::test]
    async fn test_history_preserves_versions_in_order() {
        let dir = TempDir::new().unwrap();
        let store = FilesystemStore::open(dir.path()).unwrap();
        let id = store.create(draft("versioned")).await.unwrap();

        for i in 0..3 {
            store
                .update(
                    id,
                    PolicyUpdate {
                        text: Some(format!("Policy body revision number {}.", i)),
                        reason: format!("rev {}", i),
                        updated_by: "admin".to_string(),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
        }

        let history = store.history(id).await.unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].metadata.version.to_string(), "1.0.0");
        assert_eq!(history[2].metadata.version.to_string(), "1.0.2");
        assert_eq!(store.get(id).await.unwrap().metadata.version.to_string(), "1.0.3");
    }

    #[tokio::test]
    async fn test_failed_update_leaves_no_trace() {
        let dir = TempDir::new().unwrap();
        let store = FilesystemStore::open(dir.path()).unwrap();
        let id = store.create(draft("stable")).await.unwrap();

        let err = store
            .update(
                id,
                PolicyUpdate {
                    text: Some("short".to_string()),
                    reason: "too short to validate".to_string(),
                    updated_by: "admin".to_string(),
                    ..Default::default()
                },
            )
            .await;
        assert!(err.is_err());

        assert_eq!(store.get(id).await.unwrap().metadata.version, Version::initial());
        assert!(store.history(id).await.unwrap().is_empty());
    }
}
