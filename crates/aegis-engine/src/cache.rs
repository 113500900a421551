//! Two-tier decision cache
//!
//! L1 is in-process and bounded with LFU-with-aging eviction (hit counts
//! decay over time so one burst cannot pin an entry forever). L2 is an
//! optional redis-shaped key-value tier shared across proxy replicas.
//! Concurrent misses for one key are coalesced: a single leader computes the
//! decision while followers wait on the result.

use aegis_core::{DecisionContext, DecisionOutcome, PolicyDecision};
use aegis_policy::Policy;
use parking_lot::Mutex;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, warn};

/// How often L1 hit counts are decayed
const AGING_INTERVAL: Duration = Duration::from_secs(60);

/// Cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// L1 entry bound
    pub l1_capacity: usize,

    /// TTL for PERMIT decisions
    pub permit_ttl: Duration,

    /// TTL for DENY decisions
    pub deny_ttl: Duration,

    /// Short negative TTL for INDETERMINATE decisions (judge exhaustion)
    pub indeterminate_ttl: Duration,

    /// Bucket width used when folding the timestamp into the key
    pub key_window: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            l1_capacity: 10_000,
            permit_ttl: Duration::from_secs(300),
            deny_ttl: Duration::from_secs(60),
            indeterminate_ttl: Duration::from_secs(30),
            key_window: Duration::from_secs(60),
        }
    }
}

/// Out-of-process key-value tier (redis-shaped)
#[async_trait::async_trait]
pub trait KvTier: Send + Sync {
    /// Fetch a value
    async fn get(&self, key: &str) -> Option<String>;

    /// Store a value with a TTL
    async fn set_ex(&self, key: &str, value: String, ttl: Duration);

    /// Delete a value
    async fn del(&self, key: &str);
}

/// Redis-backed L2 tier; every operation is best-effort
pub struct RedisTier {
    conn: redis::aio::ConnectionManager,
}

impl RedisTier {
    /// Connect to a redis instance
    pub async fn connect(url: &str) -> aegis_core::Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| aegis_core::Error::config(format!("bad redis url: {}", e)))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| aegis_core::Error::config(format!("redis unavailable: {}", e)))?;
        Ok(Self { conn })
    }
}

#[async_trait::async_trait]
impl KvTier for RedisTier {
    async fn get(&self, key: &str) -> Option<String> {
        let mut conn = self.conn.clone();
        match redis::cmd("GET").arg(key).query_async(&mut conn).await {
            Ok(value) => value,
            Err(e) => {
                warn!("l2 get failed: {}", e);
                None
            }
        }
    }

    async fn set_ex(&self, key: &str, value: String, ttl: Duration) {
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<()> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await;
        if let Err(e) = result {
            warn!("l2 set failed: {}", e);
        }
    }

    async fn del(&self, key: &str) {
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<()> =
            redis::cmd("DEL").arg(key).query_async(&mut conn).await;
        if let Err(e) = result {
            warn!("l2 del failed: {}", e);
        }
    }
}

struct L1Entry {
    decision: PolicyDecision,
    expires_at: Instant,
    hits: f64,
}

struct L1 {
    entries: HashMap<String, L1Entry>,
    last_decay: Instant,
}

type FlightSender = watch::Sender<Option<PolicyDecision>>;

/// Result of joining the single-flight group for a key
pub enum Flight {
    /// This caller computes the decision and must call [`FlightGuard::complete`]
    Leader(FlightGuard),

    /// Another caller is already computing; wait on the receiver
    Follower(watch::Receiver<Option<PolicyDecision>>),
}

/// Leader's obligation to publish its result.
///
/// Dropping the guard without completing (deadline hit, panic) wakes the
/// followers with `None` so they fall back to computing themselves.
pub struct FlightGuard {
    flights: Arc<Mutex<HashMap<String, FlightSender>>>,
    key: String,
    done: bool,
}

impl FlightGuard {
    /// Publish the computed decision (or `None` when it is not shareable)
    pub fn complete(mut self, decision: Option<PolicyDecision>) {
        if let Some(tx) = self.flights.lock().remove(&self.key) {
            let _ = tx.send(decision);
        }
        self.done = true;
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        if !self.done {
            if let Some(tx) = self.flights.lock().remove(&self.key) {
                let _ = tx.send(None);
            }
        }
    }
}

/// Await a follower's copy of the leader's decision
pub async fn await_flight(
    mut rx: watch::Receiver<Option<PolicyDecision>>,
) -> Option<PolicyDecision> {
    if rx.borrow().is_some() {
        return rx.borrow().clone();
    }
    match rx.changed().await {
        Ok(()) => rx.borrow().clone(),
        Err(_) => None,
    }
}

/// Process-wide decision cache
pub struct DecisionCache {
    config: CacheConfig,
    l1: Mutex<L1>,
    l2: Option<Arc<dyn KvTier>>,
    flights: Arc<Mutex<HashMap<String, FlightSender>>>,
    /// policy id → keys whose decisions referenced it
    policy_index: Mutex<HashMap<String, HashSet<String>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl DecisionCache {
    /// Create an L1-only cache
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            l1: Mutex::new(L1 {
                entries: HashMap::new(),
                last_decay: Instant::now(),
            }),
            l2: None,
            flights: Arc::new(Mutex::new(HashMap::new())),
            policy_index: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Attach a shared L2 tier
    pub fn with_l2(mut self, l2: Arc<dyn KvTier>) -> Self {
        self.l2 = Some(l2);
        self
    }

    /// Build the cache key for a policy set and context.
    ///
    /// The projection keeps every field a policy can read and drops the
    /// high-entropy ones that cannot affect the outcome: the request id is
    /// excluded and the timestamp is rounded to the key window.
    pub fn key(&self, policies: &[Policy], ctx: &DecisionContext) -> String {
        let mut labels: Vec<String> = policies.iter().map(|p| p.version_label()).collect();
        labels.sort();

        let window = self.config.key_window.as_secs().max(1) as i64;
        let projection = json!({
            "agent": ctx.agent_id,
            "action": ctx.action,
            "resource": ctx.resource,
            "tool": ctx.tool,
            "purpose": ctx.purpose,
            "location": ctx.location,
            "clientIp": ctx.client_ip,
            "emergency": ctx.emergency,
            "delegationDepth": ctx.delegation_chain.len(),
            "agentAttrs": ctx.agent,
            "resourceAttrs": ctx.resource_attrs,
            "risk": ctx.risk_score.map(|r| (r * 100.0).round() / 100.0),
            "environment": ctx.environment,
            "timeBucket": ctx.timestamp.timestamp() / window,
        });

        let mut hasher = Sha256::new();
        hasher.update(labels.join(","));
        hasher.update(projection.to_string());
        format!("aegis:dec:{:x}", hasher.finalize())
    }

    /// Look up a decision, promoting L2 hits into L1
    pub async fn get(&self, key: &str) -> Option<PolicyDecision> {
        {
            let mut l1 = self.l1.lock();
            if let Some(entry) = l1.entries.get_mut(key) {
                if entry.expires_at > Instant::now() {
                    entry.hits += 1.0;
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(entry.decision.clone());
                }
                l1.entries.remove(key);
            }
        }

        if let Some(l2) = &self.l2 {
            if let Some(raw) = l2.get(key).await {
                if let Ok(decision) = serde_json::from_str::<PolicyDecision>(&raw) {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    self.insert_l1(key, decision.clone(), self.ttl_for(decision.outcome));
                    return Some(decision);
                }
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Join the single-flight group for a key
    pub fn begin(&self, key: &str) -> Flight {
        let mut flights = self.flights.lock();
        if let Some(tx) = flights.get(key) {
            Flight::Follower(tx.subscribe())
        } else {
            let (tx, _rx) = watch::channel(None);
            flights.insert(key.to_string(), tx);
            Flight::Leader(FlightGuard {
                flights: Arc::clone(&self.flights),
                key: key.to_string(),
                done: false,
            })
        }
    }

    /// Store a decision under the key, indexing it by the policies it read
    pub async fn store(&self, key: &str, decision: &PolicyDecision, policy_ids: &[String]) {
        let ttl = match decision.outcome {
            DecisionOutcome::Permit | DecisionOutcome::Deny | DecisionOutcome::Indeterminate => {
                self.ttl_for(decision.outcome)
            }
            DecisionOutcome::NotApplicable => return,
        };

        self.insert_l1(key, decision.clone(), ttl);
        {
            let mut index = self.policy_index.lock();
            for id in policy_ids {
                index.entry(id.clone()).or_default().insert(key.to_string());
            }
        }

        if let Some(l2) = &self.l2 {
            if let Ok(raw) = serde_json::to_string(decision) {
                l2.set_ex(key, raw, ttl).await;
            }
        }
    }

    /// Drop every cached decision that referenced the policy
    pub async fn invalidate_policy(&self, policy_id: &str) {
        let keys: Vec<String> = self
            .policy_index
            .lock()
            .remove(policy_id)
            .map(|set| set.into_iter().collect())
            .unwrap_or_default();

        if keys.is_empty() {
            return;
        }
        debug!(policy_id = %policy_id, entries = keys.len(), "invalidating cached decisions");

        {
            let mut l1 = self.l1.lock();
            for key in &keys {
                l1.entries.remove(key);
            }
        }
        if let Some(l2) = &self.l2 {
            for key in &keys {
                l2.del(key).await;
            }
        }
    }

    /// Current L1 entry count
    pub fn len(&self) -> usize {
        self.l1.lock().entries.len()
    }

    /// Whether L1 is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hit ratio since startup
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed) as f64;
        let misses = self.misses.load(Ordering::Relaxed) as f64;
        if hits + misses == 0.0 {
            0.0
        } else {
            hits / (hits + misses)
        }
    }

    fn ttl_for(&self, outcome: DecisionOutcome) -> Duration {
        match outcome {
            DecisionOutcome::Permit => self.config.permit_ttl,
            DecisionOutcome::Deny => self.config.deny_ttl,
            _ => self.config.indeterminate_ttl,
        }
    }

    fn insert_l1(&self, key: &str, decision: PolicyDecision, ttl: Duration) {
        let mut l1 = self.l1.lock();

        if l1.entries.len() >= self.config.l1_capacity && !l1.entries.contains_key(key) {
            let now = Instant::now();

            // Age first so stale popularity cannot outrank fresh entries.
            if now.duration_since(l1.last_decay) >= AGING_INTERVAL {
                for entry in l1.entries.values_mut() {
                    entry.hits /= 2.0;
                }
                l1.last_decay = now;
            }

            l1.entries.retain(|_, entry| entry.expires_at > now);

            if l1.entries.len() >= self.config.l1_capacity {
                if let Some(victim) = l1
                    .entries
                    .iter()
                    .min_by(|a, b| a.1.hits.partial_cmp(&b.1.hits).expect("hits are finite"))
                    .map(|(k, _)| k.clone())
                {
                    l1.entries.remove(&victim);
                }
            }
        }

        l1.entries.insert(
            key.to_string(),
            L1Entry {
                decision,
                expires_at: Instant::now() + ttl,
                hits: 1.0,
            },
        );
    }
}
