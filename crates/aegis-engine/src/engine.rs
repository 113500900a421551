//! Hybrid decision engine
//!
//! For each applicable policy, in priority order: the structured pass runs
//! first and is authoritative; the LLM judge is consulted only when the
//! structured rules say nothing. Outcomes are gated by confidence, resolved
//! across policies by the configured strategy, and cached keyed on the policy
//! set and the projected context.

use crate::cache::{await_flight, DecisionCache, Flight};
use crate::conflict::{self, ConflictStrategy};
use crate::judge::PolicyJudge;
use aegis_core::{
    DecisionContext, DecisionMetadata, DecisionOutcome, EngineKind, PolicyDecision,
};
use aegis_policy::{evaluator, Policy, PolicyStore, StructuredOutcome};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Decisions below this confidence become INDETERMINATE
    pub confidence_threshold: f64,

    /// Strategy applied when several policies produce outcomes
    pub conflict_strategy: ConflictStrategy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.7,
            conflict_strategy: ConflictStrategy::Priority,
        }
    }
}

/// The policy decision point
pub struct DecisionEngine {
    store: Arc<dyn PolicyStore>,
    judge: Option<Arc<dyn PolicyJudge>>,
    cache: Option<Arc<DecisionCache>>,
    config: EngineConfig,
}

impl DecisionEngine {
    /// Create an engine over a policy store
    pub fn new(store: Arc<dyn PolicyStore>, config: EngineConfig) -> Self {
        Self {
            store,
            judge: None,
            cache: None,
            config,
        }
    }

    /// Attach the LLM judge for natural-language policies
    pub fn with_judge(mut self, judge: Arc<dyn PolicyJudge>) -> Self {
        self.judge = Some(judge);
        self
    }

    /// Attach the decision cache and start invalidating it on store events
    pub fn with_cache(mut self, cache: Arc<DecisionCache>) -> Self {
        spawn_invalidation(Arc::clone(&cache), self.store.as_ref());
        self.cache = Some(cache);
        self
    }

    /// The attached cache, if any
    pub fn cache(&self) -> Option<&Arc<DecisionCache>> {
        self.cache.as_ref()
    }

    /// Decide the request.
    ///
    /// Never returns an error: anything that prevents evaluation produces an
    /// INDETERMINATE decision, which enforcement treats as deny.
    pub async fn decide(&self, ctx: &DecisionContext) -> PolicyDecision {
        let started = Instant::now();

        let policies = match self.store.select_applicable(ctx).await {
            Ok(policies) => policies,
            Err(e) => {
                warn!("policy selection failed: {}", e);
                let mut d = PolicyDecision::indeterminate(
                    format!("policy selection failed: {}", e),
                    DecisionMetadata::none(),
                );
                d.metadata.processing_time_ms = elapsed_ms(started);
                return d;
            }
        };

        if policies.is_empty() {
            let mut d = PolicyDecision::not_applicable();
            d.metadata.processing_time_ms = elapsed_ms(started);
            record_metrics(&d);
            return d;
        }

        let mut decision = match &self.cache {
            Some(cache) => {
                let key = cache.key(&policies, ctx);
                if let Some(mut hit) = cache.get(&key).await {
                    debug!(key = %key, "decision served from cache");
                    hit.metadata.engine = EngineKind::Cache;
                    hit.metadata.processing_time_ms = elapsed_ms(started);
                    record_metrics(&hit);
                    return hit;
                }

                match cache.begin(&key) {
                    Flight::Follower(rx) => match await_flight(rx).await {
                        Some(mut shared) => {
                            shared.metadata.engine = EngineKind::Cache;
                            shared
                        }
                        // Leader vanished without a result; compute ourselves.
                        None => self.evaluate_policies(&policies, ctx).await,
                    },
                    Flight::Leader(guard) => {
                        let decision = self.evaluate_policies(&policies, ctx).await;
                        if cacheable(&decision) {
                            let ids: Vec<String> =
                                policies.iter().map(|p| p.id.to_string()).collect();
                            cache.store(&key, &decision, &ids).await;
                        }
                        guard.complete(Some(decision.clone()));
                        decision
                    }
                }
            }
            None => self.evaluate_policies(&policies, ctx).await,
        };

        decision.metadata.processing_time_ms = elapsed_ms(started);
        record_metrics(&decision);
        decision
    }

    /// Run the per-policy passes and resolve conflicts
    async fn evaluate_policies(
        &self,
        policies: &[Policy],
        ctx: &DecisionContext,
    ) -> PolicyDecision {
        let mut candidates: Vec<PolicyDecision> = Vec::new();
        let mut failures: Vec<String> = Vec::new();
        let mut failed_policy: Option<String> = None;

        for policy in policies {
            match evaluator::evaluate(policy, ctx) {
                StructuredOutcome::Decision(decision) => {
                    candidates.push(decision);
                }
                StructuredOutcome::ConstraintsFailed(mut descriptions) => {
                    // The structured form is authoritative: a matched rule
                    // with failed constraints does not fall through to the
                    // judge for the same policy.
                    failed_policy.get_or_insert_with(|| policy.id.to_string());
                    failures.append(&mut descriptions);
                    continue;
                }
                StructuredOutcome::NotApplicable => {
                    if policy.text.is_none() {
                        continue;
                    }
                    let Some(judge) = &self.judge else { continue };
                    let judged = self.judge_policy(judge.as_ref(), policy, ctx).await;
                    if judged.outcome == DecisionOutcome::NotApplicable {
                        // The judge read the policy as silent on this
                        // request; move on to the next policy.
                        continue;
                    }
                    candidates.push(judged);
                }
            }

            if self.config.conflict_strategy == ConflictStrategy::Priority
                && !candidates.is_empty()
            {
                // Highest-priority outcome wins outright; skip the rest.
                break;
            }
        }

        if candidates.is_empty() {
            return if failures.is_empty() {
                PolicyDecision::not_applicable()
            } else {
                let mut metadata = DecisionMetadata::none();
                metadata.policy_id = failed_policy;
                PolicyDecision::deny(failures.join("; "), metadata)
            };
        }

        conflict::resolve(self.config.conflict_strategy, candidates)
    }

    /// LLM pass for one policy, including the confidence gate
    async fn judge_policy(
        &self,
        judge: &dyn PolicyJudge,
        policy: &Policy,
        ctx: &DecisionContext,
    ) -> PolicyDecision {
        match judge.judge(policy, ctx).await {
            Ok(outcome) => {
                let verdict = outcome.verdict;
                let mut metadata = DecisionMetadata::llm(policy.id.to_string(), outcome.model);
                metadata.attempts = Some(outcome.attempts);
                metadata.tokens = Some(outcome.tokens);

                let mut decision = PolicyDecision {
                    outcome: verdict.decision,
                    reason: verdict.reason,
                    confidence: verdict.confidence,
                    constraints: verdict.constraints,
                    obligations: verdict.obligations,
                    metadata,
                };

                let gated = decision.confidence < self.config.confidence_threshold
                    && matches!(
                        decision.outcome,
                        DecisionOutcome::Permit | DecisionOutcome::Deny
                    );
                if gated {
                    debug!(
                        policy = %policy.name,
                        confidence = decision.confidence,
                        "confidence below threshold, downgrading to indeterminate"
                    );
                    decision.outcome = DecisionOutcome::Indeterminate;
                    decision.reason = format!("indeterminate: {}", decision.reason);
                }
                decision
            }
            Err(e) => {
                warn!(policy = %policy.name, "llm judge failed: {}", e);
                let mut metadata = DecisionMetadata::none();
                metadata.policy_id = Some(policy.id.to_string());
                metadata.engine = EngineKind::Llm;
                PolicyDecision::indeterminate(format!("llm judge failed: {}", e), metadata)
            }
        }
    }
}

/// Whether a decision may enter the cache
fn cacheable(decision: &PolicyDecision) -> bool {
    match decision.metadata.engine {
        EngineKind::Cache => false,
        EngineKind::Structured | EngineKind::Llm => matches!(
            decision.outcome,
            // Indeterminate is cached briefly to shield the judge from
            // thundering herds; not-applicable is never cached.
            DecisionOutcome::Permit | DecisionOutcome::Deny | DecisionOutcome::Indeterminate
        ),
    }
}

/// Invalidate cached decisions whenever the store mutates a policy
pub fn spawn_invalidation(
    cache: Arc<DecisionCache>,
    store: &dyn PolicyStore,
) -> tokio::task::JoinHandle<()> {
    let mut events = store.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    cache.invalidate_policy(&event.policy_id().to_string()).await;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "store event stream lagged; cache may hold stale entries");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

fn record_metrics(decision: &PolicyDecision) {
    let outcome = match decision.outcome {
        DecisionOutcome::Permit => "permit",
        DecisionOutcome::Deny => "deny",
        DecisionOutcome::Indeterminate => "indeterminate",
        DecisionOutcome::NotApplicable => "not_applicable",
    };
    let engine = match decision.metadata.engine {
        EngineKind::Structured => "structured",
        EngineKind::Llm => "llm",
        EngineKind::Cache => "cache",
    };
    metrics::counter!("aegis_decisions_total", "outcome" => outcome, "engine" => engine)
        .increment(1);
    metrics::histogram!("aegis_decision_latency_ms")
        .record(decision.metadata.processing_time_ms as f64);
}
