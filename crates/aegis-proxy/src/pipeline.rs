//! Request enforcement pipeline
//!
//! Every policy-applicable JSON-RPC request flows through: context build →
//! parallel enrichment → bounded decision → constraint application → a single
//! upstream call → response constraints → obligations (sync before the
//! response, async queued) → exactly one audit entry. No request reaches an
//! upstream without a recorded PERMIT.

use crate::config::AegisConfig;
use crate::hub::NotificationHub;
use crate::tools::ToolAggregate;
use crate::upstream::UpstreamManager;
use aegis_core::{
    rpc, ConstraintSpec, DecisionContext, DecisionOutcome, Error, ObligationSpec, PolicyDecision,
    RateLimitScope,
};
use aegis_enforce::{ConstraintRegistry, ObligationExchange, ObligationRegistry};
use aegis_engine::DecisionEngine;
use aegis_enrichers::{EnricherRegistry, FailureTracker};
use aegis_policy::PolicyStore;
use aegis_telemetry::{AuditOutcome, AuditService, EnforcementRecord, PolicySnapshot};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Transport-level identity of the calling client
#[derive(Debug, Clone)]
pub struct ClientIdentity {
    /// Agent id derived from the transport
    pub agent_id: String,

    /// Transport session id
    pub session_id: Option<String>,

    /// Client IP at the HTTP edge
    pub client_ip: Option<String>,
}

impl ClientIdentity {
    /// Identity for an unnamed client
    pub fn anonymous() -> Self {
        Self {
            agent_id: "anonymous".to_string(),
            session_id: None,
            client_ip: None,
        }
    }
}

/// Shared state wired at startup and cloned per request
#[derive(Clone)]
pub struct ProxyState {
    pub config: Arc<AegisConfig>,
    pub store: Arc<dyn PolicyStore>,
    pub engine: Arc<DecisionEngine>,
    pub enrichers: Arc<EnricherRegistry>,
    pub constraints: Arc<ConstraintRegistry>,
    pub obligations: Arc<ObligationRegistry>,
    pub audit: Arc<AuditService>,
    pub upstreams: Arc<UpstreamManager>,
    pub tools: Arc<ToolAggregate>,
    pub hub: Arc<NotificationHub>,
    pub failures: FailureTracker,
}

/// Handle one parsed JSON-RPC message.
///
/// Returns `None` for notifications, which have no response.
pub async fn handle_message(
    state: &ProxyState,
    request: rpc::Request,
    identity: &ClientIdentity,
) -> Option<rpc::Response> {
    let id = request.id.clone().unwrap_or(Value::Null);

    if let Err(e) = request.validate() {
        return Some(rpc::Response::err(id, e));
    }
    if request.is_notification() {
        debug!(method = %request.method, "client notification ignored");
        return None;
    }

    metrics::counter!("aegis_requests_total", "method" => request.method.clone()).increment(1);

    let response = match request.method.as_str() {
        "initialize" => rpc::Response::ok(
            id,
            json!({
                "protocolVersion": "2024-11-05",
                "serverInfo": {
                    "name": "aegis-proxy",
                    "version": env!("CARGO_PKG_VERSION"),
                },
                "capabilities": {
                    "tools": { "listChanged": true },
                    "resources": { "listChanged": true },
                },
            }),
        ),
        "tools/list" => {
            let tools = state.tools.list_tools(&state.upstreams).await;
            rpc::Response::ok(id, json!({ "tools": tools }))
        }
        "resources/list" => {
            let resources = state.tools.list_resources(&state.upstreams).await;
            rpc::Response::ok(id, json!({ "resources": resources }))
        }
        "tools/call" => handle_tools_call(state, id, request.params, identity).await,
        "resources/read" => handle_resources_read(state, id, request.params, identity).await,
        other => rpc::Response::err(id, rpc::RpcError::method_not_found(other)),
    };

    Some(response)
}

async fn handle_tools_call(
    state: &ProxyState,
    id: Value,
    params: Option<Value>,
    identity: &ClientIdentity,
) -> rpc::Response {
    let params = params.unwrap_or_else(|| json!({}));
    let Some(full_name) = params.get("name").and_then(|n| n.as_str()).map(str::to_string)
    else {
        return rpc::Response::err(id, rpc::RpcError::invalid_params("missing tool name"));
    };
    let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));

    let descriptor = match state.tools.resolve(&state.upstreams, &full_name).await {
        Ok(descriptor) => descriptor,
        Err(_) => {
            return rpc::Response::err(
                id,
                rpc::RpcError::invalid_params(format!("unknown tool '{}'", full_name)),
            )
        }
    };

    let ctx = base_context(identity, "tools/call", &full_name).with_tool(full_name.clone());
    let original_name = descriptor.original_name.clone();

    match enforce(
        state,
        ctx,
        arguments,
        &descriptor.upstream,
        "tools/call",
        move |transformed| json!({ "name": original_name, "arguments": transformed }),
    )
    .await
    {
        Ok(result) => rpc::Response::ok(id, result),
        Err(e) => rpc::Response::err(id, e),
    }
}

async fn handle_resources_read(
    state: &ProxyState,
    id: Value,
    params: Option<Value>,
    identity: &ClientIdentity,
) -> rpc::Response {
    let params = params.unwrap_or_else(|| json!({}));
    let Some(uri) = params.get("uri").and_then(|u| u.as_str()).map(str::to_string) else {
        return rpc::Response::err(id, rpc::RpcError::invalid_params("missing resource uri"));
    };

    // Route by `<upstream>__` prefix, falling back to the only upstream.
    let upstream = match uri.split_once(crate::tools::TOOL_SEPARATOR) {
        Some((prefix, _)) if state.upstreams.names().contains(&prefix.to_string()) => {
            prefix.to_string()
        }
        _ => {
            let names = state.upstreams.names();
            match names.len() {
                1 => names.into_iter().next().expect("one name"),
                _ => {
                    return rpc::Response::err(
                        id,
                        rpc::RpcError::invalid_params(format!(
                            "cannot route resource '{}' to an upstream",
                            uri
                        )),
                    )
                }
            }
        }
    };

    let ctx = base_context(identity, "resources/read", &uri);
    let read_uri = uri.clone();

    match enforce(
        state,
        ctx,
        json!({ "uri": read_uri }),
        &upstream,
        "resources/read",
        |transformed| transformed,
    )
    .await
    {
        Ok(result) => rpc::Response::ok(id, result),
        Err(e) => rpc::Response::err(id, e),
    }
}

fn base_context(identity: &ClientIdentity, action: &str, resource: &str) -> DecisionContext {
    let mut ctx = DecisionContext::new(identity.agent_id.clone(), action, resource);
    if let Some(session) = &identity.session_id {
        ctx = ctx.with_session(session.clone());
    }
    if let Some(ip) = &identity.client_ip {
        ctx = ctx.with_client_ip(ip.clone());
    }
    ctx
}

/// The decision + enforcement core shared by all policy-applicable methods
async fn enforce(
    state: &ProxyState,
    mut ctx: DecisionContext,
    payload: Value,
    upstream: &str,
    upstream_method: &str,
    make_params: impl FnOnce(Value) -> Value,
) -> Result<Value, rpc::RpcError> {
    let started = Instant::now();

    state.enrichers.enrich(&mut ctx).await;
    let ctx = ctx; // frozen before decision

    let decision_deadline = Duration::from_millis(state.config.decision_timeout_ms);
    let (decision, timed_out) =
        match tokio::time::timeout(decision_deadline, state.engine.decide(&ctx)).await {
            Ok(decision) => (decision, false),
            Err(_) => {
                warn!(request = %ctx.request_id, "decision deadline exceeded");
                let mut d = PolicyDecision::indeterminate(
                    format!("decision timed out after {}ms", decision_deadline.as_millis()),
                    aegis_core::DecisionMetadata::none(),
                );
                d.metadata.processing_time_ms = decision_deadline.as_millis() as u64;
                (d, true)
            }
        };

    if decision.outcome.enforced() != DecisionOutcome::Permit {
        state.failures.record(&ctx.agent_id);
        let audit_outcome = if timed_out {
            AuditOutcome::Error
        } else {
            AuditOutcome::Success
        };
        let error = rpc::RpcError::access_denied(
            decision.reason.clone(),
            decision.metadata.policy_id.as_deref(),
            deny_suggestions(&decision),
        );
        finish(
            state,
            ctx,
            decision,
            EnforcementRecord::default(),
            started,
            audit_outcome,
        )
        .await;
        return Err(error);
    }

    // ---- PERMIT path ----
    let constraints = with_default_rate_limit(state, decision.constraints.clone());

    // Outgoing constraints over the request arguments, in listed order.
    let outgoing = state.constraints.apply_all(&constraints, payload, &ctx).await;
    let mut constraint_results = outgoing.results;
    let transformed = match (outgoing.payload, outgoing.error) {
        (Some(payload), None) => payload,
        (_, error) => {
            let error = error.unwrap_or_else(|| Error::constraint("constraint failed"));
            let (rpc_error, audit_outcome) = match &error {
                Error::RateLimited { retry_after_ms } => (
                    rpc::RpcError::rate_limited(*retry_after_ms),
                    AuditOutcome::Failure,
                ),
                other => (
                    rpc::RpcError::policy_violation(other.to_string()),
                    AuditOutcome::Error,
                ),
            };
            metrics::counter!("aegis_enforcement_errors_total", "kind" => "constraint")
                .increment(1);
            finish(
                state,
                ctx,
                decision,
                EnforcementRecord {
                    constraints: constraint_results,
                    ..Default::default()
                },
                started,
                audit_outcome,
            )
            .await;
            return Err(rpc_error);
        }
    };

    // The single upstream call, only ever reached with a PERMIT in hand.
    let remaining = Duration::from_millis(state.config.request_timeout_ms)
        .saturating_sub(started.elapsed());
    let response = state
        .upstreams
        .request(upstream, upstream_method, Some(make_params(transformed)), remaining)
        .await;

    let upstream_result = match response {
        Ok(response) => {
            if let Some(error) = response.error {
                // Propagate the upstream's error code unchanged.
                finish(
                    state,
                    ctx,
                    decision,
                    EnforcementRecord {
                        constraints: constraint_results,
                        upstream: Some(format!("{}: error {}", upstream, error.code)),
                        ..Default::default()
                    },
                    started,
                    AuditOutcome::Failure,
                )
                .await;
                return Err(error);
            }
            response.result.unwrap_or(Value::Null)
        }
        Err(e) => {
            metrics::counter!("aegis_enforcement_errors_total", "kind" => "upstream")
                .increment(1);
            finish(
                state,
                ctx,
                decision,
                EnforcementRecord {
                    constraints: constraint_results,
                    upstream: Some(format!("{}: {}", upstream, e)),
                    ..Default::default()
                },
                started,
                AuditOutcome::Failure,
            )
            .await;
            return Err(rpc::RpcError::new(
                rpc::ACCESS_DENIED,
                "upstream unavailable",
            ));
        }
    };

    // Outgoing constraints over the response payload. Admission-style
    // constraints already ran; only payload transformations repeat here.
    let response_specs: Vec<ConstraintSpec> = constraints
        .iter()
        .filter(|c| matches!(c, ConstraintSpec::Anonymize { .. } | ConstraintSpec::Custom { .. }))
        .cloned()
        .collect();
    let incoming = state
        .constraints
        .apply_all(&response_specs, upstream_result, &ctx)
        .await;
    constraint_results.extend(incoming.results);
    let Some(final_payload) = incoming.payload else {
        metrics::counter!("aegis_enforcement_errors_total", "kind" => "constraint").increment(1);
        let detail = incoming
            .error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "constraint failed".to_string());
        finish(
            state,
            ctx,
            decision,
            EnforcementRecord {
                constraints: constraint_results,
                upstream: Some(format!("{}: ok", upstream)),
                ..Default::default()
            },
            started,
            AuditOutcome::Error,
        )
        .await;
        return Err(rpc::RpcError::policy_violation(detail));
    };

    // Obligations: everything except audit first, then the audit entry with
    // the full enforcement record. The audit executor is critical; if it
    // fails, the response is suppressed.
    let enforcement = EnforcementRecord {
        constraints: constraint_results,
        obligations: Vec::new(),
        upstream: Some(format!("{}: ok", upstream)),
    };
    match run_obligations(state, &ctx, &decision, enforcement, started, AuditOutcome::Success)
        .await
    {
        Ok(()) => {}
        Err(e) => {
            metrics::counter!("aegis_enforcement_errors_total", "kind" => "obligation")
                .increment(1);
            return Err(rpc::RpcError::internal(format!(
                "response suppressed: {}",
                e
            )));
        }
    }

    Ok(augment_result(final_payload, &ctx, &constraints))
}

/// Close out a denied or failed request: obligations (audit included) run,
/// the response does not depend on their outcome.
async fn finish(
    state: &ProxyState,
    ctx: DecisionContext,
    decision: PolicyDecision,
    enforcement: EnforcementRecord,
    started: Instant,
    outcome: AuditOutcome,
) {
    if let Err(e) =
        run_obligations(state, &ctx, &decision, enforcement, started, outcome).await
    {
        warn!(request = %ctx.request_id, "obligations failed on error path: {}", e);
    }
}

/// Execute the decision's obligations plus the guaranteed audit entry
async fn run_obligations(
    state: &ProxyState,
    ctx: &DecisionContext,
    decision: &PolicyDecision,
    mut enforcement: EnforcementRecord,
    started: Instant,
    outcome: AuditOutcome,
) -> aegis_core::Result<()> {
    let mut specs = decision.obligations.clone();
    if !specs.iter().any(|s| s.kind().starts_with("audit-log")) {
        specs.push(ObligationSpec::AuditLog {
            level: aegis_core::AuditLevel::Detailed,
            format: None,
        });
    }
    let (audit_specs, other_specs): (Vec<_>, Vec<_>) = specs
        .into_iter()
        .partition(|s| s.kind().starts_with("audit-log"));

    let policy = snapshot_policy(state, decision).await;

    let exchange = Arc::new(ObligationExchange {
        ctx: ctx.clone(),
        decision: decision.clone(),
        policy: policy.clone(),
        enforcement: enforcement.clone(),
        duration_ms: started.elapsed().as_millis() as u64,
        outcome,
    });
    let other_results = state.obligations.execute_all(&other_specs, exchange).await?;

    // The audit entry sees what every other obligation did.
    enforcement.obligations = other_results;
    let audit_exchange = Arc::new(ObligationExchange {
        ctx: ctx.clone(),
        decision: decision.clone(),
        policy,
        enforcement,
        duration_ms: started.elapsed().as_millis() as u64,
        outcome,
    });
    state
        .obligations
        .execute_all(&audit_specs, audit_exchange)
        .await?;
    Ok(())
}

async fn snapshot_policy(state: &ProxyState, decision: &PolicyDecision) -> Option<PolicySnapshot> {
    let id = decision.metadata.policy_id.as_ref()?;
    let uuid = id.parse().ok()?;
    let policy = state.store.get(uuid).await.ok()?;
    Some(PolicySnapshot {
        id: id.clone(),
        version: policy.metadata.version.to_string(),
        name: policy.name,
    })
}

/// Prepend the deployment's default per-agent rate limit when the decision
/// did not set one of its own
fn with_default_rate_limit(
    state: &ProxyState,
    mut constraints: Vec<ConstraintSpec>,
) -> Vec<ConstraintSpec> {
    if state.config.rate_limit_default > 0
        && !constraints.iter().any(|c| c.kind() == "rate-limit")
    {
        constraints.insert(
            0,
            ConstraintSpec::RateLimit {
                limit: state.config.rate_limit_default,
                window_ms: 60_000,
                scope: RateLimitScope::PerAgent,
            },
        );
    }
    constraints
}

fn deny_suggestions(decision: &PolicyDecision) -> Option<Vec<String>> {
    if decision.outcome == DecisionOutcome::NotApplicable {
        Some(vec![
            "no active policy covers this request; ask an administrator to add one".to_string(),
        ])
    } else {
        None
    }
}

/// Attach enforcement metadata the client can inspect
fn augment_result(mut payload: Value, ctx: &DecisionContext, constraints: &[ConstraintSpec]) -> Value {
    if let Some(object) = payload.as_object_mut() {
        let kinds: Vec<&str> = constraints.iter().map(|c| c.kind()).collect();
        let masked = constraints
            .iter()
            .any(|c| matches!(c, ConstraintSpec::Anonymize { .. }));
        object.insert(
            "_enforcement".to_string(),
            json!({
                "requestId": ctx.request_id,
                "constraintsApplied": kinds,
                "masked": masked,
            }),
        );
    }
    payload
}
