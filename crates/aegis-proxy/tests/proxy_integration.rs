//! End-to-end pipeline tests over mock upstreams

use aegis_core::{rpc, DecisionOutcome, Result as CoreResult};
use aegis_engine::{DecisionEngine, EngineConfig, JudgeOutcome, JudgeVerdict, PolicyJudge};
use aegis_enrichers::{AgentEnricher, AgentProfile, EnricherRegistry};
use aegis_policy::{
    ApplicableContexts, Constraint, MemoryStore, Operator, Policy, PolicyDraft, PolicyStore, Rule,
    RuleSet,
};
use aegis_proxy::{
    handle_message, spawn_notification_pump, ClientIdentity, NotificationHub, ProxyState,
    ToolAggregate, UpstreamConnection, UpstreamManager, UpstreamNotification,
};
use aegis_telemetry::{AuditService, AuditStoreConfig};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

struct MockUpstream {
    tools: Value,
    calls: Arc<AtomicU32>,
}

#[async_trait]
impl UpstreamConnection for MockUpstream {
    async fn request(
        &self,
        method: &str,
        _params: Option<Value>,
        _timeout: Duration,
    ) -> CoreResult<rpc::Response> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let result = match method {
            "tools/list" => json!({ "tools": self.tools }),
            "resources/list" => json!({ "resources": [{ "uri": "mem://doc" }] }),
            _ => json!({ "content": "fine" }),
        };
        Ok(rpc::Response::ok(json!(1), result))
    }
}

struct DenyingJudge {
    calls: Arc<AtomicU32>,
}

#[async_trait]
impl PolicyJudge for DenyingJudge {
    async fn judge(
        &self,
        _policy: &Policy,
        _ctx: &aegis_core::DecisionContext,
    ) -> CoreResult<JudgeOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(JudgeOutcome {
            verdict: JudgeVerdict {
                decision: DecisionOutcome::Deny,
                reason: "unknown agents look dangerous".to_string(),
                confidence: 0.95,
                constraints: vec![],
                obligations: vec![],
            },
            model: "mock".to_string(),
            attempts: 1,
            tokens: Default::default(),
        })
    }
}

struct Harness {
    state: ProxyState,
    upstream_calls: Arc<AtomicU32>,
    judge_calls: Arc<AtomicU32>,
    _dir: TempDir,
}

async fn harness(drafts: Vec<PolicyDraft>) -> Harness {
    let dir = TempDir::new().unwrap();

    let store = Arc::new(MemoryStore::new());
    for draft in drafts {
        let id = store.create(draft).await.unwrap();
        store.activate(id).await.unwrap();
    }

    let audit = Arc::new(
        AuditService::new(AuditStoreConfig {
            dir: dir.path().to_path_buf(),
            flush_every: 1,
            retention_days: 7,
        })
        .unwrap(),
    );

    let upstream_calls = Arc::new(AtomicU32::new(0));
    let (upstreams, _rx) = UpstreamManager::new();
    upstreams.register(
        "fs",
        Arc::new(MockUpstream {
            tools: json!([{ "name": "read_file", "description": "reads a file" }]),
            calls: Arc::clone(&upstream_calls),
        }),
    );

    let judge_calls = Arc::new(AtomicU32::new(0));
    let engine = DecisionEngine::new(store.clone(), EngineConfig::default()).with_judge(Arc::new(
        DenyingJudge {
            calls: Arc::clone(&judge_calls),
        },
    ));

    let mut directory = HashMap::new();
    directory.insert(
        "researcher".to_string(),
        AgentProfile {
            agent_type: "research".to_string(),
            department: None,
            clearance_level: Some(2),
            permissions: vec![],
            is_external: false,
            age_days: 500,
            inactive_days: 1,
            success_rate: 0.98,
            violation_count: 0,
        },
    );
    let mut enrichers = EnricherRegistry::new();
    enrichers.register(Arc::new(AgentEnricher::new(directory)));

    let state = ProxyState {
        config: Arc::new(aegis_proxy::AegisConfig::default()),
        store,
        engine: Arc::new(engine),
        enrichers: Arc::new(enrichers),
        constraints: Arc::new(aegis_enforce::standard_constraints()),
        obligations: Arc::new(aegis_enforce::standard_obligations(Arc::clone(&audit), 2)),
        audit,
        upstreams: Arc::new(upstreams),
        tools: Arc::new(ToolAggregate::new(Duration::from_secs(1))),
        hub: Arc::new(NotificationHub::new()),
        failures: aegis_enrichers::FailureTracker::new(),
    };

    Harness {
        state,
        upstream_calls,
        judge_calls,
        _dir: dir,
    }
}

fn draft(name: &str, text: Option<&str>, rules: Option<RuleSet>, priority: i32) -> PolicyDraft {
    PolicyDraft {
        name: name.to_string(),
        description: String::new(),
        text: text.map(str::to_string),
        rules,
        priority,
        tags: BTreeSet::new(),
        created_by: "tests".to_string(),
        applicable: ApplicableContexts::default(),
    }
}

fn researcher() -> ClientIdentity {
    ClientIdentity {
        agent_id: "researcher".to_string(),
        session_id: None,
        client_ip: None,
    }
}

fn call_tool(tool: &str) -> rpc::Request {
    rpc::Request::new(7, "tools/call", Some(json!({ "name": tool, "arguments": {} })))
}

#[tokio::test]
async fn test_structured_permission_beats_suspicious_judge() {
    // The policy permits research agents with decent trust during any hour;
    // its free text would make a naive judge deny an unfamiliar agent. The
    // structured pass must win without consulting the judge.
    let rules = RuleSet {
        permissions: vec![
            Rule::for_action("tools/call")
                .with_constraint(Constraint::atomic(
                    "agentType",
                    Operator::Eq,
                    json!("research"),
                ))
                .with_constraint(Constraint::atomic(
                    "trustScore",
                    Operator::Gteq,
                    json!(0.5),
                )),
        ],
        ..Default::default()
    };
    let h = harness(vec![draft(
        "research-access",
        Some("Deny anything that is not explicitly recognized as safe."),
        Some(rules),
        10,
    )])
    .await;

    let response = handle_message(&h.state, call_tool("fs__read_file"), &researcher())
        .await
        .unwrap();

    assert!(response.error.is_none(), "expected permit: {:?}", response.error);
    assert_eq!(h.judge_calls.load(Ordering::SeqCst), 0);
    // aggregation list + the permitted call
    assert_eq!(h.upstream_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_nl_only_policy_consults_judge() {
    let h = harness(vec![draft(
        "nl-gate",
        Some("Only well-known internal services may call tools."),
        None,
        5,
    )])
    .await;

    let response = handle_message(&h.state, call_tool("fs__read_file"), &researcher())
        .await
        .unwrap();

    let error = response.error.unwrap();
    assert_eq!(error.code, rpc::ACCESS_DENIED);
    assert_eq!(h.judge_calls.load(Ordering::SeqCst), 1);
    // denied before any upstream call beyond the listing
    assert_eq!(h.upstream_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_tools_list_is_aggregated_and_prefixed() {
    let h = harness(vec![draft(
        "allow",
        None,
        Some(RuleSet {
            permissions: vec![Rule::for_action("*")],
            ..Default::default()
        }),
        0,
    )])
    .await;

    let request = rpc::Request::new(1, "tools/list", None);
    let response = handle_message(&h.state, request, &researcher()).await.unwrap();
    let tools = response.result.unwrap()["tools"].clone();
    assert_eq!(tools[0]["name"], "fs__read_file");
}

#[tokio::test]
async fn test_notification_fanout_and_listing_invalidation() {
    let h = harness(vec![draft(
        "allow",
        None,
        Some(RuleSet {
            permissions: vec![Rule::for_action("*")],
            ..Default::default()
        }),
        0,
    )])
    .await;

    // wire a pump exactly as the composition root does
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<UpstreamNotification>();
    spawn_notification_pump(Arc::clone(&h.state.tools), Arc::clone(&h.state.hub), rx);

    // one connected client, plus a subscription standing in for the origin
    let (_client_id, mut client_rx) = h.state.hub.subscribe("client-agent");
    let (_origin_id, mut origin_rx) = h.state.hub.subscribe("fs");

    // prime the per-upstream resources cache
    let list = rpc::Request::new(2, "resources/list", None);
    handle_message(&h.state, list.clone(), &researcher()).await.unwrap();
    assert!(h.state.tools.has_cached_resources("fs"));
    let calls_after_prime = h.upstream_calls.load(Ordering::SeqCst);

    // upstream announces a change
    tx.send(UpstreamNotification {
        origin: "fs".to_string(),
        message: rpc::Request::notification("notifications/resources/list_changed", None),
    })
    .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // exactly one delivery to the client, none back to the origin
    assert_eq!(
        client_rx.try_recv().unwrap().method,
        "notifications/resources/list_changed"
    );
    assert!(client_rx.try_recv().is_err());
    assert!(origin_rx.try_recv().is_err());

    // the cached listing is gone and the next list refetches
    assert!(!h.state.tools.has_cached_resources("fs"));
    handle_message(&h.state, list, &researcher()).await.unwrap();
    assert!(h.upstream_calls.load(Ordering::SeqCst) > calls_after_prime);
}

#[tokio::test]
async fn test_resources_read_routes_to_single_upstream() {
    let h = harness(vec![draft(
        "allow",
        None,
        Some(RuleSet {
            permissions: vec![Rule::for_action("*")],
            ..Default::default()
        }),
        0,
    )])
    .await;

    let request = rpc::Request::new(3, "resources/read", Some(json!({ "uri": "mem://doc" })));
    let response = handle_message(&h.state, request, &researcher()).await.unwrap();
    assert!(response.error.is_none());
    assert_eq!(response.result.unwrap()["content"], "fine");
}

#[tokio::test]
async fn test_malformed_request_shape_rejected() {
    let h = harness(vec![]).await;

    let mut request = rpc::Request::new(4, "tools/call", None);
    request.jsonrpc = "1.9".to_string();
    let response = handle_message(&h.state, request, &researcher()).await.unwrap();
    assert_eq!(response.error.unwrap().code, rpc::INVALID_REQUEST);
}
