//! Aegis proxy
//!
//! The enforcement point of the system: terminates MCP sessions over stdio
//! and HTTP, routes permitted requests to the owning upstream, and carries
//! every request through the decision and enforcement pipeline.

pub mod config;
pub mod http;
pub mod hub;
pub mod pipeline;
pub mod stdio;
pub mod tools;
pub mod upstream;

pub use config::{AegisConfig, UpstreamSpec};
pub use hub::NotificationHub;
pub use pipeline::{handle_message, ClientIdentity, ProxyState};
pub use tools::{classify_risk, RiskLevel, ToolAggregate, ToolDescriptor};
pub use upstream::{UpstreamConnection, UpstreamManager, UpstreamNotification};

use aegis_engine::{CacheConfig, DecisionCache, DecisionEngine, EngineConfig, LlmConfig, LlmJudge};
use aegis_policy::{ClarityCheck, FilesystemStore, PolicyStore};
use aegis_telemetry::{AuditService, AuditStoreConfig};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Forward upstream notifications: invalidate the aggregated view when a
/// listing changes, then fan out to every connected client except the origin.
pub fn spawn_notification_pump(
    tools: Arc<ToolAggregate>,
    hub: Arc<NotificationHub>,
    mut notifications: tokio::sync::mpsc::UnboundedReceiver<UpstreamNotification>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(note) = notifications.recv().await {
            if note.message.method.ends_with("list_changed") {
                tools.invalidate(&note.origin);
            }
            hub.broadcast(&note.origin, &note.message);
        }
    })
}

/// Wire the full proxy state from configuration.
///
/// This is the composition root: everything the pipeline touches is built
/// here and passed explicitly, with no module-level singletons beyond the
/// logger and metrics recorder.
pub async fn build_state(config: AegisConfig) -> anyhow::Result<ProxyState> {
    let config = Arc::new(config);

    // Audit trail first: everything else reports into it.
    let audit = Arc::new(AuditService::new(AuditStoreConfig {
        dir: config.audit_path.clone(),
        ..Default::default()
    })?);

    // LLM judge, when an API key is configured.
    let judge = match &config.llm.api_key {
        Some(api_key) => {
            let mut llm = LlmConfig {
                api_key: api_key.clone(),
                ..Default::default()
            };
            if let Some(model) = &config.llm.model {
                llm.model = model.clone();
            }
            if let Some(base_url) = &config.llm.base_url {
                llm.base_url = base_url.clone();
            }
            Some(Arc::new(LlmJudge::new(llm)?))
        }
        None => {
            info!("no LLM api key configured; natural-language policies will be indeterminate");
            None
        }
    };

    // Policy store, with the judge doubling as the activation clarity check.
    let mut store = FilesystemStore::open(&config.policy_store_path)?;
    if let Some(judge) = &judge {
        store = store.with_clarity_check(Arc::clone(judge) as Arc<dyn ClarityCheck>);
    }
    let store: Arc<dyn PolicyStore> = Arc::new(store);

    // Decision cache, optionally backed by redis for replica sharing.
    let cache = if config.cache.enabled {
        let mut cache = DecisionCache::new(CacheConfig {
            l1_capacity: config.cache.l1_size,
            permit_ttl: Duration::from_millis(config.cache.permit_ttl_ms),
            deny_ttl: Duration::from_millis(config.cache.deny_ttl_ms),
            ..Default::default()
        });
        if let Some(url) = &config.cache.redis_url {
            match aegis_engine::RedisTier::connect(url).await {
                Ok(tier) => cache = cache.with_l2(Arc::new(tier)),
                Err(e) => warn!("l2 cache disabled: {}", e),
            }
        }
        Some(Arc::new(cache))
    } else {
        None
    };

    let mut engine = DecisionEngine::new(
        Arc::clone(&store),
        EngineConfig {
            confidence_threshold: config.confidence_threshold,
            conflict_strategy: config.conflict_strategy,
        },
    );
    if let Some(judge) = judge {
        engine = engine.with_judge(judge);
    }
    if let Some(cache) = cache {
        engine = engine.with_cache(cache);
    }

    // Enrichers share the failure tracker the transports record into.
    let failures = aegis_enrichers::FailureTracker::new();
    let enrichers = aegis_enrichers::standard_registry(
        config.enrichers.business_hours.clone(),
        config.enrichers.agents.clone(),
        config.enrichers.resources.clone(),
        config.enrichers.geo.clone(),
        config.enrichers.vpn_prefixes.clone(),
        failures.clone(),
    );

    let (upstreams, notifications) = UpstreamManager::new();
    let upstreams = Arc::new(upstreams);
    upstreams.spawn_all(&config.load_upstreams()?).await?;

    let tools = Arc::new(ToolAggregate::new(Duration::from_secs(10)));
    let hub = Arc::new(NotificationHub::new());

    spawn_notification_pump(Arc::clone(&tools), Arc::clone(&hub), notifications);

    Ok(ProxyState {
        constraints: Arc::new(aegis_enforce::standard_constraints()),
        obligations: Arc::new(aegis_enforce::standard_obligations(
            Arc::clone(&audit),
            config.obligation_workers,
        )),
        engine: Arc::new(engine),
        enrichers: Arc::new(enrichers),
        store,
        audit,
        upstreams,
        tools,
        hub,
        failures,
        config,
    })
}
