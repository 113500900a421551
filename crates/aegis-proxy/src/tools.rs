//! Aggregated tool and resource view
//!
//! Each upstream's tools are exposed under `<upstream>__<tool>`. The
//! aggregate is invalidated when an upstream announces a change and rebuilt
//! lazily on the next listing or call.

use crate::upstream::UpstreamManager;
use aegis_core::{Error, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Separator between upstream name and tool name
pub const TOOL_SEPARATOR: &str = "__";

/// Risk classification derived from the tool's surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

/// One aggregated tool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// Prefixed name clients see
    pub full_name: String,

    /// Owning upstream
    pub upstream: String,

    /// Name on the upstream
    pub original_name: String,

    /// Tool description from the upstream
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// JSON-schema input descriptor
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,

    /// Derived risk classification
    pub risk: RiskLevel,

    /// Whether calls go through the decision pipeline
    pub policy_applicable: bool,
}

/// Classify risk from the tool name and description
pub fn classify_risk(name: &str, description: Option<&str>) -> RiskLevel {
    let haystack = format!("{} {}", name, description.unwrap_or_default()).to_lowercase();
    const HIGH: &[&str] = &[
        "delete", "drop", "remove", "destroy", "exec", "shell", "command", "admin", "sudo",
        "credential", "secret",
    ];
    const MEDIUM: &[&str] = &["write", "update", "create", "send", "post", "modify", "move"];

    if HIGH.iter().any(|kw| haystack.contains(kw)) {
        RiskLevel::High
    } else if MEDIUM.iter().any(|kw| haystack.contains(kw)) {
        RiskLevel::Medium
    } else {
        RiskLevel::Low
    }
}

#[derive(Default)]
struct AggregateState {
    tools: HashMap<String, ToolDescriptor>,
    /// Cached `resources/list` result per upstream
    resources: HashMap<String, Value>,
    /// Upstreams whose view is stale
    stale: HashSet<String>,
    built: bool,
}

/// Process-wide aggregated view over all upstreams
pub struct ToolAggregate {
    state: RwLock<AggregateState>,
    list_timeout: Duration,
}

impl ToolAggregate {
    /// Create an empty aggregate
    pub fn new(list_timeout: Duration) -> Self {
        Self {
            state: RwLock::new(AggregateState::default()),
            list_timeout,
        }
    }

    /// Mark one upstream's view stale; the next read rebuilds it
    pub fn invalidate(&self, upstream: &str) {
        let mut state = self.state.write();
        state.stale.insert(upstream.to_string());
        state.resources.remove(upstream);
        debug!(upstream = %upstream, "aggregated view invalidated");
    }

    /// Whether a cached resources listing exists for the upstream
    pub fn has_cached_resources(&self, upstream: &str) -> bool {
        self.state.read().resources.contains_key(upstream)
    }

    /// Resolve a prefixed tool name to (upstream, original name)
    pub async fn resolve(
        &self,
        manager: &UpstreamManager,
        full_name: &str,
    ) -> Result<ToolDescriptor> {
        self.ensure_fresh(manager).await;
        self.state
            .read()
            .tools
            .get(full_name)
            .cloned()
            .ok_or_else(|| Error::transport(format!("unknown tool '{}'", full_name)))
    }

    /// The aggregated tool list as MCP `tools/list` content
    pub async fn list_tools(&self, manager: &UpstreamManager) -> Vec<Value> {
        self.ensure_fresh(manager).await;
        let state = self.state.read();
        let mut tools: Vec<&ToolDescriptor> = state.tools.values().collect();
        tools.sort_by(|a, b| a.full_name.cmp(&b.full_name));
        tools
            .iter()
            .map(|t| {
                serde_json::json!({
                    "name": t.full_name,
                    "description": t.description,
                    "inputSchema": t.input_schema.clone().unwrap_or_else(|| serde_json::json!({"type": "object"})),
                })
            })
            .collect()
    }

    /// The aggregated resources listing, cached per upstream
    pub async fn list_resources(&self, manager: &UpstreamManager) -> Vec<Value> {
        let names = manager.names();
        let mut all = Vec::new();

        for name in names {
            if let Some(cached) = self.state.read().resources.get(&name) {
                if let Some(items) = cached.as_array() {
                    all.extend(items.iter().cloned());
                }
                continue;
            }

            match manager
                .request(&name, "resources/list", None, self.list_timeout)
                .await
            {
                Ok(response) => {
                    let items = response
                        .result
                        .and_then(|r| r.get("resources").cloned())
                        .unwrap_or_else(|| serde_json::json!([]));
                    if let Some(list) = items.as_array() {
                        all.extend(list.iter().cloned());
                    }
                    self.state.write().resources.insert(name, items);
                }
                Err(e) => warn!(upstream = %name, "resources/list failed: {}", e),
            }
        }
        all
    }

    /// Rebuild stale upstream views (or everything on first use)
    async fn ensure_fresh(&self, manager: &UpstreamManager) {
        let to_refresh: Vec<String> = {
            let state = self.state.read();
            if !state.built {
                manager.names()
            } else {
                state.stale.iter().cloned().collect()
            }
        };
        if to_refresh.is_empty() {
            return;
        }

        for name in &to_refresh {
            match manager
                .request(name, "tools/list", None, self.list_timeout)
                .await
            {
                Ok(response) => {
                    let tools = parse_tools(name, response.result.as_ref());
                    let mut state = self.state.write();
                    state.tools.retain(|_, t| &t.upstream != name);
                    for tool in tools {
                        state.tools.insert(tool.full_name.clone(), tool);
                    }
                    state.stale.remove(name);
                }
                Err(e) => warn!(upstream = %name, "tools/list failed: {}", e),
            }
        }

        let mut state = self.state.write();
        if !state.built {
            state.built = true;
            info!(tools = state.tools.len(), "tool aggregate built");
        }
    }
}

fn parse_tools(upstream: &str, result: Option<&Value>) -> Vec<ToolDescriptor> {
    let Some(items) = result.and_then(|r| r.get("tools")).and_then(|t| t.as_array()) else {
        return Vec::new();
    };

    items
        .iter()
        .filter_map(|item| {
            let name = item.get("name")?.as_str()?;
            let description = item
                .get("description")
                .and_then(|d| d.as_str())
                .map(str::to_string);
            Some(ToolDescriptor {
                full_name: format!("{}{}{}", upstream, TOOL_SEPARATOR, name),
                upstream: upstream.to_string(),
                original_name: name.to_string(),
                risk: classify_risk(name, description.as_deref()),
                description,
                input_schema: item.get("inputSchema").cloned(),
                policy_applicable: true,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::UpstreamConnection;
    use aegis_core::rpc;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct ListingUpstream {
        tools: Value,
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl UpstreamConnection for ListingUpstream {
        async fn request(
            &self,
            method: &str,
            _params: Option<Value>,
            _timeout: Duration,
        ) -> aegis_core::Result<rpc::Response> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let result = match method {
                "tools/list" => serde_json::json!({"tools": self.tools}),
                "resources/list" => serde_json::json!({"resources": [{"uri": "mem://a"}]}),
                _ => serde_json::json!({}),
            };
            Ok(rpc::Response::ok(serde_json::json!(1), result))
        }
    }

    fn manager_with(tools: Value, calls: Arc<AtomicU32>) -> UpstreamManager {
        let (manager, _rx) = UpstreamManager::new();
        manager.register("fs", Arc::new(ListingUpstream { tools, calls }));
        manager
    }

    #[test]
    fn test_risk_classification() {
        assert_eq!(classify_risk("read_file", None), RiskLevel::Low);
        assert_eq!(classify_risk("write_file", None), RiskLevel::Medium);
        assert_eq!(classify_risk("delete_table", None), RiskLevel::High);
        assert_eq!(
            classify_risk("run", Some("executes a shell command")),
            RiskLevel::High
        );
    }

    #[tokio::test]
    async fn test_tools_registered_under_prefix() {
        let calls = Arc::new(AtomicU32::new(0));
        let manager = manager_with(
            serde_json::json!([{"name": "read_file", "description": "reads"}]),
            calls,
        );
        let aggregate = ToolAggregate::new(Duration::from_secs(1));

        let tools = aggregate.list_tools(&manager).await;
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0]["name"], "fs__read_file");

        let descriptor = aggregate.resolve(&manager, "fs__read_file").await.unwrap();
        assert_eq!(descriptor.upstream, "fs");
        assert_eq!(descriptor.original_name, "read_file");
    }

    #[tokio::test]
    async fn test_unknown_tool_rejected() {
        let manager = manager_with(serde_json::json!([]), Arc::new(AtomicU32::new(0)));
        let aggregate = ToolAggregate::new(Duration::from_secs(1));
        assert!(aggregate.resolve(&manager, "fs__ghost").await.is_err());
    }

    #[tokio::test]
    async fn test_invalidation_triggers_refetch() {
        let calls = Arc::new(AtomicU32::new(0));
        let manager = manager_with(serde_json::json!([{"name": "a"}]), Arc::clone(&calls));
        let aggregate = ToolAggregate::new(Duration::from_secs(1));

        aggregate.list_tools(&manager).await;
        aggregate.list_tools(&manager).await;
        let after_two_lists = calls.load(Ordering::SeqCst);
        assert_eq!(after_two_lists, 1, "second list must be served from cache");

        aggregate.invalidate("fs");
        aggregate.list_tools(&manager).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2, "invalidation must refetch");
    }

    #[tokio::test]
    async fn test_resources_cache_and_invalidation() {
        let calls = Arc::new(AtomicU32::new(0));
        let manager = manager_with(serde_json::json!([]), Arc::clone(&calls));
        let aggregate = ToolAggregate::new(Duration::from_secs(1));

        let resources = aggregate.list_resources(&manager).await;
        assert_eq!(resources.len(), 1);
        assert!(aggregate.has_cached_resources("fs"));

        aggregate.list_resources(&manager).await;
        let cached_calls = calls.load(Ordering::SeqCst);

        aggregate.invalidate("fs");
        assert!(!aggregate.has_cached_resources("fs"));
        aggregate.list_resources(&manager).await;
        assert!(calls.load(Ordering::SeqCst) > cached_calls);
    }
}
