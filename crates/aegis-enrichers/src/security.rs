//! Security posture attributes

use crate::enricher::{AttributeBag, Enricher};
use aegis_core::{DecisionContext, Result};
use async_trait::async_trait;
use chrono::Timelike;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Window over which failed attempts count against an agent
const FAILURE_WINDOW: Duration = Duration::from_secs(15 * 60);

/// Shared tracker of authentication and policy failures per agent.
///
/// The proxy records failures as they happen; the enricher reads the count.
#[derive(Clone, Default)]
pub struct FailureTracker {
    inner: Arc<Mutex<HashMap<String, Vec<Instant>>>>,
}

impl FailureTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure for the agent
    pub fn record(&self, agent_id: &str) {
        self.inner
            .lock()
            .entry(agent_id.to_string())
            .or_default()
            .push(Instant::now());
    }

    /// Failures within the sliding window, pruning stale entries
    pub fn recent(&self, agent_id: &str) -> usize {
        let mut inner = self.inner.lock();
        match inner.get_mut(agent_id) {
            Some(entries) => {
                let cutoff = Instant::now() - FAILURE_WINDOW;
                entries.retain(|t| *t >= cutoff);
                entries.len()
            }
            None => 0,
        }
    }
}

/// Enricher producing IP, geo, and threat attributes
pub struct SecurityEnricher {
    /// IP prefix → location label
    geo_table: Vec<(String, String)>,

    /// IP prefixes recognized as the deployment's VPN egress
    vpn_prefixes: Vec<String>,

    failures: FailureTracker,
}

impl SecurityEnricher {
    /// Create with a geo table and VPN prefixes
    pub fn new(
        geo_table: Vec<(String, String)>,
        vpn_prefixes: Vec<String>,
        failures: FailureTracker,
    ) -> Self {
        Self {
            geo_table,
            vpn_prefixes,
            failures,
        }
    }

    fn locate(&self, ip: &str) -> Option<&str> {
        self.geo_table
            .iter()
            .find(|(prefix, _)| ip.starts_with(prefix.as_str()))
            .map(|(_, loc)| loc.as_str())
    }
}

#[async_trait]
impl Enricher for SecurityEnricher {
    fn name(&self) -> &str {
        "security"
    }

    async fn enrich(&self, ctx: &DecisionContext) -> Result<AttributeBag> {
        let mut bag = AttributeBag::new();
        let mut unusual: Vec<&str> = Vec::new();

        let failed = self.failures.recent(&ctx.agent_id);
        bag.insert("recentFailedAttempts".to_string(), json!(failed));
        if failed >= 3 {
            unusual.push("repeated-failures");
        }

        let hour = ctx.timestamp.hour();
        if !(6..22).contains(&hour) {
            unusual.push("off-hours-access");
        }

        if let Some(ip) = &ctx.client_ip {
            bag.insert("clientIP".to_string(), json!(ip));
            match self.locate(ip) {
                Some(location) => {
                    bag.insert("geoLocation".to_string(), json!(location));
                }
                None => {
                    unusual.push("unknown-origin");
                }
            }
            let on_vpn = self.vpn_prefixes.iter().any(|p| ip.starts_with(p.as_str()));
            bag.insert("onVpn".to_string(), json!(on_vpn));
        }

        let threat = match (failed, unusual.len()) {
            (f, _) if f >= 5 => "high",
            (_, u) if u >= 2 => "medium",
            (f, u) if f > 0 || u > 0 => "low",
            _ => "none",
        };
        bag.insert("threatLevel".to_string(), json!(threat));
        bag.insert("unusualActivity".to_string(), json!(unusual));

        // Score degrades with each signal; risk is its complement.
        let security_score =
            (1.0 - 0.15 * failed.min(5) as f64 - 0.1 * unusual.len() as f64).max(0.0);
        bag.insert("securityScore".to_string(), json!(security_score));
        bag.insert("riskScore".to_string(), json!(1.0 - security_score));

        Ok(bag)
    }
}
