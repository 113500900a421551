//! Agent attributes from a directory of registered agents

use crate::enricher::{AttributeBag, Enricher};
use aegis_core::{DecisionContext, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;

/// Directory entry for a known agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentProfile {
    /// Agent category (research, operations, external, ...)
    pub agent_type: String,

    /// Owning department
    #[serde(default)]
    pub department: Option<String>,

    /// Clearance level for classified resources
    #[serde(default)]
    pub clearance_level: Option<i64>,

    /// Named permissions granted out of band
    #[serde(default)]
    pub permissions: Vec<String>,

    /// Whether the agent belongs to an external party
    #[serde(default)]
    pub is_external: bool,

    /// Days since registration
    #[serde(default)]
    pub age_days: u32,

    /// Days since last activity
    #[serde(default)]
    pub inactive_days: u32,

    /// Fraction of past requests that completed successfully
    #[serde(default = "default_success_rate")]
    pub success_rate: f64,

    /// Recorded policy violations
    #[serde(default)]
    pub violation_count: u32,
}

fn default_success_rate() -> f64 {
    1.0
}

impl AgentProfile {
    /// Trust score in [0, 1] derived from age, success rate, and violations.
    ///
    /// A year of history earns the full age credit; every violation costs a
    /// tenth; long inactivity decays the result.
    pub fn trust_score(&self) -> f64 {
        let age_credit = (self.age_days as f64 / 365.0).min(1.0) * 0.3;
        let success_credit = self.success_rate.clamp(0.0, 1.0) * 0.5;
        let base = 0.2 + age_credit + success_credit;
        let penalty = self.violation_count as f64 * 0.1;
        let decay = if self.inactive_days > 90 { 0.1 } else { 0.0 };
        (base - penalty - decay).clamp(0.0, 1.0)
    }
}

/// Enricher resolving agent identity against the directory
pub struct AgentEnricher {
    directory: HashMap<String, AgentProfile>,
}

impl AgentEnricher {
    /// Create from a directory map
    pub fn new(directory: HashMap<String, AgentProfile>) -> Self {
        Self { directory }
    }
}

#[async_trait]
impl Enricher for AgentEnricher {
    fn name(&self) -> &str {
        "agent"
    }

    async fn enrich(&self, ctx: &DecisionContext) -> Result<AttributeBag> {
        let mut bag = AttributeBag::new();

        match self.directory.get(&ctx.agent_id) {
            Some(profile) => {
                bag.insert("agentType".to_string(), json!(profile.agent_type));
                if let Some(dept) = &profile.department {
                    bag.insert("department".to_string(), json!(dept));
                }
                if let Some(level) = profile.clearance_level {
                    bag.insert("clearanceLevel".to_string(), json!(level));
                }
                bag.insert("trustScore".to_string(), json!(profile.trust_score()));
                bag.insert("permissions".to_string(), json!(profile.permissions));
                bag.insert("isExternal".to_string(), json!(profile.is_external));
                bag.insert("ageDays".to_string(), json!(profile.age_days));
                bag.insert("inactiveDays".to_string(), json!(profile.inactive_days));
            }
            None => {
                // Unknown agents get a floor trust score, not a free pass.
                bag.insert("agentType".to_string(), json!("unknown"));
                bag.insert("trustScore".to_string(), json!(0.1));
                bag.insert("isExternal".to_string(), json!(true));
            }
        }

        Ok(bag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory() -> HashMap<String, AgentProfile> {
        let mut dir = HashMap::new();
        dir.insert(
            "research-7".to_string(),
            AgentProfile {
                agent_type: "research".to_string(),
                department: Some("r-and-d".to_string()),
                clearance_level: Some(3),
                permissions: vec!["read".to_string()],
                is_external: false,
                age_days: 400,
                inactive_days: 2,
                success_rate: 0.95,
                violation_count: 0,
            },
        );
        dir
    }

    #[tokio::test]
    async fn test_known_agent_attributes() {
        let enricher = AgentEnricher::new(directory());
        let ctx = DecisionContext::new("research-7", "tools/call", "r");
        let bag = enricher.enrich(&ctx).await.unwrap();

        assert_eq!(bag["agentType"], json!("research"));
        assert_eq!(bag["clearanceLevel"], json!(3));
        assert_eq!(bag["isExternal"], json!(false));
        let trust = bag["trustScore"].as_f64().unwrap();
        assert!(trust > 0.9, "mature clean agent should score high: {}", trust);
    }

    #[tokio::test]
    async fn test_unknown_agent_floor() {
        let enricher = AgentEnricher::new(directory());
        let ctx = DecisionContext::new("stranger", "tools/call", "r");
        let bag = enricher.enrich(&ctx).await.unwrap();

        assert_eq!(bag["agentType"], json!("unknown"));
        assert_eq!(bag["isExternal"], json!(true));
        assert!(bag["trustScore"].as_f64().unwrap() < 0.2);
    }

    #[test]
    fn test_violations_reduce_trust() {
        let mut profile = AgentProfile {
            agent_type: "ops".to_string(),
            department: None,
            clearance_level: None,
            permissions: vec![],
            is_external: false,
            age_days: 365,
            inactive_days: 0,
            success_rate: 1.0,
            violation_count: 0,
        };
        let clean = profile.trust_score();
        profile.violation_count = 3;
        let tainted = profile.trust_score();
        assert!(tainted < clean);
        assert!((clean - tainted - 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_trust_score_clamped() {
        let profile = AgentProfile {
            agent_type: "ops".to_string(),
            department: None,
            clearance_level: None,
            permissions: vec![],
            is_external: false,
            age_days: 0,
            inactive_days: 365,
            success_rate: 0.0,
            violation_count: 10,
        };
        assert_eq!(profile.trust_score(), 0.0);
    }
}
