//! LLM judge interface and prompt construction

use aegis_core::{ConstraintSpec, DecisionContext, DecisionOutcome, ObligationSpec, Result, TokenUsage};
use aegis_policy::Policy;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Structured verdict the judge must return.
///
/// This is exactly the JSON schema spelled out in the prompt; responses that
/// do not deserialize into it get one repair re-prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeVerdict {
    /// PERMIT, DENY, INDETERMINATE, or NOT_APPLICABLE
    pub decision: DecisionOutcome,

    /// Explanation citing the policy text
    pub reason: String,

    /// Self-assessed confidence in [0, 1]
    pub confidence: f64,

    /// Constraints the policy implies for a permit
    #[serde(default)]
    pub constraints: Vec<ConstraintSpec>,

    /// Obligations the policy imposes
    #[serde(default)]
    pub obligations: Vec<ObligationSpec>,
}

/// A verdict plus accounting from the call that produced it
#[derive(Debug, Clone)]
pub struct JudgeOutcome {
    /// The parsed verdict
    pub verdict: JudgeVerdict,

    /// Model that answered
    pub model: String,

    /// Attempts made, including retries and the repair re-prompt
    pub attempts: u32,

    /// Token usage across all attempts
    pub tokens: TokenUsage,
}

/// Judgment of a natural-language policy against an enriched context
#[async_trait]
pub trait PolicyJudge: Send + Sync {
    /// Evaluate the policy text for this request
    async fn judge(&self, policy: &Policy, ctx: &DecisionContext) -> Result<JudgeOutcome>;
}

/// Render the enriched context as the compact listing the prompt embeds
pub fn format_context(ctx: &DecisionContext) -> String {
    let mut lines = vec![
        format!("agent: {}", ctx.agent_id),
        format!("action: {}", ctx.action),
        format!("resource: {}", ctx.resource),
        format!("timestamp: {}", ctx.timestamp.to_rfc3339()),
    ];
    if let Some(tool) = &ctx.tool {
        lines.push(format!("tool: {}", tool));
    }
    if let Some(t) = &ctx.agent.agent_type {
        lines.push(format!("agentType: {}", t));
    }
    if let Some(score) = ctx.agent.trust_score {
        lines.push(format!("trustScore: {:.2}", score));
    }
    if let Some(c) = &ctx.resource_attrs.classification {
        lines.push(format!("resourceClassification: {}", c));
    }
    if let Some(risk) = ctx.risk_score {
        lines.push(format!("riskScore: {:.2}", risk));
    }
    if ctx.emergency {
        lines.push("emergencyFlag: true".to_string());
    }
    for (key, value) in &ctx.environment {
        lines.push(format!("{}: {}", key, value));
    }
    lines.join("\n")
}

/// Build the judge prompt for a policy and context
pub fn build_prompt(policy: &Policy, ctx: &DecisionContext) -> String {
    let text = policy.text.as_deref().unwrap_or_default();
    format!(
        "You are an access-control judge. Decide whether the request described \
         below complies with the policy.\n\n\
         POLICY \"{name}\":\n{text}\n\n\
         REQUEST:\n{context}\n\n\
         Respond with a single JSON object and nothing else:\n\
         {{\n\
         \x20 \"decision\": \"PERMIT\" | \"DENY\" | \"INDETERMINATE\" | \"NOT_APPLICABLE\",\n\
         \x20 \"reason\": \"<one sentence citing the policy>\",\n\
         \x20 \"confidence\": <number between 0 and 1>,\n\
         \x20 \"constraints\": [],\n\
         \x20 \"obligations\": []\n\
         }}\n\
         Use NOT_APPLICABLE when the policy does not speak to this request.",
        name = policy.name,
        text = text,
        context = format_context(ctx),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_policy::PolicyDraft;
    use std::collections::BTreeSet;

    #[test]
    fn test_verdict_parses_from_judge_json() {
        let json = r#"{
            "decision": "PERMIT",
            "reason": "the agent is trusted",
            "confidence": 0.85,
            "constraints": [{"type": "anonymize", "method": "mask", "fields": ["email"]}]
        }"#;
        let verdict: JudgeVerdict = serde_json::from_str(json).unwrap();
        assert_eq!(verdict.decision, DecisionOutcome::Permit);
        assert_eq!(verdict.constraints.len(), 1);
        assert!(verdict.obligations.is_empty());
    }

    #[test]
    fn test_prompt_carries_policy_and_context() {
        let policy = PolicyDraft {
            name: "after-hours".to_string(),
            description: String::new(),
            text: Some("Deny access outside business hours.".to_string()),
            rules: None,
            priority: 0,
            tags: BTreeSet::new(),
            created_by: "tests".to_string(),
            applicable: Default::default(),
        }
        .into_policy();

        let mut ctx = DecisionContext::new("agent-9", "tools/call", "db__query");
        ctx.agent.trust_score = Some(0.42);

        let prompt = build_prompt(&policy, &ctx);
        assert!(prompt.contains("Deny access outside business hours."));
        assert!(prompt.contains("agent: agent-9"));
        assert!(prompt.contains("trustScore: 0.42"));
        assert!(prompt.contains("\"decision\""));
    }
}
