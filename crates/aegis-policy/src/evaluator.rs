//! Structured rule pass of the hybrid decision engine
//!
//! Prohibitions are evaluated before permissions: a matching prohibition
//! denies outright, a matching permission permits and carries its duties as
//! obligations. Rules that match by action/target but fail their constraints
//! are reported distinctly so the engine can surface the failed constraint in
//! the final denial reason.

use crate::model::Policy;
use aegis_core::{DecisionContext, DecisionMetadata, PolicyDecision};
use tracing::debug;

/// Result of the structured pass over a single policy
#[derive(Debug)]
pub enum StructuredOutcome {
    /// A rule matched and its constraints held
    Decision(PolicyDecision),

    /// At least one rule matched by action/target/assignee, but its
    /// constraints were not satisfied; carries a description per failed rule
    ConstraintsFailed(Vec<String>),

    /// No rule matched the request at all
    NotApplicable,
}

/// Evaluate a policy's structured rules against the context.
///
/// Returns `NotApplicable` when the policy has no structured body.
pub fn evaluate(policy: &Policy, ctx: &DecisionContext) -> StructuredOutcome {
    let Some(rules) = &policy.rules else {
        return StructuredOutcome::NotApplicable;
    };

    let mut failures = Vec::new();

    for rule in &rules.prohibitions {
        if !rule.applies_to(ctx) {
            continue;
        }
        if rule.constraints_satisfied(ctx) {
            debug!(policy = %policy.name, action = %rule.action, "prohibition matched");
            return StructuredOutcome::Decision(PolicyDecision::deny(
                format!(
                    "prohibited by policy '{}' (action '{}')",
                    policy.name, rule.action
                ),
                DecisionMetadata::structured(policy.id.to_string()),
            ));
        }
        // A prohibition whose constraints fail simply does not prohibit.
    }

    for rule in &rules.permissions {
        if !rule.applies_to(ctx) {
            continue;
        }
        if rule.constraints_satisfied(ctx) {
            debug!(policy = %policy.name, action = %rule.action, "permission matched");
            let decision = PolicyDecision::permit(
                format!(
                    "permitted by policy '{}' (action '{}')",
                    policy.name, rule.action
                ),
                DecisionMetadata::structured(policy.id.to_string()),
            )
            .with_constraints(rule.transforms.clone())
            .with_obligations(rule.duties.clone());
            return StructuredOutcome::Decision(decision);
        }

        let failed: Vec<String> = rule
            .constraints
            .iter()
            .filter(|c| !c.satisfied(ctx))
            .map(|c| c.describe())
            .collect();
        failures.push(format!(
            "permission '{}' in policy '{}' not satisfied: {}",
            rule.action,
            policy.name,
            failed.join(", ")
        ));
    }

    if failures.is_empty() {
        StructuredOutcome::NotApplicable
    } else {
        StructuredOutcome::ConstraintsFailed(failures)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ApplicableContexts, PolicyDraft};
    use crate::rules::{Constraint, Operator, Rule, RuleSet};
    use aegis_core::{DecisionOutcome, ObligationSpec};
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use std::collections::BTreeSet;

    fn policy_with(rules: RuleSet) -> Policy {
        PolicyDraft {
            name: "test".to_string(),
            description: String::new(),
            text: None,
            rules: Some(rules),
            priority: 0,
            tags: BTreeSet::new(),
            created_by: "tests".to_string(),
            applicable: ApplicableContexts::default(),
        }
        .into_policy()
    }

    fn ctx_at(hour: u32) -> DecisionContext {
        DecisionContext::new("agent-1", "tools/call", "fs__read_file")
            .with_tool("fs__read_file")
            .with_timestamp(Utc.with_ymd_and_hms(2025, 6, 2, hour, 0, 0).unwrap())
    }

    fn window_rule() -> Rule {
        Rule::for_action("tools/call").with_constraint(Constraint::And {
            constraints: vec![
                Constraint::atomic("timeOfDay", Operator::Gteq, json!("09:00:00")),
                Constraint::atomic("timeOfDay", Operator::Lteq, json!("18:00:00")),
            ],
        })
    }

    #[test]
    fn test_permission_inside_window() {
        let policy = policy_with(RuleSet {
            permissions: vec![window_rule()],
            ..Default::default()
        });

        match evaluate(&policy, &ctx_at(10)) {
            StructuredOutcome::Decision(d) => {
                assert_eq!(d.outcome, DecisionOutcome::Permit);
                assert_eq!(d.confidence, 1.0);
            }
            other => panic!("expected permit, got {:?}", other),
        }
    }

    #[test]
    fn test_permission_outside_window_reports_constraint() {
        let policy = policy_with(RuleSet {
            permissions: vec![window_rule()],
            ..Default::default()
        });

        match evaluate(&policy, &ctx_at(20)) {
            StructuredOutcome::ConstraintsFailed(failures) => {
                assert_eq!(failures.len(), 1);
                assert!(failures[0].contains("timeOfDay"));
            }
            other => panic!("expected constraint failure, got {:?}", other),
        }
    }

    #[test]
    fn test_prohibition_wins_over_permission() {
        let policy = policy_with(RuleSet {
            permissions: vec![Rule::for_action("tools/call")],
            prohibitions: vec![Rule::for_action("tool:fs__*")],
            ..Default::default()
        });

        match evaluate(&policy, &ctx_at(10)) {
            StructuredOutcome::Decision(d) => {
                assert_eq!(d.outcome, DecisionOutcome::Deny);
                assert!(d.reason.contains("prohibited"));
            }
            other => panic!("expected deny, got {:?}", other),
        }
    }

    #[test]
    fn test_unmatched_prohibition_does_not_deny() {
        let policy = policy_with(RuleSet {
            permissions: vec![Rule::for_action("tools/call")],
            prohibitions: vec![Rule::for_action("tool:db__*")],
            ..Default::default()
        });

        match evaluate(&policy, &ctx_at(10)) {
            StructuredOutcome::Decision(d) => assert_eq!(d.outcome, DecisionOutcome::Permit),
            other => panic!("expected permit, got {:?}", other),
        }
    }

    #[test]
    fn test_duties_become_obligations() {
        let rule = Rule::for_action("tools/call").with_duty(ObligationSpec::AuditLog {
            level: aegis_core::AuditLevel::Full,
            format: None,
        });
        let policy = policy_with(RuleSet {
            permissions: vec![rule],
            ..Default::default()
        });

        match evaluate(&policy, &ctx_at(10)) {
            StructuredOutcome::Decision(d) => {
                assert_eq!(d.obligations.len(), 1);
                assert_eq!(d.obligations[0].kind(), "audit-log");
            }
            other => panic!("expected permit, got {:?}", other),
        }
    }

    #[test]
    fn test_transforms_become_decision_constraints() {
        let rule = Rule::for_action("tools/call").with_transform(
            aegis_core::ConstraintSpec::Anonymize {
                method: aegis_core::AnonymizeMethod::Mask,
                fields: Some(vec!["email".to_string()]),
            },
        );
        let policy = policy_with(RuleSet {
            permissions: vec![rule],
            ..Default::default()
        });

        match evaluate(&policy, &ctx_at(10)) {
            StructuredOutcome::Decision(d) => {
                assert_eq!(d.constraints.len(), 1);
                assert_eq!(d.constraints[0].kind(), "anonymize");
            }
            other => panic!("expected permit, got {:?}", other),
        }
    }

    #[test]
    fn test_no_rules_is_not_applicable() {
        let policy = policy_with(RuleSet {
            permissions: vec![Rule::for_action("resources/read")],
            ..Default::default()
        });

        assert!(matches!(
            evaluate(&policy, &ctx_at(10)),
            StructuredOutcome::NotApplicable
        ));
    }
}
