//! Natural-language to structured rule conversion
//!
//! A best-effort extractor: each pattern in the library contributes rules
//! when its phrasing appears in the policy text. The natural-language source
//! is always preserved alongside whatever structure is extracted; the
//! converter only reports what it recognized and how confident it is.

use crate::rules::{Constraint, Operator, Rule, RuleSet};
use regex::Regex;
use serde_json::json;

/// Result of a conversion attempt
#[derive(Debug, Clone)]
pub struct ConversionOutcome {
    /// Extracted rules; empty when nothing was recognized
    pub rules: RuleSet,

    /// Confidence in [0, 1] that the extraction captures the text's intent
    pub confidence: f64,

    /// Names of the library patterns that matched
    pub matched_patterns: Vec<String>,
}

/// Pattern-library converter
pub struct NlConverter {
    time_window: Regex,
    business_hours: Regex,
    trust_threshold: Regex,
    agent_type: Regex,
    classification: Regex,
    emergency: Regex,
    delegation_depth: Regex,
    negation: Regex,
}

impl NlConverter {
    /// Compile the pattern library
    pub fn new() -> Self {
        Self {
            time_window: Regex::new(
                r"(?i)between\s+(\d{1,2}(?::\d{2})?)\s*(am|pm)?\s+and\s+(\d{1,2}(?::\d{2})?)\s*(am|pm)?",
            )
            .expect("static regex"),
            business_hours: Regex::new(r"(?i)\bbusiness\s+hours\b").expect("static regex"),
            trust_threshold: Regex::new(
                r"(?i)trust\s*(?:score)?\s*(?:of\s+)?(?:at\s+least|above|over|not\s+(?:less|lower)\s+than|>=?)\s*(\d*\.?\d+)",
            )
            .expect("static regex"),
            agent_type: Regex::new(
                r"(?i)\b(research|operations|analytics|external|admin(?:istrative)?)\s+agents?\b",
            )
            .expect("static regex"),
            classification: Regex::new(
                r"(?i)\b(public|internal|confidential|restricted)\s+(?:data|resources?|documents?|information)\b",
            )
            .expect("static regex"),
            emergency: Regex::new(r"(?i)\bemergenc(?:y|ies)\b").expect("static regex"),
            delegation_depth: Regex::new(
                r"(?i)delegation\s+depth\s*(?:of\s+)?(?:at\s+most|no\s+more\s+than|under|below|<=?)\s*(\d+)",
            )
            .expect("static regex"),
            negation: Regex::new(
                r"(?i)\b(?:not|never|no|denied|prohibited|forbidden|blocked|must\s+not|may\s+not|cannot)\b",
            )
            .expect("static regex"),
        }
    }

    /// Extract whatever rules the library recognizes in `text`
    pub fn convert(&self, text: &str) -> ConversionOutcome {
        let mut rules = RuleSet::default();
        let mut matched = Vec::new();
        let denies = self.negation.is_match(text);

        if let Some(caps) = self.time_window.captures(text) {
            let start = normalize_time(&caps[1], caps.get(2).map(|m| m.as_str()));
            let end = normalize_time(&caps[3], caps.get(4).map(|m| m.as_str()));
            push_rule(
                &mut rules,
                denies,
                Rule::for_action("*").with_constraint(Constraint::And {
                    constraints: vec![
                        Constraint::atomic("timeOfDay", Operator::Gteq, json!(start)),
                        Constraint::atomic("timeOfDay", Operator::Lteq, json!(end)),
                    ],
                }),
            );
            matched.push("time-window".to_string());
        } else if self.business_hours.is_match(text) {
            push_rule(
                &mut rules,
                denies,
                Rule::for_action("*").with_constraint(Constraint::And {
                    constraints: vec![
                        Constraint::atomic("timeOfDay", Operator::Gteq, json!("09:00:00")),
                        Constraint::atomic("timeOfDay", Operator::Lteq, json!("18:00:00")),
                    ],
                }),
            );
            matched.push("business-hours".to_string());
        }

        if let Some(caps) = self.trust_threshold.captures(text) {
            if let Ok(threshold) = caps[1].parse::<f64>() {
                rules.permissions.push(
                    Rule::for_action("*").with_constraint(Constraint::atomic(
                        "trustScore",
                        Operator::Gteq,
                        json!(threshold),
                    )),
                );
                matched.push("trust-threshold".to_string());
            }
        }

        if let Some(caps) = self.agent_type.captures(text) {
            let agent_type = caps[1].to_lowercase();
            let constraint =
                Constraint::atomic("agentType", Operator::Eq, json!(agent_type));
            push_rule(&mut rules, denies, Rule::for_action("*").with_constraint(constraint));
            matched.push("agent-type".to_string());
        }

        if let Some(caps) = self.classification.captures(text) {
            let level = caps[1].to_lowercase();
            let constraint =
                Constraint::atomic("resourceClassification", Operator::Eq, json!(level));
            push_rule(&mut rules, denies, Rule::for_action("*").with_constraint(constraint));
            matched.push("resource-classification".to_string());
        }

        if self.emergency.is_match(text) && !denies {
            rules.permissions.push(Rule::for_action("*").with_constraint(
                Constraint::atomic("emergencyFlag", Operator::Eq, json!(true)),
            ));
            matched.push("emergency-override".to_string());
        }

        if let Some(caps) = self.delegation_depth.captures(text) {
            if let Ok(depth) = caps[1].parse::<i64>() {
                rules.permissions.push(
                    Rule::for_action("*").with_constraint(Constraint::atomic(
                        "delegationDepth",
                        Operator::Lteq,
                        json!(depth),
                    )),
                );
                matched.push("delegation-depth".to_string());
            }
        }

        let confidence = match matched.len() {
            0 => 0.0,
            n => (0.4 + 0.15 * (n as f64 - 1.0)).min(0.9),
        };

        ConversionOutcome {
            rules,
            confidence,
            matched_patterns: matched,
        }
    }
}

impl Default for NlConverter {
    fn default() -> Self {
        Self::new()
    }
}

fn push_rule(rules: &mut RuleSet, denies: bool, rule: Rule) {
    if denies {
        rules.prohibitions.push(rule);
    } else {
        rules.permissions.push(rule);
    }
}

/// Normalize "9", "9:30", "6pm" into zero-padded `HH:MM:SS`
fn normalize_time(raw: &str, meridiem: Option<&str>) -> String {
    let (hour_part, minute_part) = match raw.split_once(':') {
        Some((h, m)) => (h, m),
        None => (raw, "00"),
    };
    let mut hour: u32 = hour_part.trim().parse().unwrap_or(0);
    if let Some(m) = meridiem {
        if m.eq_ignore_ascii_case("pm") && hour < 12 {
            hour += 12;
        }
        if m.eq_ignore_ascii_case("am") && hour == 12 {
            hour = 0;
        }
    }
    format!("{:02}:{}:00", hour, minute_part.trim())
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_core::DecisionContext;
    use chrono::{TimeZone, Utc};

    fn converter() -> NlConverter {
        NlConverter::new()
    }

    #[test]
    fn test_time_window_extraction() {
        let outcome =
            converter().convert("Access is permitted between 9:00 and 18:00 on weekdays.");
        assert!(outcome.matched_patterns.contains(&"time-window".to_string()));
        assert_eq!(outcome.rules.permissions.len(), 1);
        assert!(outcome.confidence > 0.0);
    }

    #[test]
    fn test_meridiem_normalization() {
        let outcome = converter().convert("Reads are allowed between 9 am and 6 pm.");
        let rule = &outcome.rules.permissions[0];
        let json = serde_json::to_value(&rule.constraints[0]).unwrap();
        assert_eq!(json["constraints"][0]["rightOperand"], "09:00:00");
        assert_eq!(json["constraints"][1]["rightOperand"], "18:00:00");
    }

    #[test]
    fn test_extracted_window_evaluates() {
        let outcome = converter().convert("Permitted between 09:00 and 18:00.");
        let rule = &outcome.rules.permissions[0];

        let inside = DecisionContext::new("a", "tools/call", "r")
            .with_timestamp(Utc.with_ymd_and_hms(2025, 6, 2, 10, 0, 0).unwrap());
        let outside = DecisionContext::new("a", "tools/call", "r")
            .with_timestamp(Utc.with_ymd_and_hms(2025, 6, 2, 20, 0, 0).unwrap());
        assert!(rule.constraints_satisfied(&inside));
        assert!(!rule.constraints_satisfied(&outside));
    }

    #[test]
    fn test_trust_threshold() {
        let outcome =
            converter().convert("Agents with a trust score of at least 0.7 may call tools.");
        assert!(outcome
            .matched_patterns
            .contains(&"trust-threshold".to_string()));
        let json = serde_json::to_value(&outcome.rules.permissions[0].constraints[0]).unwrap();
        assert_eq!(json["rightOperand"], 0.7);
    }

    #[test]
    fn test_negated_agent_type_becomes_prohibition() {
        let outcome =
            converter().convert("External agents must not access confidential data.");
        assert!(outcome.rules.permissions.is_empty());
        // both agent-type and resource-classification patterns land as prohibitions
        assert_eq!(outcome.rules.prohibitions.len(), 2);
        assert!(outcome.matched_patterns.contains(&"agent-type".to_string()));
        assert!(outcome
            .matched_patterns
            .contains(&"resource-classification".to_string()));
    }

    #[test]
    fn test_delegation_depth() {
        let outcome =
            converter().convert("Requests require a delegation depth of at most 2.");
        assert!(outcome
            .matched_patterns
            .contains(&"delegation-depth".to_string()));
    }

    #[test]
    fn test_unrecognized_text_has_zero_confidence() {
        let outcome = converter().convert("Be excellent to each other.");
        assert!(outcome.rules.is_empty());
        assert_eq!(outcome.confidence, 0.0);
        assert!(outcome.matched_patterns.is_empty());
    }

    #[test]
    fn test_confidence_grows_with_matches() {
        let single = converter().convert("Permitted between 09:00 and 18:00.");
        let double = converter()
            .convert("Permitted between 09:00 and 18:00 for agents with trust score of at least 0.5.");
        assert!(double.confidence > single.confidence);
        assert!(double.confidence <= 0.9);
    }
}
