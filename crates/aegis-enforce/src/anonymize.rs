//! Field anonymization
//!
//! Masks, tokenizes, or hashes sensitive values inside structured payloads.
//! With named fields the whole field value is rewritten wherever it appears
//! in the object tree; without them PII is auto-detected by regex inside
//! every string.

use crate::constraint::ConstraintProcessor;
use aegis_core::{AnonymizeMethod, ConstraintSpec, DecisionContext, Error, Result};
use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Constraint processor for `anonymize` descriptors
pub struct Anonymizer {
    email: Regex,
    phone: Regex,
    ssn: Regex,
    credit_card: Regex,
}

impl Anonymizer {
    /// Compile the PII detectors
    pub fn new() -> Self {
        Self {
            email: Regex::new(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b")
                .expect("static regex"),
            phone: Regex::new(r"\b\d{3}[-.]?\d{3}[-.]?\d{4}\b").expect("static regex"),
            ssn: Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").expect("static regex"),
            credit_card: Regex::new(r"\b\d{4}[-\s]?\d{4}[-\s]?\d{4}[-\s]?\d{4}\b")
                .expect("static regex"),
        }
    }

    fn rewrite(method: AnonymizeMethod, value: &str) -> String {
        match method {
            AnonymizeMethod::Mask => mask(value),
            AnonymizeMethod::Tokenize => {
                let mut hasher = Sha256::new();
                hasher.update(value.as_bytes());
                let digest = format!("{:x}", hasher.finalize());
                format!("tok_{}", &digest[..12])
            }
            AnonymizeMethod::Hash => {
                let mut hasher = Sha256::new();
                hasher.update(value.as_bytes());
                format!("{:x}", hasher.finalize())
            }
        }
    }

    /// Rewrite named fields wherever they occur in the tree
    fn apply_fields(&self, value: &mut Value, fields: &[String], method: AnonymizeMethod) {
        match value {
            Value::Object(map) => {
                for (key, entry) in map.iter_mut() {
                    if fields.iter().any(|f| f.eq_ignore_ascii_case(key)) {
                        let rendered = match entry {
                            Value::String(s) => s.clone(),
                            ref other => other.to_string(),
                        };
                        *entry = Value::String(Self::rewrite(method, &rendered));
                    } else {
                        self.apply_fields(entry, fields, method);
                    }
                }
            }
            Value::Array(items) => {
                for item in items {
                    self.apply_fields(item, fields, method);
                }
            }
            _ => {}
        }
    }

    /// Rewrite detected PII substrings inside every string in the tree
    fn apply_detected(&self, value: &mut Value, method: AnonymizeMethod) {
        match value {
            Value::String(s) => {
                let mut text = s.clone();
                for regex in [&self.email, &self.phone, &self.ssn, &self.credit_card] {
                    text = regex
                        .replace_all(&text, |caps: &regex::Captures<'_>| {
                            Self::rewrite(method, &caps[0])
                        })
                        .into_owned();
                }
                *s = text;
            }
            Value::Object(map) => {
                for entry in map.values_mut() {
                    self.apply_detected(entry, method);
                }
            }
            Value::Array(items) => {
                for item in items {
                    self.apply_detected(item, method);
                }
            }
            _ => {}
        }
    }
}

impl Default for Anonymizer {
    fn default() -> Self {
        Self::new()
    }
}

/// Keep the first and last character, star the middle
fn mask(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() <= 2 {
        return "*".repeat(chars.len().max(1));
    }
    let mut out = String::with_capacity(chars.len());
    out.push(chars[0]);
    out.extend(std::iter::repeat('*').take(chars.len() - 2));
    out.push(chars[chars.len() - 1]);
    out
}

#[async_trait]
impl ConstraintProcessor for Anonymizer {
    fn prefixes(&self) -> &[&str] {
        &["anonymize"]
    }

    async fn apply(
        &self,
        spec: &ConstraintSpec,
        mut payload: Value,
        _ctx: &DecisionContext,
    ) -> Result<Value> {
        let ConstraintSpec::Anonymize { method, fields } = spec else {
            return Err(Error::constraint("anonymizer given a foreign descriptor"));
        };

        match fields {
            Some(fields) if !fields.is_empty() => {
                self.apply_fields(&mut payload, fields, *method);
            }
            _ => self.apply_detected(&mut payload, *method),
        }
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> DecisionContext {
        DecisionContext::new("a", "tools/call", "r")
    }

    fn spec(method: AnonymizeMethod, fields: Option<Vec<&str>>) -> ConstraintSpec {
        ConstraintSpec::Anonymize {
            method,
            fields: fields.map(|f| f.into_iter().map(str::to_string).collect()),
        }
    }

    #[tokio::test]
    async fn test_mask_named_fields_preserves_others() {
        let payload = json!({"name": "X", "email": "a@b.co", "phone": "555-123-4567"});
        let result = Anonymizer::new()
            .apply(
                &spec(AnonymizeMethod::Mask, Some(vec!["email", "phone"])),
                payload,
                &ctx(),
            )
            .await
            .unwrap();

        assert_eq!(result["name"], "X");
        assert_eq!(result["email"], "a****o");
        assert_ne!(result["phone"], "555-123-4567");
        assert!(result["phone"].as_str().unwrap().contains('*'));
    }

    #[tokio::test]
    async fn test_deep_traversal() {
        let payload = json!({
            "rows": [
                {"contact": {"email": "deep@example.com"}},
                {"contact": {"email": "other@example.com"}}
            ]
        });
        let result = Anonymizer::new()
            .apply(&spec(AnonymizeMethod::Hash, Some(vec!["email"])), payload, &ctx())
            .await
            .unwrap();

        let first = result["rows"][0]["contact"]["email"].as_str().unwrap();
        assert_eq!(first.len(), 64);
        assert!(!first.contains('@'));
    }

    #[tokio::test]
    async fn test_tokenize_is_stable() {
        let a = Anonymizer::rewrite(AnonymizeMethod::Tokenize, "jane@corp.io");
        let b = Anonymizer::rewrite(AnonymizeMethod::Tokenize, "jane@corp.io");
        let c = Anonymizer::rewrite(AnonymizeMethod::Tokenize, "john@corp.io");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("tok_"));
    }

    #[tokio::test]
    async fn test_auto_detection_scans_strings() {
        let payload = json!({
            "note": "reach me at jane@corp.io or 555-867-5309",
            "count": 3
        });
        let result = Anonymizer::new()
            .apply(&spec(AnonymizeMethod::Mask, None), payload, &ctx())
            .await
            .unwrap();

        let note = result["note"].as_str().unwrap();
        assert!(!note.contains("jane@corp.io"));
        assert!(!note.contains("555-867-5309"));
        assert!(note.contains("reach me at"));
        assert_eq!(result["count"], 3);
    }

    #[tokio::test]
    async fn test_ssn_and_card_detection() {
        let payload = json!("ssn 123-45-6789 card 4111 1111 1111 1111");
        let result = Anonymizer::new()
            .apply(&spec(AnonymizeMethod::Hash, None), payload, &ctx())
            .await
            .unwrap();
        let text = result.as_str().unwrap();
        assert!(!text.contains("123-45-6789"));
        assert!(!text.contains("4111"));
    }

    #[test]
    fn test_mask_short_values() {
        assert_eq!(mask("ab"), "**");
        assert_eq!(mask("a"), "*");
        assert_eq!(mask(""), "*");
    }
}
