//! Resource attributes derived from the URI and a classification table

use crate::enricher::{AttributeBag, Enricher};
use aegis_core::{DecisionContext, Result};
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Static classification entry matched by resource prefix
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceRule {
    /// Resource prefix (e.g. `db__` or `file:///etc/`)
    pub prefix: String,

    /// Sensitivity assigned to matching resources
    pub sensitivity: String,

    /// Owning principal
    #[serde(default)]
    pub owner: Option<String>,

    /// Labels attached to matching resources
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Enricher classifying the requested resource
pub struct ResourceEnricher {
    rules: Vec<ResourceRule>,
    pii_regex: Regex,
    pii_keywords: Vec<&'static str>,
}

impl ResourceEnricher {
    /// Create with a classification table
    pub fn new(rules: Vec<ResourceRule>) -> Self {
        Self {
            rules,
            // email-shaped or ssn-shaped fragments inside the URI itself
            pii_regex: Regex::new(
                r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}|\b\d{3}-\d{2}-\d{4}\b",
            )
            .expect("static regex"),
            pii_keywords: vec!["customer", "employee", "salary", "medical", "personal", "ssn"],
        }
    }

    fn data_type(resource: &str) -> &'static str {
        if let Some(ext) = resource.rsplit('.').next().filter(|e| e.len() <= 5) {
            match ext {
                "csv" | "parquet" => return "tabular",
                "json" | "yaml" | "yml" | "toml" => return "structured",
                "txt" | "md" | "log" => return "text",
                "db" | "sqlite" => return "database",
                _ => {}
            }
        }
        if resource.starts_with("db__") || resource.contains("sql") {
            "database"
        } else if resource.starts_with("http") {
            "remote"
        } else {
            "opaque"
        }
    }
}

#[async_trait]
impl Enricher for ResourceEnricher {
    fn name(&self) -> &str {
        "resource"
    }

    async fn enrich(&self, ctx: &DecisionContext) -> Result<AttributeBag> {
        let resource = ctx.resource.as_str();
        let mut bag = AttributeBag::new();

        bag.insert("dataType".to_string(), json!(Self::data_type(resource)));

        let matched = self
            .rules
            .iter()
            .find(|rule| resource.starts_with(&rule.prefix));
        match matched {
            Some(rule) => {
                bag.insert("sensitivityLevel".to_string(), json!(rule.sensitivity));
                if let Some(owner) = &rule.owner {
                    bag.insert("owner".to_string(), json!(owner));
                }
                if !rule.tags.is_empty() {
                    bag.insert("tags".to_string(), json!(rule.tags));
                }
            }
            None => {
                bag.insert("sensitivityLevel".to_string(), json!("internal"));
            }
        }

        let lowered = resource.to_lowercase();
        let is_pii = self.pii_regex.is_match(resource)
            || self.pii_keywords.iter().any(|kw| lowered.contains(kw));
        bag.insert("isPII".to_string(), json!(is_pii));

        Ok(bag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enricher() -> ResourceEnricher {
        ResourceEnricher::new(vec![
            ResourceRule {
                prefix: "db__customers".to_string(),
                sensitivity: "restricted".to_string(),
                owner: Some("data-platform".to_string()),
                tags: vec!["pii".to_string()],
            },
            ResourceRule {
                prefix: "docs__".to_string(),
                sensitivity: "public".to_string(),
                owner: None,
                tags: vec![],
            },
        ])
    }

    #[tokio::test]
    async fn test_classified_resource() {
        let ctx = DecisionContext::new("a", "tools/call", "db__customers_query");
        let bag = enricher().enrich(&ctx).await.unwrap();

        assert_eq!(bag["sensitivityLevel"], json!("restricted"));
        assert_eq!(bag["owner"], json!("data-platform"));
        assert_eq!(bag["dataType"], json!("database"));
    }

    #[tokio::test]
    async fn test_unclassified_defaults_to_internal() {
        let ctx = DecisionContext::new("a", "resources/read", "file:///var/reports/q3.txt");
        let bag = enricher().enrich(&ctx).await.unwrap();

        assert_eq!(bag["sensitivityLevel"], json!("internal"));
        assert_eq!(bag["dataType"], json!("text"));
    }

    #[tokio::test]
    async fn test_pii_keyword_detection() {
        let ctx = DecisionContext::new("a", "resources/read", "file:///exports/employee_roster.csv");
        let bag = enricher().enrich(&ctx).await.unwrap();
        assert_eq!(bag["isPII"], json!(true));
    }

    #[tokio::test]
    async fn test_non_pii_resource() {
        let ctx = DecisionContext::new("a", "resources/read", "docs__readme");
        let bag = enricher().enrich(&ctx).await.unwrap();
        assert_eq!(bag["isPII"], json!(false));
        assert_eq!(bag["sensitivityLevel"], json!("public"));
    }
}
