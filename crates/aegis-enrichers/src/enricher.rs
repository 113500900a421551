//! Enricher trait and common types

use aegis_core::{DecisionContext, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;

/// Attributes produced by one enricher, merged under its namespace
pub type AttributeBag = BTreeMap<String, Value>;

/// Trait for all context enrichers.
///
/// Enrichers are independent: they read the base context and produce an
/// attribute bag, never mutating shared state, so the registry can fan them
/// out in parallel. A failing or slow enricher costs only its own attributes.
#[async_trait]
pub trait Enricher: Send + Sync {
    /// Namespace the attributes are merged under
    fn name(&self) -> &str;

    /// Collect attributes for the request
    async fn enrich(&self, ctx: &DecisionContext) -> Result<AttributeBag>;
}
