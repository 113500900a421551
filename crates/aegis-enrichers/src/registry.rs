//! Enricher registry with parallel fan-out

use crate::enricher::Enricher;
use aegis_core::DecisionContext;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Default per-enricher deadline
pub const DEFAULT_ENRICHER_TIMEOUT: Duration = Duration::from_secs(2);

/// Registry running all configured enrichers over a context
pub struct EnricherRegistry {
    enrichers: Vec<Arc<dyn Enricher>>,
    timeout: Duration,
}

impl EnricherRegistry {
    /// Create an empty registry with the default per-enricher deadline
    pub fn new() -> Self {
        Self {
            enrichers: Vec::new(),
            timeout: DEFAULT_ENRICHER_TIMEOUT,
        }
    }

    /// Override the per-enricher deadline
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Register an enricher
    pub fn register(&mut self, enricher: Arc<dyn Enricher>) {
        self.enrichers.push(enricher);
    }

    /// Number of registered enrichers
    pub fn count(&self) -> usize {
        self.enrichers.len()
    }

    /// Run every enricher in parallel and merge their bags into the context.
    ///
    /// Failures and deadline overruns are logged and swallowed: the decision
    /// proceeds with whatever attributes arrived in time.
    pub async fn enrich(&self, ctx: &mut DecisionContext) {
        let results = {
            let frozen = &*ctx;
            let futures = self.enrichers.iter().map(|enricher| {
                let enricher = Arc::clone(enricher);
                async move {
                    let name = enricher.name().to_string();
                    let outcome =
                        tokio::time::timeout(self.timeout, enricher.enrich(frozen)).await;
                    (name, outcome)
                }
            });
            futures::future::join_all(futures).await
        };

        for (name, outcome) in results {
            match outcome {
                Ok(Ok(bag)) => {
                    debug!(enricher = %name, attributes = bag.len(), "context enriched");
                    ctx.merge_attributes(&name, bag);
                }
                Ok(Err(e)) => {
                    warn!(enricher = %name, "enricher failed, attributes skipped: {}", e);
                }
                Err(_) => {
                    warn!(enricher = %name, timeout_ms = self.timeout.as_millis() as u64,
                        "enricher exceeded deadline, attributes skipped");
                }
            }
        }
    }
}

impl Default for EnricherRegistry {
    fn default() -> Self {
        Self::new()
    }
}
