//! Aegis context enrichers
//!
//! The information point of the proxy: a registry of independent enrichers
//! fanned out in parallel over each request's base context. Every enricher
//! owns one namespace of attributes; failures and deadline overruns cost only
//! that namespace, never the decision.

pub mod agent;
pub mod enricher;
pub mod registry;
pub mod resource;
pub mod security;
pub mod time;

pub use agent::{AgentEnricher, AgentProfile};
pub use enricher::{AttributeBag, Enricher};
pub use registry::{EnricherRegistry, DEFAULT_ENRICHER_TIMEOUT};
pub use resource::{ResourceEnricher, ResourceRule};
pub use security::{FailureTracker, SecurityEnricher};
pub use time::{BusinessHours, FixedHolidays, HolidayCalendar, NoHolidays, TimeEnricher};

use std::collections::HashMap;
use std::sync::Arc;

/// Build a registry with the four standard enrichers
pub fn standard_registry(
    hours: BusinessHours,
    directory: HashMap<String, AgentProfile>,
    resource_rules: Vec<ResourceRule>,
    geo_table: Vec<(String, String)>,
    vpn_prefixes: Vec<String>,
    failures: FailureTracker,
) -> EnricherRegistry {
    let mut registry = EnricherRegistry::new();
    registry.register(Arc::new(TimeEnricher::new(hours)));
    registry.register(Arc::new(AgentEnricher::new(directory)));
    registry.register(Arc::new(ResourceEnricher::new(resource_rules)));
    registry.register(Arc::new(SecurityEnricher::new(
        geo_table,
        vpn_prefixes,
        failures,
    )));
    registry
}
