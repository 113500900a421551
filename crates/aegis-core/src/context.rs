//! Decision context built by the proxy and enriched before evaluation

use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Attributes describing the requesting agent
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentAttributes {
    /// Agent category (e.g. research, operations, external)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_type: Option<String>,

    /// Role within its organization
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,

    /// Trust score in [0, 1] derived from history
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trust_score: Option<f64>,

    /// Clearance level for classified resources
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clearance_level: Option<i64>,
}

/// Attributes describing the requested resource
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceAttributes {
    /// Data type derived from the resource URI
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_type: Option<String>,

    /// Sensitivity classification (public|internal|confidential|restricted)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub classification: Option<String>,

    /// Owning principal
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
}

/// Everything the decision engine knows about one request.
///
/// Constructed at interception from transport-level identity and the JSON-RPC
/// envelope, enriched in parallel by the information point, then frozen and
/// passed by value to the decision engine and the audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionContext {
    /// Correlation id shared by the decision, response metadata, and audit entry
    pub request_id: String,

    /// Requesting agent identifier
    pub agent_id: String,

    /// Action being attempted (the MCP method)
    pub action: String,

    /// Resource URI or aggregated tool name
    pub resource: String,

    /// Interception timestamp
    pub timestamp: DateTime<Utc>,

    /// Tool name for `tools/call` requests
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,

    /// Declared purpose, if the client supplied one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub purpose: Option<String>,

    /// Coarse client location
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,

    /// Transport session id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,

    /// Client IP as seen at the HTTP edge
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_ip: Option<String>,

    /// Emergency override flag
    #[serde(default)]
    pub emergency: bool,

    /// Delegation chain, outermost principal first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub delegation_chain: Vec<String>,

    /// Enriched agent attributes
    #[serde(default)]
    pub agent: AgentAttributes,

    /// Enriched resource attributes
    #[serde(default)]
    pub resource_attrs: ResourceAttributes,

    /// Composite risk score in [0, 1]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub risk_score: Option<f64>,

    /// Free-form enrichment attributes, keyed `<enricher>.<attribute>`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, Value>,
}

impl DecisionContext {
    /// Create a base context from the intercepted request
    pub fn new(
        agent_id: impl Into<String>,
        action: impl Into<String>,
        resource: impl Into<String>,
    ) -> Self {
        Self {
            request_id: format!("req_{}", uuid::Uuid::new_v4()),
            agent_id: agent_id.into(),
            action: action.into(),
            resource: resource.into(),
            timestamp: Utc::now(),
            tool: None,
            purpose: None,
            location: None,
            session_id: None,
            client_ip: None,
            emergency: false,
            delegation_chain: Vec::new(),
            agent: AgentAttributes::default(),
            resource_attrs: ResourceAttributes::default(),
            risk_score: None,
            environment: BTreeMap::new(),
        }
    }

    /// Set the tool name for `tools/call` requests
    pub fn with_tool(mut self, tool: impl Into<String>) -> Self {
        self.tool = Some(tool.into());
        self
    }

    /// Set the transport session id
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Set the client IP
    pub fn with_client_ip(mut self, ip: impl Into<String>) -> Self {
        self.client_ip = Some(ip.into());
        self
    }

    /// Set a fixed timestamp (tests and replay)
    pub fn with_timestamp(mut self, ts: DateTime<Utc>) -> Self {
        self.timestamp = ts;
        self
    }

    /// Mark the request as an emergency override
    pub fn with_emergency(mut self, emergency: bool) -> Self {
        self.emergency = emergency;
        self
    }

    /// Merge an enricher's attribute bag under its namespace.
    ///
    /// Recognized attributes are hoisted into the typed fields so the rule
    /// evaluator resolves them without knowing which enricher produced them.
    pub fn merge_attributes(&mut self, namespace: &str, bag: BTreeMap<String, Value>) {
        for (key, value) in bag {
            match (namespace, key.as_str()) {
                ("agent", "agentType") => {
                    self.agent.agent_type = value.as_str().map(str::to_string);
                }
                ("agent", "trustScore") => {
                    self.agent.trust_score = value.as_f64();
                }
                ("agent", "clearanceLevel") => {
                    self.agent.clearance_level = value.as_i64();
                }
                ("resource", "dataType") => {
                    self.resource_attrs.data_type = value.as_str().map(str::to_string);
                }
                ("resource", "sensitivityLevel") => {
                    self.resource_attrs.classification = value.as_str().map(str::to_string);
                }
                ("resource", "owner") => {
                    self.resource_attrs.owner = value.as_str().map(str::to_string);
                }
                ("security", "riskScore") => {
                    self.risk_score = value.as_f64();
                }
                _ => {}
            }
            self.environment.insert(format!("{}.{}", namespace, key), value);
        }
    }

    /// Resolve an operand name against the context.
    ///
    /// Standard operands resolve from typed fields; unknown names fall back to
    /// the environment map. Returns `None` for operands the context cannot
    /// supply, which every comparison except `neq` treats as non-satisfied.
    pub fn attribute(&self, name: &str) -> Option<Value> {
        match name {
            "agentId" => Some(Value::String(self.agent_id.clone())),
            "agentType" => self.agent.agent_type.clone().map(Value::String),
            "trustScore" => self.agent.trust_score.and_then(number),
            "clearanceLevel" => self.agent.clearance_level.map(Value::from),
            "resourceType" => self.resource_attrs.data_type.clone().map(Value::String),
            "resourceClassification" => {
                self.resource_attrs.classification.clone().map(Value::String)
            }
            "emergencyFlag" => Some(Value::Bool(self.emergency)),
            "delegationDepth" => Some(Value::from(self.delegation_chain.len() as i64)),
            "mcpMethod" => Some(Value::String(self.action.clone())),
            "mcpTool" => self.tool.clone().map(Value::String),
            "dateTime" => Some(Value::String(self.timestamp.to_rfc3339())),
            "timeOfDay" => Some(Value::String(
                self.timestamp.format("%H:%M:%S").to_string(),
            )),
            "dayOfWeek" => Some(Value::String(
                weekday_name(self.timestamp.weekday()).to_string(),
            )),
            "hour" => Some(Value::from(self.timestamp.hour() as i64)),
            "riskScore" => self.risk_score.and_then(number),
            _ => self.environment.get(name).cloned(),
        }
    }
}

fn number(v: f64) -> Option<Value> {
    serde_json::Number::from_f64(v).map(Value::Number)
}

/// Full lowercase weekday name used by the `dayOfWeek` operand
pub fn weekday_name(weekday: chrono::Weekday) -> &'static str {
    match weekday {
        chrono::Weekday::Mon => "monday",
        chrono::Weekday::Tue => "tuesday",
        chrono::Weekday::Wed => "wednesday",
        chrono::Weekday::Thu => "thursday",
        chrono::Weekday::Fri => "friday",
        chrono::Weekday::Sat => "saturday",
        chrono::Weekday::Sun => "sunday",
    }
}
