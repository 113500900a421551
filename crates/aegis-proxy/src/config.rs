//! Proxy configuration
//!
//! Loaded from a YAML file, overridden by the environment variables the
//! deployment guide documents, then by CLI flags.

use aegis_core::{Error, Result};
use aegis_engine::ConflictStrategy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Top-level proxy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AegisConfig {
    /// HTTP listen port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Bearer token required on authenticated endpoints; unset disables auth
    #[serde(default)]
    pub auth_token: Option<String>,

    /// Decision deadline in milliseconds
    #[serde(default = "default_decision_timeout")]
    pub decision_timeout_ms: u64,

    /// Total per-request deadline in milliseconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,

    /// Confidence gate for LLM verdicts
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,

    /// Conflict resolution strategy
    #[serde(default)]
    pub conflict_strategy: ConflictStrategy,

    /// Default per-agent admissions per minute
    #[serde(default = "default_rate_limit")]
    pub rate_limit_default: u32,

    /// Filesystem policy store root
    #[serde(default = "default_policy_store_path")]
    pub policy_store_path: PathBuf,

    /// Audit log directory
    #[serde(default = "default_audit_path")]
    pub audit_path: PathBuf,

    /// JSON file listing the upstream servers
    #[serde(default)]
    pub upstream_config: Option<PathBuf>,

    /// Decision cache settings
    #[serde(default)]
    pub cache: CacheSettings,

    /// LLM judge settings
    #[serde(default)]
    pub llm: LlmSettings,

    /// Enricher settings
    #[serde(default)]
    pub enrichers: EnricherSettings,

    /// Obligation worker pool size
    #[serde(default = "default_obligation_workers")]
    pub obligation_workers: usize,
}

impl Default for AegisConfig {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("empty config deserializes")
    }
}

/// Decision cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Whether decisions are cached at all
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// L1 entry bound
    #[serde(default = "default_l1_size")]
    pub l1_size: usize,

    /// PERMIT TTL in milliseconds
    #[serde(default = "default_permit_ttl")]
    pub permit_ttl_ms: u64,

    /// DENY TTL in milliseconds
    #[serde(default = "default_deny_ttl")]
    pub deny_ttl_ms: u64,

    /// Redis URL for the shared L2 tier
    #[serde(default)]
    pub redis_url: Option<String>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            l1_size: default_l1_size(),
            permit_ttl_ms: default_permit_ttl(),
            deny_ttl_ms: default_deny_ttl(),
            redis_url: None,
        }
    }
}

/// LLM judge settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmSettings {
    /// Provider label (openai-compatible endpoints only)
    #[serde(default)]
    pub provider: Option<String>,

    /// Base URL override
    #[serde(default)]
    pub base_url: Option<String>,

    /// Model identifier
    #[serde(default)]
    pub model: Option<String>,

    /// API key; unset disables the judge
    #[serde(default)]
    pub api_key: Option<String>,
}

/// Enricher settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnricherSettings {
    /// Business-hours window
    #[serde(default)]
    pub business_hours: aegis_enrichers::BusinessHours,

    /// Agent directory, keyed by agent id
    #[serde(default)]
    pub agents: HashMap<String, aegis_enrichers::AgentProfile>,

    /// Resource classification table
    #[serde(default)]
    pub resources: Vec<aegis_enrichers::ResourceRule>,

    /// IP prefix → location labels
    #[serde(default)]
    pub geo: Vec<(String, String)>,

    /// IP prefixes treated as VPN egress
    #[serde(default)]
    pub vpn_prefixes: Vec<String>,
}

/// One upstream MCP server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamSpec {
    /// Unique name; tools are exposed as `<name>__<tool>`
    pub name: String,

    /// Executable for a stdio upstream
    #[serde(default)]
    pub command: Option<String>,

    /// Arguments for a stdio upstream
    #[serde(default)]
    pub args: Vec<String>,

    /// Extra environment for the child process
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Working directory for the child process
    #[serde(default)]
    pub cwd: Option<PathBuf>,

    /// Endpoint for an HTTP upstream
    #[serde(default)]
    pub url: Option<String>,
}

/// Wrapper for the upstream config file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpstreamFile {
    /// Configured upstreams
    #[serde(default)]
    pub upstreams: Vec<UpstreamSpec>,
}

impl AegisConfig {
    /// Load from file (when present), then the environment
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: Self = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            serde_yaml::from_str(&content)
                .map_err(|e| Error::config(format!("bad config file: {}", e)))?
        } else {
            Self::default()
        };
        config.apply_env();
        Ok(config)
    }

    /// Apply the documented environment overrides
    pub fn apply_env(&mut self) {
        if let Some(v) = env_str("LLM_PROVIDER") {
            self.llm.provider = Some(v);
        }
        if let Some(v) = env_str("LLM_MODEL") {
            self.llm.model = Some(v);
        }
        if let Some(v) = env_str("LLM_API_KEY") {
            self.llm.api_key = Some(v);
        }
        if let Some(v) = env_parse("DECISION_TIMEOUT_MS") {
            self.decision_timeout_ms = v;
        }
        if let Some(v) = env_parse("REQUEST_TIMEOUT_MS") {
            self.request_timeout_ms = v;
        }
        if let Some(v) = env_parse("CACHE_ENABLED") {
            self.cache.enabled = v;
        }
        if let Some(v) = env_parse("CACHE_L1_SIZE") {
            self.cache.l1_size = v;
        }
        if let Some(v) = env_parse("CACHE_PERMIT_TTL_MS") {
            self.cache.permit_ttl_ms = v;
        }
        if let Some(v) = env_parse("CACHE_DENY_TTL_MS") {
            self.cache.deny_ttl_ms = v;
        }
        if let Some(v) = env_str("CONFLICT_STRATEGY") {
            if let Ok(strategy) = v.parse() {
                self.conflict_strategy = strategy;
            }
        }
        if let Some(v) = env_parse("CONFIDENCE_THRESHOLD") {
            self.confidence_threshold = v;
        }
        if let Some(v) = env_parse("RATE_LIMIT_DEFAULT") {
            self.rate_limit_default = v;
        }
        if let Some(v) = env_parse("PORT") {
            self.port = v;
        }
        if let Some(v) = env_str("POLICY_STORE_PATH") {
            self.policy_store_path = PathBuf::from(v);
        }
        if let Some(v) = env_str("UPSTREAM_CONFIG") {
            self.upstream_config = Some(PathBuf::from(v));
        }
        if let Some(v) = env_str("AUTH_TOKEN") {
            self.auth_token = Some(v);
        }
    }

    /// Load the upstream list, empty when no file is configured
    pub fn load_upstreams(&self) -> Result<Vec<UpstreamSpec>> {
        let Some(path) = &self.upstream_config else {
            return Ok(Vec::new());
        };
        let content = std::fs::read_to_string(path)?;
        let file: UpstreamFile = serde_json::from_str(&content)
            .map_err(|e| Error::config(format!("bad upstream config: {}", e)))?;
        Ok(file.upstreams)
    }
}

fn env_str(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env_str(name).and_then(|v| v.parse().ok())
}

fn default_port() -> u16 {
    8484
}

fn default_decision_timeout() -> u64 {
    5_000
}

fn default_request_timeout() -> u64 {
    30_000
}

fn default_confidence_threshold() -> f64 {
    0.7
}

fn default_rate_limit() -> u32 {
    1_000
}

fn default_policy_store_path() -> PathBuf {
    PathBuf::from("./policies")
}

fn default_audit_path() -> PathBuf {
    PathBuf::from("./audit")
}

fn default_obligation_workers() -> usize {
    4
}

fn default_true() -> bool {
    true
}

fn default_l1_size() -> usize {
    10_000
}

fn default_permit_ttl() -> u64 {
    300_000
}

fn default_deny_ttl() -> u64 {
    60_000
}
