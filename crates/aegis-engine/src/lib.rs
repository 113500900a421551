//! Aegis hybrid decision engine
//!
//! The decision point of the proxy: structured rule evaluation backed by an
//! LLM judge for natural-language policies, conflict resolution across
//! policies, and a two-tier decision cache with single-flight computation.

pub mod cache;
pub mod conflict;
pub mod engine;
pub mod judge;
pub mod llm;

pub use cache::{CacheConfig, DecisionCache, KvTier, RedisTier};
pub use conflict::ConflictStrategy;
pub use engine::{spawn_invalidation, DecisionEngine, EngineConfig};
pub use judge::{JudgeOutcome, JudgeVerdict, PolicyJudge};
pub use llm::{LlmConfig, LlmJudge};
