//! Sliding-window rate limiting
//!
//! Admission keeps the timestamps of recent admissions per scope key; each
//! check prunes entries older than the window and rejects once the limit is
//! reached. Fixed windows are deliberately not offered: they admit twice the
//! limit across a window edge.

use crate::constraint::ConstraintProcessor;
use aegis_core::{ConstraintSpec, DecisionContext, Error, RateLimitScope, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// Constraint processor for `rate-limit` descriptors
pub struct RateLimiter {
    windows: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    /// Create an empty limiter
    pub fn new() -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Admission check at an explicit instant (drives the tests)
    fn check_at(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
        now: Instant,
    ) -> std::result::Result<(), u64> {
        let mut windows = self.windows.lock();
        let entries = windows.entry(key.to_string()).or_default();

        while let Some(front) = entries.front() {
            if now.duration_since(*front) >= window {
                entries.pop_front();
            } else {
                break;
            }
        }

        if entries.len() >= limit as usize {
            // The oldest admission leaving the window frees the next slot.
            let retry_after = entries
                .front()
                .map(|front| window.saturating_sub(now.duration_since(*front)))
                .unwrap_or_default();
            return Err(retry_after.as_millis() as u64);
        }

        entries.push_back(now);
        Ok(())
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConstraintProcessor for RateLimiter {
    fn prefixes(&self) -> &[&str] {
        &["rate-limit"]
    }

    async fn apply(
        &self,
        spec: &ConstraintSpec,
        payload: Value,
        ctx: &DecisionContext,
    ) -> Result<Value> {
        let ConstraintSpec::RateLimit {
            limit,
            window_ms,
            scope,
        } = spec
        else {
            return Err(Error::constraint("rate limiter given a foreign descriptor"));
        };

        let key = match scope {
            RateLimitScope::PerAgent => {
                format!("{}:{}:{}", limit, window_ms, ctx.agent_id)
            }
            RateLimitScope::Global => format!("{}:{}:global", limit, window_ms),
        };

        self.check_at(
            &key,
            *limit,
            Duration::from_millis(*window_ms),
            Instant::now(),
        )
        .map_err(|retry_after_ms| Error::RateLimited { retry_after_ms })?;

        Ok(payload)
    }
}
