//! Deferred data-lifecycle obligations

use crate::obligation::{ExecutionClass, ObligationExchange, ObligationExecutor};
use aegis_core::{Error, LifecycleAction, ObligationSpec, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Hook performing the lifecycle action when its timer fires.
///
/// The core ships a log-only hook; deployments wire real deletion/archival
/// against their data stores.
#[async_trait]
pub trait DataHook: Send + Sync {
    /// Remove the resource's data
    async fn delete(&self, resource: &str) -> Result<()>;

    /// Move the resource's data to cold storage
    async fn archive(&self, resource: &str) -> Result<()>;

    /// Pin the resource's data against deletion
    async fn retain(&self, resource: &str) -> Result<()>;
}

/// Hook that only records what would have happened
pub struct LogOnlyHook;

#[async_trait]
impl DataHook for LogOnlyHook {
    async fn delete(&self, resource: &str) -> Result<()> {
        info!(resource = %resource, "lifecycle delete (log only)");
        Ok(())
    }

    async fn archive(&self, resource: &str) -> Result<()> {
        info!(resource = %resource, "lifecycle archive (log only)");
        Ok(())
    }

    async fn retain(&self, resource: &str) -> Result<()> {
        info!(resource = %resource, "lifecycle retain (log only)");
        Ok(())
    }
}

/// Async executor scheduling lifecycle timers
pub struct LifecycleExecutor {
    hook: Arc<dyn DataHook>,
    timers: Mutex<Vec<JoinHandle<()>>>,
}

impl LifecycleExecutor {
    /// Create over a data hook
    pub fn new(hook: Arc<dyn DataHook>) -> Self {
        Self {
            hook,
            timers: Mutex::new(Vec::new()),
        }
    }

    /// Timers scheduled and not yet finished
    pub fn pending(&self) -> usize {
        let mut timers = self.timers.lock();
        timers.retain(|handle| !handle.is_finished());
        timers.len()
    }
}

#[async_trait]
impl ObligationExecutor for LifecycleExecutor {
    fn prefixes(&self) -> &[&str] {
        &["lifecycle"]
    }

    fn class(&self) -> ExecutionClass {
        ExecutionClass::Async
    }

    async fn execute(&self, spec: &ObligationSpec, exchange: &ObligationExchange) -> Result<()> {
        let ObligationSpec::Lifecycle { action, after_ms } = spec else {
            return Err(Error::Obligation(
                "lifecycle executor given a foreign descriptor".to_string(),
            ));
        };

        let hook = Arc::clone(&self.hook);
        let action = *action;
        let delay = Duration::from_millis(*after_ms);
        let resource = exchange.ctx.resource.clone();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let result = match action {
                LifecycleAction::Delete => hook.delete(&resource).await,
                LifecycleAction::Archive => hook.archive(&resource).await,
                LifecycleAction::Retain => hook.retain(&resource).await,
            };
            if let Err(e) = result {
                error!(resource = %resource, action = ?action, "lifecycle action failed: {}", e);
            }
        });
        self.timers.lock().push(handle);
        Ok(())
    }
}
