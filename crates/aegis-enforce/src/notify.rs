//! Notification obligation executor

use crate::obligation::{ExecutionClass, ObligationExchange, ObligationExecutor};
use aegis_core::{Error, ObligationSpec, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Delivery channel for notifications.
///
/// The core ships only the no-op channel; deployments register real ones
/// (chat, email, webhook) under their channel names.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    /// Channel name referenced by obligation descriptors
    fn name(&self) -> &str;

    /// Deliver a notification
    async fn send(&self, recipients: &[String], subject: &str, body: &str) -> Result<()>;
}

/// Channel that records the notification in the log and nothing else
pub struct NoopChannel {
    name: String,
}

impl NoopChannel {
    /// Create with a channel name
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl NotificationChannel for NoopChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, recipients: &[String], subject: &str, _body: &str) -> Result<()> {
        info!(channel = %self.name, recipients = recipients.len(), subject = %subject,
            "notification (noop)");
        Ok(())
    }
}

/// Async executor dispatching `notify` obligations to channels
pub struct NotifyExecutor {
    channels: HashMap<String, Arc<dyn NotificationChannel>>,
}

impl NotifyExecutor {
    /// Create an executor with no channels
    pub fn new() -> Self {
        Self {
            channels: HashMap::new(),
        }
    }

    /// Register a channel
    pub fn with_channel(mut self, channel: Arc<dyn NotificationChannel>) -> Self {
        self.channels.insert(channel.name().to_string(), channel);
        self
    }
}

impl Default for NotifyExecutor {
    fn default() -> Self {
        Self::new().with_channel(Arc::new(NoopChannel::new("log")))
    }
}

#[async_trait]
impl ObligationExecutor for NotifyExecutor {
    fn prefixes(&self) -> &[&str] {
        &["notify"]
    }

    fn class(&self) -> ExecutionClass {
        ExecutionClass::Async
    }

    async fn execute(&self, spec: &ObligationSpec, exchange: &ObligationExchange) -> Result<()> {
        let ObligationSpec::Notify {
            channel,
            recipients,
            on_decision,
        } = spec
        else {
            return Err(Error::Obligation(
                "notify executor given a foreign descriptor".to_string(),
            ));
        };

        if let Some(wanted) = on_decision {
            let actual = exchange.decision.outcome.to_string();
            if !wanted.eq_ignore_ascii_case(&actual) {
                return Ok(());
            }
        }

        let target = self
            .channels
            .get(channel)
            .ok_or_else(|| Error::Obligation(format!("unknown channel '{}'", channel)))?;

        let subject = format!(
            "policy {} for {} on {}",
            exchange.decision.outcome, exchange.ctx.agent_id, exchange.ctx.resource
        );
        target
            .send(recipients, &subject, &exchange.decision.reason)
            .await
    }
}
