//! Notification hub
//!
//! Re-broadcasts upstream notifications to every connected client except the
//! originating upstream itself, so a notification can never loop back to its
//! source. Fan-out is best-effort: a slow or closed client just misses it.

use aegis_core::rpc;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::debug;

struct Subscriber {
    name: String,
    sender: mpsc::UnboundedSender<rpc::Request>,
}

/// Fan-out hub for server-initiated notifications
pub struct NotificationHub {
    subscribers: RwLock<HashMap<u64, Subscriber>>,
    next_id: AtomicU64,
}

impl NotificationHub {
    /// Create an empty hub
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Subscribe a named party; the name is compared against the broadcast
    /// origin for loop prevention
    pub fn subscribe(&self, name: impl Into<String>) -> (u64, mpsc::UnboundedReceiver<rpc::Request>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.write().insert(
            id,
            Subscriber {
                name: name.into(),
                sender: tx,
            },
        );
        (id, rx)
    }

    /// Remove a subscriber
    pub fn unsubscribe(&self, id: u64) {
        self.subscribers.write().remove(&id);
    }

    /// Connected subscriber count
    pub fn len(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Whether nobody is listening
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Broadcast a notification from `origin` to everyone else.
    ///
    /// Closed subscribers are pruned as they are discovered.
    pub fn broadcast(&self, origin: &str, message: &rpc::Request) {
        let mut dead = Vec::new();
        {
            let subscribers = self.subscribers.read();
            for (id, subscriber) in subscribers.iter() {
                if subscriber.name == origin {
                    continue;
                }
                if subscriber.sender.send(message.clone()).is_err() {
                    dead.push(*id);
                }
            }
        }
        if !dead.is_empty() {
            let mut subscribers = self.subscribers.write();
            for id in dead {
                subscribers.remove(&id);
            }
        }
        debug!(origin = %origin, method = %message.method, "notification broadcast");
    }
}

impl Default for NotificationHub {
    fn default() -> Self {
        Self::new()
    }
}
