//! SubscriptionRegistry: push fan-out to external observers on every publish.
//!
//! Handlers are synchronous callbacks (the transport layer bridges them onto
//! websocket streams or whatever it owns). Handler errors are logged and
//! swallowed; they never fail the publish. Matching handlers are cloned out
//! of the registry before being invoked, so a handler can subscribe or
//! unsubscribe without deadlocking.

use std::sync::Arc;
use dashmap::DashMap;
use tracing::warn;
use uuid::Uuid;

use crate::broker::message::Message;

pub type SubscriptionHandler = Arc<dyn Fn(&Message) -> Result<(), String> + Send + Sync>;

struct Subscription {
    domain: String,
    queue: String,
    handler: SubscriptionHandler,
}

pub struct SubscriptionRegistry {
    subscriptions: DashMap<String, Subscription>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self { subscriptions: DashMap::new() }
    }

    pub fn subscribe(
        &self,
        domain: &str,
        queue: &str,
        handler: SubscriptionHandler,
    ) -> String {
        let id = Uuid::new_v4().to_string();
        self.subscriptions.insert(
            id.clone(),
            Subscription {
                domain: domain.to_string(),
                queue: queue.to_string(),
                handler,
            },
        );
        id
    }

    /// Returns false when the id was unknown (already unsubscribed).
    pub fn unsubscribe(&self, subscription_id: &str) -> bool {
        self.subscriptions.remove(subscription_id).is_some()
    }

    pub fn count(&self, domain: &str, queue: &str) -> usize {
        self.subscriptions
            .iter()
            .filter(|e| e.value().domain == domain && e.value().queue == queue)
            .count()
    }

    pub fn notify(&self, domain: &str, queue: &str, msg: &Message) {
        let handlers: Vec<(String, SubscriptionHandler)> = self
            .subscriptions
            .iter()
            .filter(|e| e.value().domain == domain && e.value().queue == queue)
            .map(|e| (e.key().clone(), e.value().handler.clone()))
            .collect();
        for (id, handler) in handlers {
            if let Err(e) = handler(msg) {
                warn!(
                    "[Subscriptions] handler {} failed on '{}/{}': {}",
                    id, domain, queue, e
                );
            }
        }
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ==========================================
// TESTS
// ==========================================
