//! Connected subscribers and their callback clients.

use crate::registry::SubscriberId;
use crate::rpc::attendance_service::SubscriberCallbackClient;
use std::collections::HashMap;

/// Subscriber tracking: stores callback clients for push notifications.
pub struct SubscriberRegistry {
    subscribers: HashMap<SubscriberId, SubscriberCallbackClient>,
    /// Next subscriber ID to assign. IDs are never reused.
    next_id: SubscriberId,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self {
            subscribers: HashMap::new(),
            next_id: 1,
        }
    }

    /// Add a new subscriber with their callback client. Returns the assigned ID.
    pub fn add(&mut self, client: SubscriberCallbackClient) -> SubscriberId {
        let id = self.next_id;
        self.next_id += 1;
        self.subscribers.insert(id, client);
        id
    }

    pub fn remove(&mut self, id: &SubscriberId) -> bool {
        self.subscribers.remove(id).is_some()
    }

    pub fn get(&self, id: &SubscriberId) -> Option<SubscriberCallbackClient> {
        self.subscribers.get(id).cloned()
    }

    pub fn count(&self) -> usize {
        self.subscribers.len()
    }

    /// Tell every subscriber the daemon is stopping.
    /// Returns IDs of subscribers that could not be reached.
    pub async fn broadcast_stopping(&self) -> Vec<SubscriberId> {
        let mut failed = Vec::new();

        for (id, client) in &self.subscribers {
            if client
                .daemon_stopping(tarpc::context::current())
                .await
                .is_err()
            {
                failed.push(*id);
            }
        }

        failed
    }

    /// Ping all subscribers to check if they're alive.
    /// Returns IDs of subscribers that failed to respond.
    pub async fn ping_all(&self) -> Vec<SubscriberId> {
        let mut failed = Vec::new();

        for (id, client) in &self.subscribers {
            match client.ping(tarpc::context::current()).await {
                Ok(true) => {}
                _ => failed.push(*id),
            }
        }

        failed
    }
}

impl Default for SubscriberRegistry {
    fn default() -> Self {
        Self::new()
    }
}
