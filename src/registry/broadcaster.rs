//! Event Broadcaster: per-session sequence numbers, a bounded replay buffer
//! and fan-out to subscriber channels.
//!
//! The broadcaster never touches session state. Callers publish while they
//! still hold the session lock, which is what makes delivery order equal
//! commit order.

use crate::domain::{SessionEvent, SessionEventEnvelope};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

/// Identifier the daemon assigns to each connected subscriber.
pub type SubscriberId = u64;

/// Default number of envelopes kept per session for replay.
pub const DEFAULT_EVENT_BACKLOG: usize = 64;

#[derive(Default)]
struct SessionChannel {
    last_sequence: u64,
    backlog: VecDeque<SessionEventEnvelope>,
    subscribers: HashMap<SubscriberId, UnboundedSender<SessionEventEnvelope>>,
}

impl SessionChannel {
    /// Buffered events after `since`, or `None` when the buffer no longer
    /// reaches back that far (or `since` is in the future).
    fn replay_since(&self, since: u64) -> Option<Vec<SessionEventEnvelope>> {
        if since > self.last_sequence {
            return None;
        }
        let oldest = self
            .backlog
            .front()
            .map(|e| e.sequence)
            .unwrap_or(self.last_sequence + 1);
        if since + 1 < oldest {
            return None;
        }
        Some(
            self.backlog
                .iter()
                .filter(|e| e.sequence > since)
                .cloned()
                .collect(),
        )
    }
}

/// Result of adding a subscriber to a session channel.
#[derive(Debug)]
pub struct Registration {
    /// Sequence of the last event published before registration.
    pub last_sequence: u64,
    /// Replayed events when a `since` sequence was given and still buffered.
    pub missed: Option<Vec<SessionEventEnvelope>>,
    /// Every event published after registration, in order.
    pub events: UnboundedReceiver<SessionEventEnvelope>,
}

pub struct EventBroadcaster {
    channels: RwLock<HashMap<String, Arc<Mutex<SessionChannel>>>>,
    backlog_capacity: usize,
}

impl EventBroadcaster {
    pub fn new(backlog_capacity: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            backlog_capacity: backlog_capacity.max(1),
        }
    }

    async fn channel(&self, session_id: &str) -> Arc<Mutex<SessionChannel>> {
        if let Some(channel) = self.channels.read().await.get(session_id) {
            return channel.clone();
        }
        let mut channels = self.channels.write().await;
        channels
            .entry(session_id.to_string())
            .or_default()
            .clone()
    }

    async fn existing(&self, session_id: &str) -> Option<Arc<Mutex<SessionChannel>>> {
        self.channels.read().await.get(session_id).cloned()
    }

    /// Adds (or replaces) a subscriber on a session's channel.
    pub async fn register(
        &self,
        session_id: &str,
        subscriber: SubscriberId,
        since: Option<u64>,
    ) -> Registration {
        let channel = self.channel(session_id).await;
        let mut channel = channel.lock().await;
        let (tx, rx) = mpsc::unbounded_channel();
        channel.subscribers.insert(subscriber, tx);
        Registration {
            last_sequence: channel.last_sequence,
            missed: since.and_then(|s| channel.replay_since(s)),
            events: rx,
        }
    }

    /// Returns false if the subscriber was not on that channel.
    pub async fn unsubscribe(&self, session_id: &str, subscriber: SubscriberId) -> bool {
        match self.existing(session_id).await {
            Some(channel) => channel.lock().await.subscribers.remove(&subscriber).is_some(),
            None => false,
        }
    }

    /// Removes a subscriber from every channel. Returns how many it was on.
    pub async fn drop_subscriber(&self, subscriber: SubscriberId) -> usize {
        let channels: Vec<Arc<Mutex<SessionChannel>>> =
            self.channels.read().await.values().cloned().collect();
        let mut removed = 0;
        for channel in channels {
            if channel.lock().await.subscribers.remove(&subscriber).is_some() {
                removed += 1;
            }
        }
        removed
    }

    /// Stamps the next sequence number, buffers the envelope and fans it out.
    /// Subscribers whose receiver is gone are dropped.
    pub async fn publish(
        &self,
        session_id: &str,
        event: SessionEvent,
        now: DateTime<Utc>,
    ) -> SessionEventEnvelope {
        let channel = self.channel(session_id).await;
        let mut channel = channel.lock().await;
        channel.last_sequence += 1;
        let envelope = SessionEventEnvelope {
            session_id: session_id.to_string(),
            sequence: channel.last_sequence,
            emitted_at: now,
            event,
        };
        debug!(
            session_id,
            sequence = envelope.sequence,
            event = envelope.event.name(),
            "publishing session event"
        );

        channel.backlog.push_back(envelope.clone());
        while channel.backlog.len() > self.backlog_capacity {
            channel.backlog.pop_front();
        }

        channel.subscribers.retain(|id, tx| {
            let alive = tx.send(envelope.clone()).is_ok();
            if !alive {
                warn!(session_id, subscriber = *id, "dropping closed subscriber channel");
            }
            alive
        });

        envelope
    }

    #[cfg(test)]
    pub async fn last_sequence(&self, session_id: &str) -> u64 {
        match self.existing(session_id).await {
            Some(channel) => channel.lock().await.last_sequence,
            None => 0,
        }
    }

    pub async fn subscriber_count(&self, session_id: &str) -> usize {
        match self.existing(session_id).await {
            Some(channel) => channel.lock().await.subscribers.len(),
            None => 0,
        }
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BACKLOG)
    }
}

#[cfg(test)]
#[path = "tests/broadcaster_tests.rs"]
mod tests;
