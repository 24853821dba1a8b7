//! RPC subscription for receiving a session's events from the daemon.
//!
//! Architecture:
//! 1. Subscriber connects to the daemon's subscriber port
//! 2. Subscriber runs a SubscriberCallback RPC server on that connection
//! 3. Daemon assigns an id and announces it through `assigned`
//! 4. Subscriber calls `subscribe` on the main port with that id
//! 5. Daemon calls into the subscriber's server to push events

use crate::daemon_log::daemon_log;
use crate::domain::{SessionEventEnvelope, SessionSnapshot};
use crate::rpc::attendance_service::SubscriberCallback;
use crate::rpc::PortFileContent;
use crate::sessiond::rpc_client::{flatten, AttendanceClient};
use anyhow::{Context, Result};
use futures::StreamExt;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tarpc::server::{self, Channel};
use tarpc::tokio_serde::formats::Bincode;
use tokio::sync::{mpsc, oneshot, Mutex};

/// How long to wait for the daemon to announce our subscriber id.
const ASSIGN_TIMEOUT: Duration = Duration::from_secs(5);

/// Events received from the daemon via subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionEvent {
    /// A session event, in sequence order
    Event(Box<SessionEventEnvelope>),
    /// Daemon is stopping (subscriber should reconnect later)
    DaemonStopping,
}

/// Handler that implements SubscriberCallback and forwards events to a channel.
#[derive(Clone)]
struct SubscriptionHandler {
    tx: mpsc::UnboundedSender<SubscriptionEvent>,
    assigned: Arc<Mutex<Option<oneshot::Sender<u64>>>>,
}

impl SubscriberCallback for SubscriptionHandler {
    async fn assigned(self, _: tarpc::context::Context, subscriber_id: u64) {
        if let Some(tx) = self.assigned.lock().await.take() {
            let _ = tx.send(subscriber_id);
        }
    }

    async fn session_event(self, _: tarpc::context::Context, envelope: SessionEventEnvelope) {
        let _ = self.tx.send(SubscriptionEvent::Event(Box::new(envelope)));
    }

    async fn daemon_stopping(self, _: tarpc::context::Context) {
        daemon_log("rpc_subscription", "Daemon stopping notification");
        let _ = self.tx.send(SubscriptionEvent::DaemonStopping);
    }

    async fn ping(self, _: tarpc::context::Context) -> bool {
        true
    }
}

/// A live subscription to one session.
///
/// Replayed events (when `since` was given and still buffered) are yielded
/// first, then pushed events. Anything at or below the last yielded sequence
/// is skipped, so each event is seen once and in order.
pub struct RpcSubscription {
    client: AttendanceClient,
    subscriber_id: u64,
    session_id: String,
    snapshot: Option<SessionSnapshot>,
    subscribed_at: u64,
    replayed: bool,
    cursor: u64,
    pending: VecDeque<SessionEventEnvelope>,
    rx: mpsc::UnboundedReceiver<SubscriptionEvent>,
    server_task: tokio::task::JoinHandle<()>,
}

impl RpcSubscription {
    /// Connect to the daemon and subscribe to `session_id`.
    pub async fn connect(
        port_info: PortFileContent,
        session_id: &str,
        since: Option<u64>,
    ) -> Result<Self> {
        use tarpc::serde_transport::tcp;

        let client = AttendanceClient::connect_to(port_info).await?;

        let subscriber_addr = client.port_info().subscriber_addr();
        let transport = tcp::connect(&subscriber_addr, Bincode::default)
            .await
            .with_context(|| format!("Failed to connect to subscriber port {}", subscriber_addr))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let (id_tx, id_rx) = oneshot::channel();
        let handler = SubscriptionHandler {
            tx,
            assigned: Arc::new(Mutex::new(Some(id_tx))),
        };

        // The daemon calls into this server to push notifications.
        let server_task = tokio::spawn(async move {
            let channel = server::BaseChannel::with_defaults(transport);
            channel
                .execute(handler.serve())
                .for_each(|response| async {
                    tokio::spawn(response);
                })
                .await;
            daemon_log("rpc_subscription", "Callback server ended");
        });

        let subscriber_id = tokio::time::timeout(ASSIGN_TIMEOUT, id_rx)
            .await
            .context("Timed out waiting for subscriber id")?
            .context("Daemon closed the subscriber connection")?;

        let reply = flatten(
            client
                .inner()
                .subscribe(
                    tarpc::context::current(),
                    subscriber_id,
                    session_id.to_string(),
                    since,
                )
                .await,
        )?;

        daemon_log(
            "rpc_subscription",
            &format!(
                "Subscribed to {} as {} at #{}",
                session_id, subscriber_id, reply.last_sequence
            ),
        );

        let (replayed, cursor, pending) = match (since, reply.missed) {
            (Some(since), Some(missed)) => (true, since, missed.into_iter().collect()),
            _ => (false, reply.last_sequence, VecDeque::new()),
        };

        Ok(Self {
            client,
            subscriber_id,
            session_id: session_id.to_string(),
            snapshot: reply.snapshot,
            subscribed_at: reply.last_sequence,
            replayed,
            cursor,
            pending,
            rx,
            server_task,
        })
    }

    pub fn subscriber_id(&self) -> u64 {
        self.subscriber_id
    }

    /// Session state at subscription time; `None` if it did not exist yet.
    pub fn snapshot(&self) -> Option<&SessionSnapshot> {
        self.snapshot.as_ref()
    }

    /// Sequence of the last event published before subscribing.
    pub fn subscribed_at(&self) -> u64 {
        self.subscribed_at
    }

    /// True when the requested `since` was served from the replay buffer.
    pub fn replayed(&self) -> bool {
        self.replayed
    }

    /// Receive the next event. Returns None if the connection is closed.
    pub async fn recv(&mut self) -> Option<SubscriptionEvent> {
        if let Some(envelope) = self.pending.pop_front() {
            self.cursor = envelope.sequence;
            return Some(SubscriptionEvent::Event(Box::new(envelope)));
        }
        loop {
            match self.rx.recv().await? {
                SubscriptionEvent::Event(envelope) => {
                    if envelope.session_id != self.session_id || envelope.sequence <= self.cursor {
                        continue;
                    }
                    self.cursor = envelope.sequence;
                    return Some(SubscriptionEvent::Event(envelope));
                }
                SubscriptionEvent::DaemonStopping => return Some(SubscriptionEvent::DaemonStopping),
            }
        }
    }

    /// Stop delivery for this session.
    pub async fn unsubscribe(&self) -> Result<bool> {
        flatten(
            self.client
                .inner()
                .unsubscribe(
                    tarpc::context::current(),
                    self.subscriber_id,
                    self.session_id.clone(),
                )
                .await,
        )
    }
}

impl Drop for RpcSubscription {
    fn drop(&mut self) {
        // Closing the callback server closes the connection, which the
        // daemon's next ping notices.
        self.server_task.abort();
    }
}
