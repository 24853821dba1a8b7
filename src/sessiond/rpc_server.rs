//! RPC server implementation for the attendance daemon.
//!
//! Implements the tarpc `AttendanceService` trait on top of `AttendanceCore`
//! and pushes session events to subscribers over their callback connections.

use crate::attendd_paths;
use crate::config::AttendanceConfig;
use crate::daemon_log::daemon_log;
use crate::domain::{
    AttendanceError, CreateSessionRequest, DevicePrecheck, HealthReport, IssuedCredential,
    RedeemReceipt, RedeemRequest, RedemptionRecord, SessionEventEnvelope, SessionSnapshot,
    SessionStats,
};
use crate::registry::{AttendanceCore, SubscriberId};
use crate::rpc::attendance_service::{AttendanceService, SubscriberCallbackClient};
use crate::rpc::{PortFileContent, RpcResult, SubscribeReply};
use crate::sessiond::subscribers::SubscriberRegistry;
use chrono::Utc;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tarpc::server::{self, Channel};
use tarpc::tokio_serde::formats::Bincode;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::{broadcast, RwLock};
use tracing::{info, warn};

/// Server implementation for AttendanceService.
#[derive(Clone)]
pub struct AttendanceServer {
    core: Arc<AttendanceCore>,
    subscribers: Arc<RwLock<SubscriberRegistry>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl AttendanceServer {
    pub fn new(
        core: Arc<AttendanceCore>,
        subscribers: Arc<RwLock<SubscriberRegistry>>,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Self {
        Self {
            core,
            subscribers,
            shutdown_tx,
        }
    }
}

/// Pushes one session's events to one subscriber, in order, until the
/// subscription is dropped or a push fails.
fn spawn_forwarder(
    core: Arc<AttendanceCore>,
    client: SubscriberCallbackClient,
    subscriber_id: SubscriberId,
    session_id: String,
    mut events: UnboundedReceiver<SessionEventEnvelope>,
) {
    tokio::spawn(async move {
        while let Some(envelope) = events.recv().await {
            let sequence = envelope.sequence;
            if let Err(e) = client
                .session_event(tarpc::context::current(), envelope)
                .await
            {
                daemon_log(
                    "rpc_server",
                    &format!(
                        "Push of {}#{} to subscriber {} failed: {}",
                        session_id, sequence, subscriber_id, e
                    ),
                );
                warn!(
                    subscriber_id,
                    session_id = %session_id,
                    "subscriber push failed; unsubscribing"
                );
                core.unsubscribe(&session_id, subscriber_id).await;
                break;
            }
        }
    });
}

impl AttendanceService for AttendanceServer {
    async fn create_session(
        self,
        _: tarpc::context::Context,
        request: CreateSessionRequest,
    ) -> RpcResult<SessionSnapshot> {
        self.core.create_session(request, Utc::now()).await
    }

    async fn get_session(
        self,
        _: tarpc::context::Context,
        session_id: String,
    ) -> RpcResult<SessionSnapshot> {
        self.core.get_session(&session_id).await
    }

    async fn end_session(
        self,
        _: tarpc::context::Context,
        session_id: String,
    ) -> RpcResult<SessionSnapshot> {
        self.core.end_session(&session_id, Utc::now()).await
    }

    async fn issue_credential(
        self,
        _: tarpc::context::Context,
        session_id: String,
    ) -> RpcResult<IssuedCredential> {
        self.core.issue_credential(&session_id, Utc::now()).await
    }

    async fn redeem(
        self,
        _: tarpc::context::Context,
        request: RedeemRequest,
    ) -> RpcResult<RedeemReceipt> {
        self.core.redeem_payload(request, Utc::now()).await
    }

    async fn precheck(
        self,
        _: tarpc::context::Context,
        session_id: String,
        device_id: String,
    ) -> RpcResult<DevicePrecheck> {
        self.core
            .precheck(&session_id, &device_id, Utc::now())
            .await
    }

    async fn credential_used(
        self,
        _: tarpc::context::Context,
        session_id: String,
        credential_id: String,
    ) -> RpcResult<bool> {
        self.core.credential_used(&session_id, &credential_id).await
    }

    async fn session_stats(
        self,
        _: tarpc::context::Context,
        session_id: String,
    ) -> RpcResult<SessionStats> {
        self.core.session_stats(&session_id, Utc::now()).await
    }

    async fn session_devices(
        self,
        _: tarpc::context::Context,
        session_id: String,
    ) -> RpcResult<Vec<RedemptionRecord>> {
        self.core.session_devices(&session_id).await
    }

    async fn subscribe(
        self,
        _: tarpc::context::Context,
        subscriber_id: u64,
        session_id: String,
        since: Option<u64>,
    ) -> RpcResult<SubscribeReply> {
        let client = {
            let registry = self.subscribers.read().await;
            registry.get(&subscriber_id)
        }
        .ok_or_else(|| {
            AttendanceError::validation(format!("unknown subscriber id {}", subscriber_id))
        })?;

        let subscription = self.core.subscribe(&session_id, subscriber_id, since).await?;
        daemon_log(
            "rpc_server",
            &format!(
                "Subscriber {} subscribed to {} at #{}",
                subscriber_id, session_id, subscription.last_sequence
            ),
        );
        spawn_forwarder(
            self.core.clone(),
            client,
            subscriber_id,
            session_id,
            subscription.events,
        );

        Ok(SubscribeReply {
            snapshot: subscription.snapshot,
            last_sequence: subscription.last_sequence,
            missed: subscription.missed,
        })
    }

    async fn unsubscribe(
        self,
        _: tarpc::context::Context,
        subscriber_id: u64,
        session_id: String,
    ) -> RpcResult<bool> {
        Ok(self.core.unsubscribe(&session_id, subscriber_id).await)
    }

    async fn health(self, _: tarpc::context::Context) -> HealthReport {
        self.core.health(Utc::now())
    }

    async fn shutdown(self, _: tarpc::context::Context) -> RpcResult<()> {
        daemon_log("rpc_server", "Shutdown requested");
        notify_stopping(&self.subscribers).await;
        let _ = self.shutdown_tx.send(());
        Ok(())
    }
}

async fn notify_stopping(subscribers: &Arc<RwLock<SubscriberRegistry>>) {
    let registry = subscribers.read().await;
    let failed = registry.broadcast_stopping().await;
    if !failed.is_empty() {
        daemon_log(
            "rpc_server",
            &format!("{} subscribers unreachable at shutdown", failed.len()),
        );
    }
}

/// Run the daemon RPC server on `addr` until shutdown.
pub async fn run_daemon_server(
    core: Arc<AttendanceCore>,
    subscribers: Arc<RwLock<SubscriberRegistry>>,
    shutdown_tx: broadcast::Sender<()>,
    addr: String,
) -> anyhow::Result<()> {
    use tarpc::serde_transport::tcp;

    let mut listener = tcp::listen(&addr, Bincode::default).await?;

    daemon_log("rpc_server", &format!("RPC server listening on {}", addr));

    let mut shutdown_rx = shutdown_tx.subscribe();

    loop {
        tokio::select! {
            Some(result) = listener.next() => {
                match result {
                    Ok(transport) => {
                        let server = AttendanceServer::new(
                            core.clone(),
                            subscribers.clone(),
                            shutdown_tx.clone(),
                        );

                        let channel = server::BaseChannel::with_defaults(transport);

                        tokio::spawn(async move {
                            channel.execute(server.serve()).for_each(|response| async {
                                tokio::spawn(response);
                            }).await;
                        });
                    }
                    Err(e) => {
                        daemon_log("rpc_server", &format!("Accept error: {}", e));
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                break;
            }
        }
    }

    Ok(())
}

/// Run the subscriber listener on `addr`.
///
/// Each accepted connection becomes a `SubscriberCallback` client. The new
/// subscriber learns its id through `assigned` and then subscribes to
/// sessions on the main port.
pub async fn run_subscriber_listener(
    subscribers: Arc<RwLock<SubscriberRegistry>>,
    shutdown_tx: broadcast::Sender<()>,
    addr: String,
) -> anyhow::Result<()> {
    use tarpc::client;
    use tarpc::serde_transport::tcp;

    let mut listener = tcp::listen(&addr, Bincode::default).await?;

    daemon_log("rpc_server", &format!("Subscriber listener on {}", addr));

    let mut shutdown_rx = shutdown_tx.subscribe();

    loop {
        tokio::select! {
            Some(result) = listener.next() => {
                match result {
                    Ok(transport) => {
                        let callback_client = SubscriberCallbackClient::new(
                            client::Config::default(),
                            transport,
                        ).spawn();

                        let subscriber_id = {
                            let mut registry = subscribers.write().await;
                            registry.add(callback_client.clone())
                        };

                        daemon_log(
                            "rpc_server",
                            &format!("Subscriber connected: {}", subscriber_id),
                        );

                        tokio::spawn(async move {
                            if let Err(e) = callback_client
                                .assigned(tarpc::context::current(), subscriber_id)
                                .await
                            {
                                daemon_log(
                                    "rpc_server",
                                    &format!("Failed to assign id {}: {}", subscriber_id, e),
                                );
                            }
                        });
                    }
                    Err(e) => {
                        daemon_log("rpc_server", &format!("Subscriber accept error: {}", e));
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                break;
            }
        }
    }

    Ok(())
}

/// Background task to periodically clean up dead subscriber connections.
/// Sends a ping to each subscriber and removes those that don't respond,
/// together with all of their session subscriptions.
pub async fn run_subscriber_cleanup(
    core: Arc<AttendanceCore>,
    subscribers: Arc<RwLock<SubscriberRegistry>>,
    shutdown_tx: broadcast::Sender<()>,
    period: Duration,
) {
    let mut shutdown_rx = shutdown_tx.subscribe();
    let mut interval = tokio::time::interval(period);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let failed = {
                    let registry = subscribers.read().await;
                    if registry.count() == 0 {
                        continue;
                    }
                    registry.ping_all().await
                };

                if !failed.is_empty() {
                    let mut registry = subscribers.write().await;
                    for id in &failed {
                        registry.remove(id);
                        let dropped = core.drop_subscriber(*id).await;
                        daemon_log(
                            "rpc_server",
                            &format!(
                                "Cleanup: removed dead subscriber {} ({} sessions)",
                                id, dropped
                            ),
                        );
                    }
                    daemon_log(
                        "rpc_server",
                        &format!(
                            "Cleanup: {} dead subscribers removed, {} remaining",
                            failed.len(),
                            registry.count()
                        ),
                    );
                }
            }
            _ = shutdown_rx.recv() => {
                break;
            }
        }
    }
}

/// Find an available TCP port on `host`.
pub async fn find_available_port(host: &str) -> anyhow::Result<u16> {
    use tokio::net::TcpListener;
    let listener = TcpListener::bind((host, 0)).await?;
    Ok(listener.local_addr()?.port())
}

/// Main entry point for `attendd serve`.
///
/// Holds the daemon lock for its whole lifetime, publishes the pid and port
/// files for clients, and removes them again on exit.
pub async fn run_daemon(config: AttendanceConfig) -> anyhow::Result<()> {
    use anyhow::Context;
    use fs2::FileExt;

    let lock_path = attendd_paths::lock_path()?;
    let lock_file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&lock_path)
        .context("Failed to open lock file")?;
    match lock_file.try_lock_exclusive() {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
            anyhow::bail!(
                "Another attendd daemon is already running (lock held on {})",
                lock_path.display()
            );
        }
        Err(e) => return Err(e).context("Failed to acquire daemon lock"),
    }

    let pid_path = attendd_paths::pid_path()?;
    std::fs::write(&pid_path, std::process::id().to_string())
        .context("Failed to write PID file")?;

    let core = Arc::new(AttendanceCore::new(
        config.redemption_policy(),
        config.policy.event_backlog,
    ));
    let subscribers = Arc::new(RwLock::new(SubscriberRegistry::new()));
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let host = config.server.host.clone();
    let main_port = match config.server.port {
        0 => find_available_port(&host).await?,
        port => port,
    };
    let subscriber_port = match config.server.subscriber_port {
        0 => find_available_port(&host).await?,
        port => port,
    };

    let port_path = attendd_paths::port_path()?;
    let port_content = PortFileContent {
        host: host.clone(),
        port: main_port,
        subscriber_port,
    };
    std::fs::write(&port_path, serde_json::to_string(&port_content)?)
        .context("Failed to write port file")?;

    info!(
        main = %port_content.main_addr(),
        subscriber = %port_content.subscriber_addr(),
        cooldown_secs = config.policy.device_cooldown_secs,
        "attendd starting"
    );
    daemon_log(
        "rpc_server",
        &format!(
            "Daemon starting on ports {} (main) and {} (subscriber)",
            main_port, subscriber_port
        ),
    );

    let sub_subscribers = subscribers.clone();
    let sub_shutdown = shutdown_tx.clone();
    let sub_addr = port_content.subscriber_addr();
    tokio::spawn(async move {
        if let Err(e) = run_subscriber_listener(sub_subscribers, sub_shutdown, sub_addr).await {
            daemon_log("rpc_server", &format!("Subscriber listener error: {}", e));
        }
    });

    let cleanup_core = core.clone();
    let cleanup_subscribers = subscribers.clone();
    let cleanup_shutdown = shutdown_tx.clone();
    let ping_period = Duration::from_secs(config.server.subscriber_ping_secs);
    tokio::spawn(async move {
        run_subscriber_cleanup(cleanup_core, cleanup_subscribers, cleanup_shutdown, ping_period)
            .await;
    });

    let signal_subscribers = subscribers.clone();
    let signal_shutdown = shutdown_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            daemon_log("rpc_server", "Interrupt received, stopping");
            notify_stopping(&signal_subscribers).await;
            let _ = signal_shutdown.send(());
        }
    });

    let result = run_daemon_server(
        core.clone(),
        subscribers,
        shutdown_tx,
        port_content.main_addr(),
    )
    .await;

    info!(
        active_sessions = core.health(Utc::now()).active_session_count,
        "attendd stopped"
    );

    let _ = std::fs::remove_file(&port_path);
    let _ = std::fs::remove_file(&pid_path);
    let _ = FileExt::unlock(&lock_file);

    result
}
