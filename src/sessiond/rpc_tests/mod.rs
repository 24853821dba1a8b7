//! Integration tests for the tarpc RPC implementation.
//!
//! These tests spin up real RPC servers, clients and subscribers on ephemeral
//! ports. No mocks are used.

mod session_tests;

use crate::domain::{Coordinates, CreateSessionRequest, RedemptionPolicy};
use crate::registry::AttendanceCore;
use crate::rpc::attendance_service::AttendanceServiceClient;
use crate::rpc::PortFileContent;
use crate::sessiond::rpc_client::AttendanceClient;
use crate::sessiond::rpc_server::{
    run_daemon_server, run_subscriber_cleanup, run_subscriber_listener,
};
use crate::sessiond::subscribers::SubscriberRegistry;
use std::sync::Arc;
use std::time::Duration;
use tarpc::client;
use tarpc::tokio_serde::formats::Bincode;
use tokio::sync::{broadcast, RwLock};

/// Find an available TCP port for testing.
pub fn find_test_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Create request for a fenced session at the campus reference point.
pub fn create_request(id: &str) -> CreateSessionRequest {
    CreateSessionRequest {
        session_id: Some(id.to_string()),
        owner_id: "faculty-7".to_string(),
        class_id: "CS101".to_string(),
        section: "A".to_string(),
        geofence_center: Some(Coordinates::new(12.9716, 77.5946)),
    }
}

/// About ten meters north of the reference point.
pub fn nearby() -> Coordinates {
    Coordinates::new(12.9716 + 0.0000899, 77.5946)
}

/// Test harness that manages a real RPC server for testing.
pub struct TestServer {
    pub port: u16,
    pub subscriber_port: u16,
    pub core: Arc<AttendanceCore>,
    pub subscribers: Arc<RwLock<SubscriberRegistry>>,
    pub shutdown_tx: broadcast::Sender<()>,
    _server_handle: tokio::task::JoinHandle<()>,
    _subscriber_handle: tokio::task::JoinHandle<()>,
    _cleanup_handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    /// Start a real RPC server for testing.
    pub async fn start() -> Self {
        Self::start_with_ping(Duration::from_secs(30)).await
    }

    /// Start a server whose subscriber cleanup runs every `ping`.
    pub async fn start_with_ping(ping: Duration) -> Self {
        let port = find_test_port();
        let subscriber_port = find_test_port();

        let core = Arc::new(AttendanceCore::new(RedemptionPolicy::default(), 16));
        let subscribers = Arc::new(RwLock::new(SubscriberRegistry::new()));
        let (shutdown_tx, _) = broadcast::channel(1);

        let server_handle = {
            let core = core.clone();
            let subscribers = subscribers.clone();
            let shutdown_tx = shutdown_tx.clone();
            tokio::spawn(async move {
                let addr = format!("127.0.0.1:{}", port);
                let _ = run_daemon_server(core, subscribers, shutdown_tx, addr).await;
            })
        };

        let subscriber_handle = {
            let subscribers = subscribers.clone();
            let shutdown_tx = shutdown_tx.clone();
            tokio::spawn(async move {
                let addr = format!("127.0.0.1:{}", subscriber_port);
                let _ = run_subscriber_listener(subscribers, shutdown_tx, addr).await;
            })
        };

        let cleanup_handle = {
            let core = core.clone();
            let subscribers = subscribers.clone();
            let shutdown_tx = shutdown_tx.clone();
            tokio::spawn(async move {
                run_subscriber_cleanup(core, subscribers, shutdown_tx, ping).await;
            })
        };

        // Give server time to start
        tokio::time::sleep(Duration::from_millis(50)).await;

        Self {
            port,
            subscriber_port,
            core,
            subscribers,
            shutdown_tx,
            _server_handle: server_handle,
            _subscriber_handle: subscriber_handle,
            _cleanup_handle: cleanup_handle,
        }
    }

    pub fn port_info(&self) -> PortFileContent {
        PortFileContent {
            host: "127.0.0.1".to_string(),
            port: self.port,
            subscriber_port: self.subscriber_port,
        }
    }

    /// Create a raw tarpc client connected to this server.
    pub async fn create_raw_client(&self) -> AttendanceServiceClient {
        use tarpc::serde_transport::tcp;

        let addr = format!("127.0.0.1:{}", self.port);
        let transport = tcp::connect(&addr, Bincode::default).await.unwrap();
        AttendanceServiceClient::new(client::Config::default(), transport).spawn()
    }

    /// Create a wrapped client connected to this server.
    pub async fn create_client(&self) -> AttendanceClient {
        AttendanceClient::connect_to(self.port_info()).await.unwrap()
    }

    /// Shutdown the server.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
