//! RPC client for the attendance daemon.
//!
//! Finds the daemon through its port file and wraps `AttendanceServiceClient`
//! so callers see one `anyhow::Result` per call. Domain errors keep their
//! `AttendanceError` type inside the `anyhow::Error` and can be downcast.

use crate::attendd_paths;
use crate::daemon_log::daemon_log;
use crate::domain::{
    AttendanceError, CreateSessionRequest, DevicePrecheck, HealthReport, IssuedCredential,
    RedeemReceipt, RedeemRequest, RedemptionRecord, SessionSnapshot, SessionStats,
};
use crate::rpc::attendance_service::AttendanceServiceClient;
use crate::rpc::PortFileContent;
use anyhow::{Context, Result};
use std::path::Path;
use std::time::Duration;
use tarpc::client;
use tarpc::context;
use tarpc::tokio_serde::formats::Bincode;

/// Maximum connection attempts with exponential backoff.
const MAX_CONNECT_ATTEMPTS: u32 = 5;

/// Base delay for exponential backoff (milliseconds).
const BASE_DELAY_MS: u64 = 100;

/// Reads and parses a daemon port file.
pub fn read_port_file(path: &Path) -> Result<PortFileContent> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("attendd is not running (no port file at {})", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Malformed port file: {}", path.display()))
}

/// Flattens the transport result and the domain result of one RPC.
pub(crate) fn flatten<T>(
    result: Result<Result<T, AttendanceError>, tarpc::client::RpcError>,
) -> Result<T> {
    match result {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(anyhow::Error::new(e)),
        Err(e) => Err(anyhow::Error::new(e).context("RPC to attendd failed")),
    }
}

/// Client for the attendance daemon.
pub struct AttendanceClient {
    client: AttendanceServiceClient,
    port_info: PortFileContent,
}

impl AttendanceClient {
    /// Connect using the default port file.
    pub async fn connect() -> Result<Self> {
        let port_info = read_port_file(&attendd_paths::port_path()?)?;
        Self::connect_to(port_info).await
    }

    /// Connect to the daemon described by `port_info`, retrying with backoff.
    pub async fn connect_to(port_info: PortFileContent) -> Result<Self> {
        use tarpc::serde_transport::tcp;

        let addr = port_info.main_addr();
        let mut last_error = None;
        for attempt in 0..MAX_CONNECT_ATTEMPTS {
            match tcp::connect(&addr, Bincode::default).await {
                Ok(transport) => {
                    let client =
                        AttendanceServiceClient::new(client::Config::default(), transport).spawn();
                    return Ok(Self { client, port_info });
                }
                Err(e) => {
                    daemon_log(
                        "rpc_client",
                        &format!("Connect attempt {} to {} failed: {}", attempt + 1, addr, e),
                    );
                    last_error = Some(e);
                    let delay = BASE_DELAY_MS * 2u64.pow(attempt);
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
            }
        }
        match last_error {
            Some(e) => Err(e).with_context(|| format!("Failed to connect to attendd at {}", addr)),
            None => anyhow::bail!("Failed to connect to attendd at {}", addr),
        }
    }

    pub fn port_info(&self) -> &PortFileContent {
        &self.port_info
    }

    pub async fn create_session(&self, request: CreateSessionRequest) -> Result<SessionSnapshot> {
        flatten(self.client.create_session(context::current(), request).await)
    }

    pub async fn get_session(&self, session_id: &str) -> Result<SessionSnapshot> {
        flatten(
            self.client
                .get_session(context::current(), session_id.to_string())
                .await,
        )
    }

    pub async fn end_session(&self, session_id: &str) -> Result<SessionSnapshot> {
        flatten(
            self.client
                .end_session(context::current(), session_id.to_string())
                .await,
        )
    }

    pub async fn issue_credential(&self, session_id: &str) -> Result<IssuedCredential> {
        flatten(
            self.client
                .issue_credential(context::current(), session_id.to_string())
                .await,
        )
    }

    pub async fn redeem(&self, request: RedeemRequest) -> Result<RedeemReceipt> {
        flatten(self.client.redeem(context::current(), request).await)
    }

    pub async fn precheck(&self, session_id: &str, device_id: &str) -> Result<DevicePrecheck> {
        flatten(
            self.client
                .precheck(
                    context::current(),
                    session_id.to_string(),
                    device_id.to_string(),
                )
                .await,
        )
    }

    pub async fn credential_used(&self, session_id: &str, credential_id: &str) -> Result<bool> {
        flatten(
            self.client
                .credential_used(
                    context::current(),
                    session_id.to_string(),
                    credential_id.to_string(),
                )
                .await,
        )
    }

    pub async fn session_stats(&self, session_id: &str) -> Result<SessionStats> {
        flatten(
            self.client
                .session_stats(context::current(), session_id.to_string())
                .await,
        )
    }

    pub async fn session_devices(&self, session_id: &str) -> Result<Vec<RedemptionRecord>> {
        flatten(
            self.client
                .session_devices(context::current(), session_id.to_string())
                .await,
        )
    }

    pub async fn health(&self) -> Result<HealthReport> {
        self.client
            .health(context::current())
            .await
            .context("RPC to attendd failed")
    }

    pub async fn shutdown(&self) -> Result<()> {
        flatten(self.client.shutdown(context::current()).await)
    }

    pub(crate) fn inner(&self) -> &AttendanceServiceClient {
        &self.client
    }
}
