//! Service definitions for client <-> daemon RPC.

use crate::domain::{
    CreateSessionRequest, DevicePrecheck, HealthReport, IssuedCredential, RedeemReceipt,
    RedeemRequest, RedemptionRecord, SessionEventEnvelope, SessionSnapshot, SessionStats,
};
use crate::rpc::{RpcResult, SubscribeReply};

/// Service exposed by the attendance daemon to clients.
///
/// Timestamps are taken from the daemon's clock, never from the caller.
#[tarpc::service]
pub trait AttendanceService {
    /// Create a session. A missing `session_id` is generated by the daemon.
    async fn create_session(request: CreateSessionRequest) -> RpcResult<SessionSnapshot>;

    async fn get_session(session_id: String) -> RpcResult<SessionSnapshot>;

    /// End a session. Idempotent.
    async fn end_session(session_id: String) -> RpcResult<SessionSnapshot>;

    /// Mint a one-time credential for an active session.
    async fn issue_credential(session_id: String) -> RpcResult<IssuedCredential>;

    /// Redeem a scanned credential payload.
    async fn redeem(request: RedeemRequest) -> RpcResult<RedeemReceipt>;

    /// Advisory device check. Not authoritative.
    async fn precheck(session_id: String, device_id: String) -> RpcResult<DevicePrecheck>;

    async fn credential_used(session_id: String, credential_id: String) -> RpcResult<bool>;

    async fn session_stats(session_id: String) -> RpcResult<SessionStats>;

    /// Redemptions in commit order.
    async fn session_devices(session_id: String) -> RpcResult<Vec<RedemptionRecord>>;

    /// Start pushing a session's events to a subscriber.
    ///
    /// `subscriber_id` is the id received through `SubscriberCallback::assigned`.
    async fn subscribe(
        subscriber_id: u64,
        session_id: String,
        since: Option<u64>,
    ) -> RpcResult<SubscribeReply>;

    async fn unsubscribe(subscriber_id: u64, session_id: String) -> RpcResult<bool>;

    async fn health() -> HealthReport;

    /// Stop the daemon after notifying subscribers.
    async fn shutdown() -> RpcResult<()>;
}

/// Callback service for push notifications (daemon -> subscriber).
/// Subscribers implement this service; the daemon calls into it.
#[tarpc::service]
pub trait SubscriberCallback {
    /// First call on a new subscriber connection, carrying its id.
    async fn assigned(subscriber_id: u64);

    /// One event of a session the subscriber is subscribed to.
    async fn session_event(envelope: SessionEventEnvelope);

    /// The daemon is going away. Subscribers should reconnect later.
    async fn daemon_stopping();

    /// Ping to check if subscriber is still alive. Returns true if healthy.
    async fn ping() -> bool;
}
