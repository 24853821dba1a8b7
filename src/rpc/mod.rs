//! RPC service definitions for the attendance daemon.
//!
//! - Client -> daemon: `AttendanceService` on the main port.
//! - Daemon -> subscriber: `SubscriberCallback`, served by each subscriber
//!   over its connection to the subscriber port.

pub mod attendance_service;

use crate::domain::{AttendanceError, SessionEventEnvelope, SessionSnapshot};
use serde::{Deserialize, Serialize};

/// Result type for attendance RPC methods.
pub type RpcResult<T> = Result<T, AttendanceError>;

/// Contents of the daemon's port file, read by clients to find it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortFileContent {
    #[serde(default = "default_host")]
    pub host: String,
    pub port: u16,
    pub subscriber_port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

impl PortFileContent {
    pub fn main_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn subscriber_addr(&self) -> String {
        format!("{}:{}", self.host, self.subscriber_port)
    }
}

/// Reply to `subscribe`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscribeReply {
    /// Absent when the session does not exist yet.
    pub snapshot: Option<SessionSnapshot>,
    /// Sequence of the last event published before the subscription.
    pub last_sequence: u64,
    /// Buffered events after the requested `since`; absent when the buffer no
    /// longer reaches back that far or no `since` was given.
    pub missed: Option<Vec<SessionEventEnvelope>>,
}

#[cfg(test)]
#[path = "tests/rpc_tests.rs"]
mod tests;
