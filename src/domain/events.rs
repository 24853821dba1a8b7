//! Events published on a session channel.

use crate::domain::types::{RedemptionRecord, SessionSnapshot};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Something that happened to a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SessionEvent {
    SessionCreated {
        snapshot: Box<SessionSnapshot>,
    },
    Redeemed {
        device_count: usize,
        record: RedemptionRecord,
    },
    SessionEnded {
        ended_at: DateTime<Utc>,
    },
}

impl SessionEvent {
    /// Short name used in logs and CLI output.
    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::SessionCreated { .. } => "session_created",
            SessionEvent::Redeemed { .. } => "redeemed",
            SessionEvent::SessionEnded { .. } => "session_ended",
        }
    }
}

/// An event stamped with its per-session sequence number.
///
/// Sequences start at 1 and increase by one per event, in commit order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEventEnvelope {
    pub session_id: String,
    pub sequence: u64,
    pub emitted_at: DateTime<Utc>,
    pub event: SessionEvent,
}
