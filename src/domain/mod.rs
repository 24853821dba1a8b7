//! Domain types shared by the attendance registry, the RPC layer and the CLI.
//!
//! Everything in here is plain data: sessions as seen from the outside
//! (snapshots), redemption records, credentials, events and the error
//! taxonomy. The stateful pieces live in [`crate::registry`].

pub mod credential;
pub mod errors;
pub mod events;
pub mod geo;
pub mod types;

pub use credential::{Credential, IssuedCredential};
pub use errors::{AttendanceError, RedeemRejection};
pub use events::{SessionEvent, SessionEventEnvelope};
pub use types::{
    CooldownEntry, Coordinates, CreateSessionRequest, DevicePrecheck, Geofence, HealthReport,
    RedeemReceipt, RedeemRequest, RedemptionPolicy, RedemptionRecord, SessionSnapshot,
    SessionStats,
};
