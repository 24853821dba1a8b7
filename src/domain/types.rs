//! Core data types for attendance sessions and redemptions.

use crate::domain::errors::RedeemRejection;
use crate::domain::geo::haversine_distance_m;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Default credential lifetime (seconds).
pub const DEFAULT_CREDENTIAL_TTL_SECS: u64 = 120;

/// Default cross-session device cooldown (seconds): 50 minutes.
pub const DEFAULT_DEVICE_COOLDOWN_SECS: u64 = 50 * 60;

/// Default geofence radius (meters).
pub const DEFAULT_GEOFENCE_RADIUS_M: f64 = 50.0;

/// A latitude/longitude pair in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lng: f64,
}

impl Coordinates {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// True when both components are finite and inside the WGS84 ranges.
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }
}

/// Center point plus radius within which redemptions must be reported.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Geofence {
    pub center: Coordinates,
    pub radius_m: f64,
}

impl Geofence {
    pub fn new(center: Coordinates, radius_m: f64) -> Self {
        Self { center, radius_m }
    }

    /// Distance from the fence center to `point`, in meters.
    pub fn distance_to(&self, point: Coordinates) -> f64 {
        haversine_distance_m(self.center, point)
    }

    /// A point exactly on the boundary is inside.
    pub fn contains(&self, point: Coordinates) -> bool {
        self.distance_to(point) <= self.radius_m
    }
}

/// One committed redemption. Immutable once appended to its session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedemptionRecord {
    pub device_id: String,
    pub session_id: String,
    /// Roll number of the attendee.
    pub subject_id: String,
    pub committed_at: DateTime<Utc>,
    pub reported_ip: Option<String>,
    pub reported_location: Option<Coordinates>,
    pub credential_id: String,
}

/// Most recent successful redemption of a device, across all sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CooldownEntry {
    pub session_id: String,
    pub redeemed_at: DateTime<Utc>,
}

/// Read-only copy of a session handed to API callers and subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub owner_id: String,
    pub class_id: String,
    pub section: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub geofence: Option<Geofence>,
    /// Consumed credential ids, sorted.
    pub consumed_credentials: Vec<String>,
    /// Redemptions in commit order.
    pub redemptions: Vec<RedemptionRecord>,
}

/// Input for creating a session.
///
/// When `session_id` is `None` the registry generates one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    pub session_id: Option<String>,
    pub owner_id: String,
    pub class_id: String,
    pub section: String,
    pub geofence_center: Option<Coordinates>,
}

/// Redemption request as it arrives over the wire, carrying the encoded
/// credential payload scanned by the attendee.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedeemRequest {
    pub session_id: String,
    pub credential_payload: String,
    pub device_id: String,
    pub subject_id: String,
    pub reported_ip: Option<String>,
    pub reported_location: Option<Coordinates>,
}

/// Successful redemption result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedeemReceipt {
    pub session_id: String,
    pub device_count: usize,
    /// Sequence number of the `Redeemed` event published for this commit.
    pub sequence: u64,
    pub record: RedemptionRecord,
}

/// Advisory answer to "may this device redeem in this session right now?".
///
/// Never authoritative; only the validator's commit path enforces anything.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DevicePrecheck {
    pub allowed: bool,
    pub reason: Option<RedeemRejection>,
    pub remaining_secs: Option<u64>,
}

impl DevicePrecheck {
    pub fn allowed() -> Self {
        Self {
            allowed: true,
            reason: None,
            remaining_secs: None,
        }
    }

    pub fn denied(reason: RedeemRejection) -> Self {
        let remaining_secs = match &reason {
            RedeemRejection::DeviceCoolingDown { remaining_secs } => Some(*remaining_secs),
            _ => None,
        };
        Self {
            allowed: false,
            reason: Some(reason),
            remaining_secs,
        }
    }
}

/// Summary numbers for the presenter dashboard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    pub session_id: String,
    pub active: bool,
    pub redemption_count: usize,
    pub unique_devices: usize,
    pub duration_secs: i64,
}

/// Liveness probe response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: String,
    pub active_session_count: usize,
    pub server_time: DateTime<Utc>,
    pub build_sha: String,
}

/// Time and distance limits applied by the redemption validator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RedemptionPolicy {
    pub credential_ttl: Duration,
    pub device_cooldown: Duration,
    pub geofence_radius_m: f64,
}

impl Default for RedemptionPolicy {
    fn default() -> Self {
        Self {
            credential_ttl: Duration::seconds(DEFAULT_CREDENTIAL_TTL_SECS as i64),
            device_cooldown: Duration::seconds(DEFAULT_DEVICE_COOLDOWN_SECS as i64),
            geofence_radius_m: DEFAULT_GEOFENCE_RADIUS_M,
        }
    }
}
