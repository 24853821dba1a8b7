//! Error taxonomy for the attendance domain.
//!
//! Rejections are expected outcomes, not bugs: they are returned as values and
//! cross the RPC boundary unchanged, so every variant is serializable.

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// Broad error category, used to pick retry behavior and external status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Malformed or missing input. Retrying without fixing input is pointless.
    Validation,
    /// Session or other resource absent.
    NotFound,
    /// Legitimate conflict with current state.
    Conflict,
    /// Rejected by location policy.
    Policy,
    /// Store or transport failure.
    Internal,
}

/// Why a redemption was refused, in rule-chain precedence order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RedeemRejection {
    SessionNotFound,
    SessionInactive,
    CredentialAlreadyUsed,
    CredentialExpired,
    DeviceAlreadyRedeemed,
    DeviceCoolingDown { remaining_secs: u64 },
    OutOfRange { distance_m: u64 },
    LocationRequired,
}

impl RedeemRejection {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::SessionNotFound => ErrorKind::NotFound,
            Self::SessionInactive
            | Self::CredentialAlreadyUsed
            | Self::CredentialExpired
            | Self::DeviceAlreadyRedeemed
            | Self::DeviceCoolingDown { .. } => ErrorKind::Conflict,
            Self::OutOfRange { .. } | Self::LocationRequired => ErrorKind::Policy,
        }
    }

    /// Stable machine-readable reason, unique per variant.
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::SessionNotFound => "SESSION_NOT_FOUND",
            Self::SessionInactive => "SESSION_INACTIVE",
            Self::CredentialAlreadyUsed => "CREDENTIAL_ALREADY_USED",
            Self::CredentialExpired => "CREDENTIAL_EXPIRED",
            Self::DeviceAlreadyRedeemed => "DEVICE_ALREADY_REDEEMED",
            Self::DeviceCoolingDown { .. } => "DEVICE_COOLING_DOWN",
            Self::OutOfRange { .. } => "OUT_OF_RANGE",
            Self::LocationRequired => "LOCATION_REQUIRED",
        }
    }

    /// HTTP-style status for API layers that speak HTTP.
    pub fn status_code(&self) -> u16 {
        match self.kind() {
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict => 409,
            ErrorKind::Policy => 403,
            ErrorKind::Validation => 422,
            ErrorKind::Internal => 500,
        }
    }
}

impl Display for RedeemRejection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SessionNotFound => write!(f, "session not found"),
            Self::SessionInactive => write!(f, "session has ended; attendance is closed"),
            Self::CredentialAlreadyUsed => write!(f, "QR code already used"),
            Self::CredentialExpired => write!(f, "QR code expired; scan the current code"),
            Self::DeviceAlreadyRedeemed => write!(f, "device already marked present"),
            Self::DeviceCoolingDown { remaining_secs } => write!(
                f,
                "device recently marked attendance elsewhere; try again in {} seconds",
                remaining_secs
            ),
            Self::OutOfRange { distance_m } => {
                write!(f, "you are {} m away from the session location", distance_m)
            }
            Self::LocationRequired => write!(f, "location is required for this session"),
        }
    }
}

impl std::error::Error for RedeemRejection {}

/// Errors returned by the session API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttendanceError {
    Validation { message: String },
    NotFound { resource: String },
    AlreadyExists { session_id: String },
    Rejected(RedeemRejection),
    Internal { message: String },
}

impl AttendanceError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn session_not_found(session_id: &str) -> Self {
        Self::NotFound {
            resource: format!("session {}", session_id),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. } => ErrorKind::Validation,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::AlreadyExists { .. } => ErrorKind::Conflict,
            Self::Rejected(rejection) => rejection.kind(),
            Self::Internal { .. } => ErrorKind::Internal,
        }
    }

    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::AlreadyExists { .. } => "ALREADY_EXISTS",
            Self::Rejected(rejection) => rejection.reason_code(),
            Self::Internal { .. } => "INTERNAL",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation { .. } => 422,
            Self::NotFound { .. } => 404,
            Self::AlreadyExists { .. } => 409,
            Self::Rejected(rejection) => rejection.status_code(),
            Self::Internal { .. } => 500,
        }
    }
}

impl Display for AttendanceError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation { message } => write!(f, "invalid request: {}", message),
            Self::NotFound { resource } => write!(f, "not found: {}", resource),
            Self::AlreadyExists { session_id } => {
                write!(f, "session {} already exists", session_id)
            }
            Self::Rejected(rejection) => write!(f, "{}", rejection),
            Self::Internal { message } => write!(f, "internal error: {}", message),
        }
    }
}

impl std::error::Error for AttendanceError {}

impl From<RedeemRejection> for AttendanceError {
    fn from(rejection: RedeemRejection) -> Self {
        Self::Rejected(rejection)
    }
}

#[cfg(test)]
#[path = "tests/errors_tests.rs"]
mod tests;
