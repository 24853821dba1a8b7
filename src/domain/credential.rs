//! One-time credentials ("QR payloads").
//!
//! A credential is a capability token, not a stored entity: the registry keeps
//! only the set of consumed nonces per session. Its issuance time travels
//! inside the payload, so the validator needs no credential registry.

use crate::domain::errors::AttendanceError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Number of random bytes in a nonce (rendered as twice as many hex chars).
const NONCE_BYTES: usize = 16;

/// How far `issued_at` may run ahead of the validating clock.
pub const MAX_ISSUE_SKEW_SECS: i64 = 30;

/// Decoded credential payload.
///
/// Serialized as camelCase JSON with epoch-millisecond timestamps, which is
/// what the presenter console encodes into the QR image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    pub session_id: String,
    pub owner_id: String,
    pub class_id: String,
    pub nonce: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub issued_at: DateTime<Utc>,
    /// Informational only: expiry is always recomputed from `issued_at`.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub expires_at: DateTime<Utc>,
}

/// A freshly minted credential together with its encoded payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuedCredential {
    pub credential: Credential,
    pub payload: String,
}

impl Credential {
    /// Mints a credential with a random nonce for the given session.
    pub fn issue(
        session_id: &str,
        owner_id: &str,
        class_id: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Self {
        Self {
            session_id: session_id.to_string(),
            owner_id: owner_id.to_string(),
            class_id: class_id.to_string(),
            nonce: generate_nonce(),
            issued_at: now,
            expires_at: now + ttl,
        }
    }

    /// The credential id consumed on redemption.
    pub fn id(&self) -> &str {
        &self.nonce
    }

    /// Expired strictly after `issued_at + ttl`; the last instant still counts.
    ///
    /// A payload issued more than [`MAX_ISSUE_SKEW_SECS`] in the future, or
    /// one whose expiry is not representable, counts as expired.
    pub fn is_expired(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        let skew = Duration::seconds(MAX_ISSUE_SKEW_SECS);
        let issued_in_future = now
            .checked_add_signed(skew)
            .is_some_and(|latest| self.issued_at > latest);
        if issued_in_future {
            return true;
        }
        match self.issued_at.checked_add_signed(ttl) {
            Some(expires_at) => now > expires_at,
            None => true,
        }
    }

    /// Encodes the credential as base64(JSON).
    pub fn encode(&self) -> Result<String, AttendanceError> {
        let json = serde_json::to_vec(self).map_err(|e| AttendanceError::Internal {
            message: format!("failed to serialize credential: {}", e),
        })?;
        Ok(STANDARD.encode(json))
    }

    /// Decodes a payload produced by [`Credential::encode`].
    pub fn decode(payload: &str) -> Result<Self, AttendanceError> {
        let bytes = STANDARD
            .decode(payload.trim())
            .map_err(|e| AttendanceError::validation(format!("malformed QR payload: {}", e)))?;
        let credential: Credential = serde_json::from_slice(&bytes)
            .map_err(|e| AttendanceError::validation(format!("malformed QR payload: {}", e)))?;
        if credential.nonce.is_empty() {
            return Err(AttendanceError::validation("QR payload carries no nonce"));
        }
        Ok(credential)
    }

    /// Mints a credential and encodes it in one step.
    pub fn issue_encoded(
        session_id: &str,
        owner_id: &str,
        class_id: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<IssuedCredential, AttendanceError> {
        let credential = Self::issue(session_id, owner_id, class_id, now, ttl);
        let payload = credential.encode()?;
        Ok(IssuedCredential {
            credential,
            payload,
        })
    }
}

/// 16 random bytes as lowercase hex.
fn generate_nonce() -> String {
    let bytes: [u8; NONCE_BYTES] = rand::thread_rng().gen();
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
#[path = "tests/credential_tests.rs"]
mod tests;
