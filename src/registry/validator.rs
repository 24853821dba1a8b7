//! Redemption Validator: the ordered rule chain and the atomic commit.
//!
//! A redemption holds its session's lock from the existence check until its
//! `Redeemed` event is published, and the device's ledger slot from the
//! cooldown check until the ledger write. Every rejection returns before the
//! first write, so a failed attempt leaves no trace.

use crate::domain::{
    Coordinates, Credential, RedeemReceipt, RedeemRejection, RedemptionPolicy, RedemptionRecord,
    SessionEvent,
};
use crate::registry::broadcaster::EventBroadcaster;
use crate::registry::device_ledger::{ceil_secs, cooldown_remaining, DeviceLedger};
use crate::registry::session_store::SessionStore;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info};

/// A redemption attempt with its credential already decoded.
#[derive(Debug, Clone, PartialEq)]
pub struct RedemptionRequest {
    pub session_id: String,
    pub credential: Credential,
    pub device_id: String,
    pub subject_id: String,
    pub reported_ip: Option<String>,
    pub reported_location: Option<Coordinates>,
}

pub struct RedemptionValidator {
    store: Arc<SessionStore>,
    ledger: Arc<DeviceLedger>,
    broadcaster: Arc<EventBroadcaster>,
    policy: RedemptionPolicy,
}

impl RedemptionValidator {
    pub fn new(
        store: Arc<SessionStore>,
        ledger: Arc<DeviceLedger>,
        broadcaster: Arc<EventBroadcaster>,
        policy: RedemptionPolicy,
    ) -> Self {
        Self {
            store,
            ledger,
            broadcaster,
            policy,
        }
    }

    pub async fn redeem(
        &self,
        request: RedemptionRequest,
        now: DateTime<Utc>,
    ) -> Result<RedeemReceipt, RedeemRejection> {
        let session_id = request.session_id.clone();
        let device_id = request.device_id.clone();
        let result = self.evaluate_and_commit(request, now).await;
        if let Err(rejection) = &result {
            debug!(
                session_id = %session_id,
                device_id = %device_id,
                reason = rejection.reason_code(),
                "redemption rejected"
            );
        }
        result
    }

    async fn evaluate_and_commit(
        &self,
        request: RedemptionRequest,
        now: DateTime<Utc>,
    ) -> Result<RedeemReceipt, RedeemRejection> {
        let mut session = self
            .store
            .lock(&request.session_id)
            .await
            .ok_or(RedeemRejection::SessionNotFound)?;

        if !session.is_active() {
            return Err(RedeemRejection::SessionInactive);
        }
        if session.is_consumed(request.credential.id()) {
            return Err(RedeemRejection::CredentialAlreadyUsed);
        }
        if request.credential.is_expired(now, self.policy.credential_ttl) {
            return Err(RedeemRejection::CredentialExpired);
        }
        if session.has_device(&request.device_id) {
            return Err(RedeemRejection::DeviceAlreadyRedeemed);
        }

        let mut device = self.ledger.lock(&request.device_id).await;
        if let Some(entry) = &*device {
            if let Some(remaining) =
                cooldown_remaining(entry, &request.session_id, now, self.policy.device_cooldown)
            {
                return Err(RedeemRejection::DeviceCoolingDown {
                    remaining_secs: ceil_secs(remaining),
                });
            }
        }

        if let Some(fence) = session.geofence() {
            let location = request
                .reported_location
                .ok_or(RedeemRejection::LocationRequired)?;
            if !fence.contains(location) {
                return Err(RedeemRejection::OutOfRange {
                    distance_m: fence.distance_to(location).round() as u64,
                });
            }
        }

        let record = RedemptionRecord {
            device_id: request.device_id,
            session_id: request.session_id,
            subject_id: request.subject_id,
            committed_at: now,
            reported_ip: request.reported_ip,
            reported_location: request.reported_location,
            credential_id: request.credential.nonce,
        };
        let device_count = session.append_redemption(record.clone());
        DeviceLedger::record_redemption(&mut device, &record.session_id, now);
        drop(device);

        info!(
            session_id = %record.session_id,
            device_id = %record.device_id,
            subject_id = %record.subject_id,
            device_count,
            "redemption committed"
        );

        let envelope = self
            .broadcaster
            .publish(
                &record.session_id,
                SessionEvent::Redeemed {
                    device_count,
                    record: record.clone(),
                },
                now,
            )
            .await;
        drop(session);

        Ok(RedeemReceipt {
            session_id: record.session_id.clone(),
            device_count,
            sequence: envelope.sequence,
            record,
        })
    }
}

#[cfg(test)]
#[path = "tests/validator_tests.rs"]
mod tests;
