//! `AttendanceCore`: the operations the session API exposes, on top of the
//! store, ledger, validator and broadcaster.
//!
//! Input validation lives here so the components below can assume
//! well-formed identifiers and coordinates.

use crate::domain::{
    AttendanceError, Coordinates, CreateSessionRequest, Credential, DevicePrecheck, Geofence,
    HealthReport, IssuedCredential, RedeemReceipt, RedeemRejection, RedeemRequest,
    RedemptionPolicy, RedemptionRecord, SessionEvent, SessionEventEnvelope, SessionSnapshot,
    SessionStats,
};
use crate::registry::broadcaster::{EventBroadcaster, SubscriberId};
use crate::registry::device_ledger::DeviceLedger;
use crate::registry::session_store::{NewSession, SessionStore};
use crate::registry::validator::{RedemptionRequest, RedemptionValidator};
use chrono::{DateTime, Utc};
use rand::Rng;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info};

const SESSION_SUFFIX_LEN: usize = 7;
const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// What a subscriber gets back from [`AttendanceCore::subscribe`].
#[derive(Debug)]
pub struct SessionSubscription {
    /// `None` when the session does not exist yet.
    pub snapshot: Option<SessionSnapshot>,
    pub last_sequence: u64,
    pub missed: Option<Vec<SessionEventEnvelope>>,
    pub events: UnboundedReceiver<SessionEventEnvelope>,
}

pub struct AttendanceCore {
    store: Arc<SessionStore>,
    ledger: Arc<DeviceLedger>,
    broadcaster: Arc<EventBroadcaster>,
    validator: RedemptionValidator,
    policy: RedemptionPolicy,
}

impl AttendanceCore {
    pub fn new(policy: RedemptionPolicy, event_backlog: usize) -> Self {
        let store = Arc::new(SessionStore::new());
        let ledger = Arc::new(DeviceLedger::new());
        let broadcaster = Arc::new(EventBroadcaster::new(event_backlog));
        let validator =
            RedemptionValidator::new(store.clone(), ledger.clone(), broadcaster.clone(), policy);
        Self {
            store,
            ledger,
            broadcaster,
            validator,
            policy,
        }
    }

    pub async fn create_session(
        &self,
        request: CreateSessionRequest,
        now: DateTime<Utc>,
    ) -> Result<SessionSnapshot, AttendanceError> {
        if let Some(id) = &request.session_id {
            require("session_id", id)?;
        }
        require("owner_id", &request.owner_id)?;
        require("class_id", &request.class_id)?;
        if let Some(center) = request.geofence_center {
            require_coordinates("geofence_center", center)?;
        }

        let session_id = request
            .session_id
            .unwrap_or_else(|| generate_session_id(now));
        let new = NewSession {
            session_id: session_id.clone(),
            owner_id: request.owner_id,
            class_id: request.class_id,
            section: request.section,
            geofence: request
                .geofence_center
                .map(|center| Geofence::new(center, self.policy.geofence_radius_m)),
        };

        let session = self.store.create(new, now).await?;
        let snapshot = session.snapshot();
        self.broadcaster
            .publish(
                &session_id,
                SessionEvent::SessionCreated {
                    snapshot: Box::new(snapshot.clone()),
                },
                now,
            )
            .await;
        drop(session);

        info!(
            session_id = %session_id,
            owner_id = %snapshot.owner_id,
            fenced = snapshot.geofence.is_some(),
            "session created"
        );
        Ok(snapshot)
    }

    pub async fn get_session(&self, session_id: &str) -> Result<SessionSnapshot, AttendanceError> {
        self.store.get(session_id).await
    }

    /// Ends a session; ending an ended session returns its snapshot unchanged
    /// and publishes nothing.
    pub async fn end_session(
        &self,
        session_id: &str,
        now: DateTime<Utc>,
    ) -> Result<SessionSnapshot, AttendanceError> {
        let (session, ended) = self.store.end(session_id, now).await?;
        if ended {
            self.broadcaster
                .publish(session_id, SessionEvent::SessionEnded { ended_at: now }, now)
                .await;
            info!(
                session_id,
                device_count = session.device_count(),
                "session ended"
            );
        }
        Ok(session.snapshot())
    }

    pub async fn issue_credential(
        &self,
        session_id: &str,
        now: DateTime<Utc>,
    ) -> Result<IssuedCredential, AttendanceError> {
        let session = self
            .store
            .lock(session_id)
            .await
            .ok_or_else(|| AttendanceError::session_not_found(session_id))?;
        if !session.is_active() {
            return Err(RedeemRejection::SessionInactive.into());
        }
        Credential::issue_encoded(
            session.session_id(),
            session.owner_id(),
            session.class_id(),
            now,
            self.policy.credential_ttl,
        )
    }

    pub async fn redeem(
        &self,
        request: RedemptionRequest,
        now: DateTime<Utc>,
    ) -> Result<RedeemReceipt, AttendanceError> {
        require("session_id", &request.session_id)?;
        require("credential nonce", &request.credential.nonce)?;
        require("device_id", &request.device_id)?;
        require("subject_id", &request.subject_id)?;
        if let Some(location) = request.reported_location {
            require_coordinates("reported_location", location)?;
        }
        if request.credential.session_id != request.session_id {
            return Err(AttendanceError::validation(
                "QR code belongs to a different session",
            ));
        }
        self.validator
            .redeem(request, now)
            .await
            .map_err(AttendanceError::from)
    }

    /// Decodes a scanned payload and redeems it.
    pub async fn redeem_payload(
        &self,
        request: RedeemRequest,
        now: DateTime<Utc>,
    ) -> Result<RedeemReceipt, AttendanceError> {
        let credential = Credential::decode(&request.credential_payload)?;
        self.redeem(
            RedemptionRequest {
                session_id: request.session_id,
                credential,
                device_id: request.device_id,
                subject_id: request.subject_id,
                reported_ip: request.reported_ip,
                reported_location: request.reported_location,
            },
            now,
        )
        .await
    }

    /// Advisory only; a later redemption may still be rejected.
    pub async fn precheck(
        &self,
        session_id: &str,
        device_id: &str,
        now: DateTime<Utc>,
    ) -> Result<DevicePrecheck, AttendanceError> {
        require("device_id", device_id)?;
        {
            let session = self
                .store
                .lock(session_id)
                .await
                .ok_or_else(|| AttendanceError::session_not_found(session_id))?;
            if !session.is_active() {
                return Ok(DevicePrecheck::denied(RedeemRejection::SessionInactive));
            }
            if session.has_device(device_id) {
                return Ok(DevicePrecheck::denied(
                    RedeemRejection::DeviceAlreadyRedeemed,
                ));
            }
        }
        Ok(self
            .ledger
            .precheck(device_id, session_id, now, self.policy.device_cooldown)
            .await)
    }

    pub async fn credential_used(
        &self,
        session_id: &str,
        credential_id: &str,
    ) -> Result<bool, AttendanceError> {
        require("credential_id", credential_id)?;
        self.store.credential_used(session_id, credential_id).await
    }

    pub async fn session_stats(
        &self,
        session_id: &str,
        now: DateTime<Utc>,
    ) -> Result<SessionStats, AttendanceError> {
        let session = self
            .store
            .lock(session_id)
            .await
            .ok_or_else(|| AttendanceError::session_not_found(session_id))?;
        let until = session.ended_at().unwrap_or(now);
        Ok(SessionStats {
            session_id: session.session_id().to_string(),
            active: session.is_active(),
            redemption_count: session.redemptions().len(),
            unique_devices: session.device_count(),
            duration_secs: (until - session.created_at()).num_seconds().max(0),
        })
    }

    /// Redemptions in commit order.
    pub async fn session_devices(
        &self,
        session_id: &str,
    ) -> Result<Vec<RedemptionRecord>, AttendanceError> {
        let session = self
            .store
            .lock(session_id)
            .await
            .ok_or_else(|| AttendanceError::session_not_found(session_id))?;
        Ok(session.redemptions().to_vec())
    }

    /// Registers a subscriber and captures the session snapshot in the same
    /// critical section, so no event falls between the two.
    pub async fn subscribe(
        &self,
        session_id: &str,
        subscriber: SubscriberId,
        since: Option<u64>,
    ) -> Result<SessionSubscription, AttendanceError> {
        require("session_id", session_id)?;
        let (sessions, session) = self.store.lock_pinned(session_id).await;
        let snapshot = session.as_ref().map(|s| s.snapshot());
        let registration = self.broadcaster.register(session_id, subscriber, since).await;
        drop(session);
        drop(sessions);
        let listeners = self.broadcaster.subscriber_count(session_id).await;
        debug!(
            session_id,
            subscriber,
            since = ?since,
            replayed = registration.missed.is_some(),
            listeners,
            "subscriber registered"
        );

        Ok(SessionSubscription {
            snapshot,
            last_sequence: registration.last_sequence,
            missed: registration.missed,
            events: registration.events,
        })
    }

    pub async fn unsubscribe(&self, session_id: &str, subscriber: SubscriberId) -> bool {
        self.broadcaster.unsubscribe(session_id, subscriber).await
    }

    pub async fn drop_subscriber(&self, subscriber: SubscriberId) -> usize {
        self.broadcaster.drop_subscriber(subscriber).await
    }

    pub fn health(&self, now: DateTime<Utc>) -> HealthReport {
        HealthReport {
            status: "ok".to_string(),
            active_session_count: self.store.active_count(),
            server_time: now,
            build_sha: crate::BUILD_SHA.to_string(),
        }
    }
}

fn require(field: &str, value: &str) -> Result<(), AttendanceError> {
    if value.trim().is_empty() {
        return Err(AttendanceError::validation(format!("{} is required", field)));
    }
    Ok(())
}

fn require_coordinates(field: &str, point: Coordinates) -> Result<(), AttendanceError> {
    if !point.is_valid() {
        return Err(AttendanceError::validation(format!(
            "{} must have latitude in [-90, 90] and longitude in [-180, 180]",
            field
        )));
    }
    Ok(())
}

/// `session_<epoch-ms>_<7 base36 chars>`.
pub fn generate_session_id(now: DateTime<Utc>) -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..SESSION_SUFFIX_LEN)
        .map(|_| BASE36[rng.gen_range(0..BASE36.len())] as char)
        .collect();
    format!("session_{}_{}", now.timestamp_millis(), suffix)
}

#[cfg(test)]
#[path = "tests/service_tests.rs"]
mod tests;
