use super::*;
use crate::domain::{Geofence, RedemptionPolicy};
use crate::registry::session_store::NewSession;
use chrono::{Duration, TimeZone};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 6, 9, 0, 0).unwrap()
}

/// Point `meters` east of (0, 0) along the equator.
fn east_of_origin(meters: f64) -> Coordinates {
    let meters_per_degree = crate::domain::geo::EARTH_RADIUS_M * std::f64::consts::PI / 180.0;
    Coordinates::new(0.0, meters / meters_per_degree)
}

struct Fixture {
    store: Arc<SessionStore>,
    ledger: Arc<DeviceLedger>,
    broadcaster: Arc<EventBroadcaster>,
    validator: RedemptionValidator,
}

impl Fixture {
    fn new() -> Self {
        let store = Arc::new(SessionStore::new());
        let ledger = Arc::new(DeviceLedger::new());
        let broadcaster = Arc::new(EventBroadcaster::new(16));
        let validator = RedemptionValidator::new(
            store.clone(),
            ledger.clone(),
            broadcaster.clone(),
            RedemptionPolicy::default(),
        );
        Self {
            store,
            ledger,
            broadcaster,
            validator,
        }
    }

    async fn session(&self, id: &str, fenced: bool) {
        let geofence = fenced.then(|| Geofence::new(Coordinates::new(0.0, 0.0), 50.0));
        let new = NewSession {
            session_id: id.to_string(),
            owner_id: "faculty-7".to_string(),
            class_id: "CS101".to_string(),
            section: "A".to_string(),
            geofence,
        };
        drop(self.store.create(new, t0()).await.unwrap());
    }

    async fn redeem(
        &self,
        request: RedemptionRequest,
        at: DateTime<Utc>,
    ) -> Result<RedeemReceipt, RedeemRejection> {
        self.validator.redeem(request, at).await
    }
}

fn credential(session_id: &str, issued_at: DateTime<Utc>) -> Credential {
    Credential::issue(session_id, "faculty-7", "CS101", issued_at, Duration::seconds(120))
}

fn request(session_id: &str, credential: &Credential, device: &str) -> RedemptionRequest {
    RedemptionRequest {
        session_id: session_id.to_string(),
        credential: credential.clone(),
        device_id: device.to_string(),
        subject_id: "2305501".to_string(),
        reported_ip: Some("10.0.0.5".to_string()),
        reported_location: Some(east_of_origin(10.0)),
    }
}

#[tokio::test]
async fn test_successful_redemption_commits_everywhere() {
    let fx = Fixture::new();
    fx.session("s1", true).await;
    let mut events = fx.broadcaster.register("s1", 1, None).await.events;
    let n1 = credential("s1", t0());

    let receipt = fx.redeem(request("s1", &n1, "d1"), t0()).await.unwrap();

    assert_eq!(receipt.device_count, 1);
    assert_eq!(receipt.sequence, 1);
    assert_eq!(receipt.record.credential_id, n1.nonce);
    assert!(fx.store.credential_used("s1", &n1.nonce).await.unwrap());
    assert_eq!(fx.ledger.last_redemption("d1").await.unwrap().session_id, "s1");

    let envelope = events.recv().await.unwrap();
    assert_eq!(
        envelope.event,
        SessionEvent::Redeemed {
            device_count: 1,
            record: receipt.record
        }
    );
}

#[tokio::test]
async fn test_unknown_session() {
    let fx = Fixture::new();
    let n1 = credential("ghost", t0());
    let err = fx.redeem(request("ghost", &n1, "d1"), t0()).await.unwrap_err();
    assert_eq!(err, RedeemRejection::SessionNotFound);
}

#[tokio::test]
async fn test_inactive_outranks_used_credential() {
    let fx = Fixture::new();
    fx.session("s1", true).await;
    let n1 = credential("s1", t0());
    fx.redeem(request("s1", &n1, "d1"), t0()).await.unwrap();
    drop(fx.store.end("s1", t0()).await.unwrap());

    let err = fx.redeem(request("s1", &n1, "d2"), t0()).await.unwrap_err();
    assert_eq!(err, RedeemRejection::SessionInactive);
}

#[tokio::test]
async fn test_used_credential_outranks_expiry() {
    let fx = Fixture::new();
    fx.session("s1", true).await;
    let n1 = credential("s1", t0());
    fx.redeem(request("s1", &n1, "d1"), t0()).await.unwrap();

    let late = t0() + Duration::minutes(10);
    let err = fx.redeem(request("s1", &n1, "d2"), late).await.unwrap_err();
    assert_eq!(err, RedeemRejection::CredentialAlreadyUsed);
}

#[tokio::test]
async fn test_expiry_outranks_device_checks() {
    let fx = Fixture::new();
    fx.session("s1", true).await;
    fx.redeem(request("s1", &credential("s1", t0()), "d1"), t0())
        .await
        .unwrap();

    let stale = credential("s1", t0());
    let at = t0() + Duration::seconds(121);
    let err = fx.redeem(request("s1", &stale, "d1"), at).await.unwrap_err();
    assert_eq!(err, RedeemRejection::CredentialExpired);

    let at = t0() + Duration::seconds(120);
    let err = fx.redeem(request("s1", &stale, "d1"), at).await.unwrap_err();
    assert_eq!(err, RedeemRejection::DeviceAlreadyRedeemed);
}

#[tokio::test]
async fn test_future_dated_credential_is_rejected_without_side_effects() {
    let fx = Fixture::new();
    fx.session("s1", false).await;

    let ahead = credential("s1", t0() + Duration::days(365));
    let err = fx.redeem(request("s1", &ahead, "d1"), t0()).await.unwrap_err();
    assert_eq!(err, RedeemRejection::CredentialExpired);

    let mut unbounded = credential("s1", t0());
    unbounded.issued_at = DateTime::<Utc>::MAX_UTC - Duration::seconds(1);
    let err = fx.redeem(request("s1", &unbounded, "d2"), t0()).await.unwrap_err();
    assert_eq!(err, RedeemRejection::CredentialExpired);

    assert!(!fx.store.credential_used("s1", ahead.id()).await.unwrap());
    assert!(fx.ledger.last_redemption("d1").await.is_none());

    let fresh = credential("s1", t0());
    fx.redeem(request("s1", &fresh, "d1"), t0()).await.unwrap();
}

#[tokio::test]
async fn test_cooldown_boundary_across_sessions() {
    let fx = Fixture::new();
    fx.session("s1", false).await;
    fx.session("s2", false).await;
    fx.redeem(request("s1", &credential("s1", t0()), "d1"), t0())
        .await
        .unwrap();

    let almost = t0() + Duration::minutes(49) + Duration::seconds(59);
    let err = fx
        .redeem(request("s2", &credential("s2", almost), "d1"), almost)
        .await
        .unwrap_err();
    assert_eq!(err, RedeemRejection::DeviceCoolingDown { remaining_secs: 1 });

    let exactly = t0() + Duration::minutes(50);
    let receipt = fx
        .redeem(request("s2", &credential("s2", exactly), "d1"), exactly)
        .await
        .unwrap();
    assert_eq!(receipt.device_count, 1);
    assert_eq!(fx.ledger.last_redemption("d1").await.unwrap().session_id, "s2");
}

#[tokio::test]
async fn test_cooldown_outranks_geofence() {
    let fx = Fixture::new();
    fx.session("s1", false).await;
    fx.session("s2", true).await;
    fx.redeem(request("s1", &credential("s1", t0()), "d1"), t0())
        .await
        .unwrap();

    let mut far = request("s2", &credential("s2", t0()), "d1");
    far.reported_location = Some(east_of_origin(500.0));
    let err = fx.redeem(far, t0()).await.unwrap_err();
    assert!(matches!(err, RedeemRejection::DeviceCoolingDown { .. }));
}

#[tokio::test]
async fn test_geofence_boundary() {
    let fx = Fixture::new();
    fx.session("s1", true).await;

    let mut inside = request("s1", &credential("s1", t0()), "d1");
    inside.reported_location = Some(east_of_origin(49.9));
    assert!(fx.redeem(inside, t0()).await.is_ok());

    let mut outside = request("s1", &credential("s1", t0()), "d2");
    outside.reported_location = Some(east_of_origin(50.1));
    let err = fx.redeem(outside, t0()).await.unwrap_err();
    assert_eq!(err, RedeemRejection::OutOfRange { distance_m: 50 });
}

#[tokio::test]
async fn test_fenced_session_requires_location() {
    let fx = Fixture::new();
    fx.session("s1", true).await;

    let mut blind = request("s1", &credential("s1", t0()), "d1");
    blind.reported_location = None;
    let err = fx.redeem(blind, t0()).await.unwrap_err();
    assert_eq!(err, RedeemRejection::LocationRequired);
}

#[tokio::test]
async fn test_unfenced_session_ignores_location() {
    let fx = Fixture::new();
    fx.session("s1", false).await;

    let mut anywhere = request("s1", &credential("s1", t0()), "d1");
    anywhere.reported_location = None;
    assert!(fx.redeem(anywhere, t0()).await.is_ok());
}

#[tokio::test]
async fn test_rejection_has_no_side_effects() {
    let fx = Fixture::new();
    fx.session("s1", true).await;
    let n1 = credential("s1", t0());

    let mut far = request("s1", &n1, "d1");
    far.reported_location = Some(east_of_origin(80.0));
    assert!(fx.redeem(far, t0()).await.is_err());

    assert!(!fx.store.credential_used("s1", &n1.nonce).await.unwrap());
    assert!(fx.ledger.last_redemption("d1").await.is_none());
    assert_eq!(fx.broadcaster.last_sequence("s1").await, 0);
    assert!(fx.redeem(request("s1", &n1, "d1"), t0()).await.is_ok());
}
