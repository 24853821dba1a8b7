use super::*;
use chrono::{Duration, TimeZone};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 6, 9, 0, 0).unwrap()
}

fn core() -> AttendanceCore {
    AttendanceCore::new(RedemptionPolicy::default(), 16)
}

fn create_request(id: Option<&str>, center: Option<Coordinates>) -> CreateSessionRequest {
    CreateSessionRequest {
        session_id: id.map(str::to_string),
        owner_id: "faculty-7".to_string(),
        class_id: "CS101".to_string(),
        section: "A".to_string(),
        geofence_center: center,
    }
}

fn redeem_request(
    session_id: &str,
    issued: &IssuedCredential,
    device: &str,
    location: Option<Coordinates>,
) -> RedeemRequest {
    RedeemRequest {
        session_id: session_id.to_string(),
        credential_payload: issued.payload.clone(),
        device_id: device.to_string(),
        subject_id: "2305501".to_string(),
        reported_ip: None,
        reported_location: location,
    }
}

#[tokio::test]
async fn test_end_to_end_classroom_scenario() {
    let core = core();
    let center = Coordinates::new(12.9716, 77.5946);
    let nearby = Coordinates::new(12.9716 + 0.0000899, 77.5946);
    let s = create_request(Some("S"), Some(center));
    core.create_session(s, t0()).await.unwrap();

    let n1 = core.issue_credential("S", t0()).await.unwrap();
    let receipt = core
        .redeem_payload(redeem_request("S", &n1, "d1", Some(nearby)), t0())
        .await
        .unwrap();
    assert_eq!(receipt.device_count, 1);

    let n2 = core.issue_credential("S", t0()).await.unwrap();
    let err = core
        .redeem_payload(redeem_request("S", &n2, "d1", Some(nearby)), t0())
        .await
        .unwrap_err();
    assert_eq!(err, AttendanceError::from(RedeemRejection::DeviceAlreadyRedeemed));

    let err = core
        .redeem_payload(redeem_request("S", &n1, "d2", Some(nearby)), t0())
        .await
        .unwrap_err();
    assert_eq!(err, AttendanceError::from(RedeemRejection::CredentialAlreadyUsed));

    let fresh = core.issue_credential("S", t0()).await.unwrap();
    core.end_session("S", t0()).await.unwrap();
    let err = core
        .redeem_payload(redeem_request("S", &fresh, "d3", Some(nearby)), t0())
        .await
        .unwrap_err();
    assert_eq!(err, AttendanceError::from(RedeemRejection::SessionInactive));
    assert_eq!(err.reason_code(), "SESSION_INACTIVE");
}

#[tokio::test]
async fn test_create_generates_id_and_applies_radius() {
    let core = core();
    let center = Coordinates::new(12.9716, 77.5946);
    let snapshot = core
        .create_session(create_request(None, Some(center)), t0())
        .await
        .unwrap();

    let prefix = format!("session_{}_", t0().timestamp_millis());
    assert!(snapshot.session_id.starts_with(&prefix));
    assert_eq!(snapshot.session_id.len(), prefix.len() + 7);
    assert_eq!(snapshot.geofence.unwrap().radius_m, 50.0);
    assert_eq!(core.health(t0()).active_session_count, 1);
}

#[tokio::test]
async fn test_create_validates_input() {
    let core = core();

    let mut missing_owner = create_request(Some("s1"), None);
    missing_owner.owner_id = "  ".to_string();
    let err = core.create_session(missing_owner, t0()).await.unwrap_err();
    assert_eq!(err.reason_code(), "VALIDATION_ERROR");

    let bad_fence = create_request(Some("s1"), Some(Coordinates::new(91.0, 0.0)));
    assert!(core.create_session(bad_fence, t0()).await.is_err());

    core.create_session(create_request(Some("s1"), None), t0())
        .await
        .unwrap();
    let err = core
        .create_session(create_request(Some("s1"), None), t0())
        .await
        .unwrap_err();
    assert_eq!(err.reason_code(), "ALREADY_EXISTS");
}

#[tokio::test]
async fn test_end_twice_is_noop_and_publishes_once() {
    let core = core();
    core.create_session(create_request(Some("s1"), None), t0())
        .await
        .unwrap();
    let mut sub = core.subscribe("s1", 1, None).await.unwrap();
    assert_eq!(sub.last_sequence, 1);

    let first = core.end_session("s1", t0() + Duration::minutes(5)).await.unwrap();
    let second = core.end_session("s1", t0() + Duration::minutes(9)).await.unwrap();
    assert_eq!(first, second);
    assert!(!second.active);

    let envelope = sub.events.recv().await.unwrap();
    assert_eq!(envelope.sequence, 2);
    assert_eq!(envelope.event.name(), "session_ended");
    assert!(sub.events.try_recv().is_err());

    assert!(core.end_session("ghost", t0()).await.is_err());
}

#[tokio::test]
async fn test_issue_credential_requires_active_session() {
    let core = core();
    let err = core.issue_credential("ghost", t0()).await.unwrap_err();
    assert_eq!(err.reason_code(), "NOT_FOUND");

    core.create_session(create_request(Some("s1"), None), t0())
        .await
        .unwrap();
    let issued = core.issue_credential("s1", t0()).await.unwrap();
    assert_eq!(issued.credential.expires_at, t0() + Duration::seconds(120));
    assert_eq!(issued.credential.class_id, "CS101");

    core.end_session("s1", t0()).await.unwrap();
    let err = core.issue_credential("s1", t0()).await.unwrap_err();
    assert_eq!(err, AttendanceError::from(RedeemRejection::SessionInactive));
}

#[tokio::test]
async fn test_redeem_rejects_credential_for_other_session() {
    let core = core();
    core.create_session(create_request(Some("s1"), None), t0())
        .await
        .unwrap();
    core.create_session(create_request(Some("s2"), None), t0())
        .await
        .unwrap();
    let for_s2 = core.issue_credential("s2", t0()).await.unwrap();

    let err = core
        .redeem_payload(redeem_request("s1", &for_s2, "d1", None), t0())
        .await
        .unwrap_err();
    assert_eq!(err.reason_code(), "VALIDATION_ERROR");

    let mut garbage = redeem_request("s1", &for_s2, "d1", None);
    garbage.credential_payload = "%%%".to_string();
    let err = core.redeem_payload(garbage, t0()).await.unwrap_err();
    assert_eq!(err.reason_code(), "VALIDATION_ERROR");
}

#[tokio::test]
async fn test_precheck_follows_session_and_ledger() {
    let core = core();
    core.create_session(create_request(Some("s1"), None), t0())
        .await
        .unwrap();
    core.create_session(create_request(Some("s2"), None), t0())
        .await
        .unwrap();
    let n1 = core.issue_credential("s1", t0()).await.unwrap();
    core.redeem_payload(redeem_request("s1", &n1, "d1", None), t0())
        .await
        .unwrap();

    let same = core.precheck("s1", "d1", t0()).await.unwrap();
    assert_eq!(same.reason, Some(RedeemRejection::DeviceAlreadyRedeemed));

    let other = core
        .precheck("s2", "d1", t0() + Duration::minutes(20))
        .await
        .unwrap();
    assert!(!other.allowed);
    assert_eq!(other.remaining_secs, Some(30 * 60));

    assert!(core.precheck("s2", "d2", t0()).await.unwrap().allowed);
    assert!(core.precheck("ghost", "d2", t0()).await.is_err());
}

#[tokio::test]
async fn test_stats_devices_and_credential_used() {
    let core = core();
    core.create_session(create_request(Some("s1"), None), t0())
        .await
        .unwrap();
    for device in ["d1", "d2"] {
        let issued = core.issue_credential("s1", t0()).await.unwrap();
        core.redeem_payload(redeem_request("s1", &issued, device, None), t0())
            .await
            .unwrap();
        assert!(core
            .credential_used("s1", &issued.credential.nonce)
            .await
            .unwrap());
    }
    core.end_session("s1", t0() + Duration::minutes(50))
        .await
        .unwrap();

    let stats = core
        .session_stats("s1", t0() + Duration::hours(3))
        .await
        .unwrap();
    assert_eq!(stats.redemption_count, 2);
    assert_eq!(stats.unique_devices, 2);
    assert_eq!(stats.duration_secs, 50 * 60);
    assert!(!stats.active);

    let devices = core.session_devices("s1").await.unwrap();
    let order: Vec<&str> = devices.iter().map(|r| r.device_id.as_str()).collect();
    assert_eq!(order, vec!["d1", "d2"]);
    assert!(!core.credential_used("s1", "never-issued").await.unwrap());
}

#[tokio::test]
async fn test_subscribe_before_creation_sees_created_event() {
    let core = core();
    let mut sub = core.subscribe("later", 3, None).await.unwrap();
    assert!(sub.snapshot.is_none());
    assert_eq!(sub.last_sequence, 0);

    core.create_session(create_request(Some("later"), None), t0())
        .await
        .unwrap();

    let envelope = sub.events.recv().await.unwrap();
    assert_eq!(envelope.sequence, 1);
    match envelope.event {
        SessionEvent::SessionCreated { snapshot } => assert_eq!(snapshot.session_id, "later"),
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test]
async fn test_resubscribe_with_since_replays_missed_events() {
    let core = core();
    core.create_session(create_request(Some("s1"), None), t0())
        .await
        .unwrap();
    let first = core.subscribe("s1", 1, None).await.unwrap();
    drop(first);
    assert_eq!(core.drop_subscriber(1).await, 1);

    for device in ["d1", "d2"] {
        let issued = core.issue_credential("s1", t0()).await.unwrap();
        core.redeem_payload(redeem_request("s1", &issued, device, None), t0())
            .await
            .unwrap();
    }

    let again = core.subscribe("s1", 1, Some(1)).await.unwrap();
    let snapshot = again.snapshot.unwrap();
    assert_eq!(snapshot.redemptions.len(), 2);
    assert_eq!(again.last_sequence, 3);
    let missed: Vec<u64> = again.missed.unwrap().iter().map(|e| e.sequence).collect();
    assert_eq!(missed, vec![2, 3]);
    assert!(core.unsubscribe("s1", 1).await);
}
