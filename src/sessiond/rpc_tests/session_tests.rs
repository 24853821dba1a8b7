//! Session lifecycle over RPC.

use super::*;
use crate::domain::AttendanceError;

#[tokio::test]
async fn test_health_on_fresh_daemon() {
    let server = TestServer::start().await;
    let client = server.create_client().await;

    let health = client.health().await.unwrap();
    assert_eq!(health.status, "ok");
    assert_eq!(health.active_session_count, 0);
    assert_eq!(health.build_sha, crate::BUILD_SHA);
}

#[tokio::test]
async fn test_create_get_end_session() {
    let server = TestServer::start().await;
    let client = server.create_client().await;

    let created = client.create_session(create_request("rpc-1")).await.unwrap();
    assert!(created.active);
    assert_eq!(created.geofence.unwrap().radius_m, 50.0);

    let fetched = client.get_session("rpc-1").await.unwrap();
    assert_eq!(fetched, created);
    assert_eq!(client.health().await.unwrap().active_session_count, 1);

    let ended = client.end_session("rpc-1").await.unwrap();
    assert!(!ended.active);
    let again = client.end_session("rpc-1").await.unwrap();
    assert_eq!(again.ended_at, ended.ended_at);
    assert_eq!(client.health().await.unwrap().active_session_count, 0);
}

#[tokio::test]
async fn test_domain_errors_cross_the_wire() {
    let server = TestServer::start().await;
    let raw = server.create_raw_client().await;

    raw.create_session(tarpc::context::current(), create_request("dup"))
        .await
        .unwrap()
        .unwrap();
    let err = raw
        .create_session(tarpc::context::current(), create_request("dup"))
        .await
        .unwrap()
        .unwrap_err();
    assert_eq!(
        err,
        AttendanceError::AlreadyExists {
            session_id: "dup".to_string()
        }
    );

    let client = server.create_client().await;
    let err = client.get_session("missing").await.unwrap_err();
    let domain = err.downcast_ref::<AttendanceError>().unwrap();
    assert_eq!(domain.status_code(), 404);
}

#[tokio::test]
async fn test_generated_session_id() {
    let server = TestServer::start().await;
    let client = server.create_client().await;

    let mut request = create_request("ignored");
    request.session_id = None;
    let created = client.create_session(request).await.unwrap();

    assert!(created.session_id.starts_with("session_"));
    assert!(client.get_session(&created.session_id).await.is_ok());
}

#[tokio::test]
async fn test_shutdown_stops_accepting_connections() {
    let server = TestServer::start().await;
    let client = server.create_client().await;

    client.shutdown().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let addr = format!("127.0.0.1:{}", server.port);
    assert!(tokio::net::TcpStream::connect(&addr).await.is_err());
}
