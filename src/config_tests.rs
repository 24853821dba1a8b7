use super::*;
use serial_test::serial;
use std::env;
use tempfile::tempdir;

#[test]
fn test_defaults_match_policy_constants() {
    let config = AttendanceConfig::default();
    config.validate().unwrap();

    let policy = config.redemption_policy();
    assert_eq!(policy, RedemptionPolicy::default());
    assert_eq!(config.policy.event_backlog, 64);
    assert_eq!(config.server.host, "127.0.0.1");
    assert_eq!(config.server.subscriber_ping_secs, 30);
}

#[test]
fn test_partial_yaml_keeps_defaults() {
    let yaml = r#"
policy:
  device_cooldown_secs: 600
server:
  port: 4100
"#;
    let config: AttendanceConfig = serde_yaml::from_str(yaml).unwrap();

    assert_eq!(config.policy.device_cooldown_secs, 600);
    assert_eq!(config.policy.credential_ttl_secs, 120);
    assert_eq!(config.server.port, 4100);
    assert_eq!(config.server.subscriber_port, 0);
}

#[test]
fn test_load_from_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("config.yaml");
    std::fs::write(&path, "policy:\n  geofence_radius_m: 75.5\n").unwrap();

    let config = AttendanceConfig::load(&path).unwrap();
    assert_eq!(config.policy.geofence_radius_m, 75.5);
}

#[test]
fn test_load_rejects_invalid_values() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("config.yaml");

    std::fs::write(&path, "policy:\n  credential_ttl_secs: 0\n").unwrap();
    let err = AttendanceConfig::load(&path).unwrap_err();
    assert!(err.to_string().contains("credential_ttl_secs"));

    std::fs::write(&path, "policy:\n  geofence_radius_m: -3.0\n").unwrap();
    assert!(AttendanceConfig::load(&path).is_err());

    std::fs::write(&path, "policy:\n  event_backlog: 0\n").unwrap();
    assert!(AttendanceConfig::load(&path).is_err());

    std::fs::write(&path, "policy: [not, a, map]\n").unwrap();
    assert!(AttendanceConfig::load(&path).is_err());
}

#[test]
fn test_load_missing_explicit_file_fails() {
    let dir = tempdir().unwrap();
    let missing = dir.path().join("absent.yaml");
    assert!(AttendanceConfig::resolve(Some(&missing)).is_err());
}

#[test]
#[serial]
fn test_env_overrides_apply_after_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("config.yaml");
    std::fs::write(&path, "server:\n  port: 4100\n").unwrap();
    env::set_var("ATTENDD_PORT", "4200");
    env::set_var("ATTENDD_COOLDOWN_SECS", "90");

    let config = AttendanceConfig::resolve(Some(&path));

    env::remove_var("ATTENDD_PORT");
    env::remove_var("ATTENDD_COOLDOWN_SECS");
    let config = config.unwrap();
    assert_eq!(config.server.port, 4200);
    assert_eq!(config.policy.device_cooldown_secs, 90);
}

#[test]
#[serial]
fn test_invalid_env_override_is_an_error() {
    env::set_var("ATTENDD_SUBSCRIBER_PORT", "not-a-port");

    let mut config = AttendanceConfig::default();
    let result = config.apply_env_overrides();

    env::remove_var("ATTENDD_SUBSCRIBER_PORT");
    let err = result.unwrap_err();
    assert!(err.to_string().contains("ATTENDD_SUBSCRIBER_PORT"));
}

#[test]
#[serial]
fn test_resolve_without_file_uses_defaults() {
    let dir = tempdir().unwrap();
    env::set_var("ATTENDD_HOME", dir.path());

    let config = AttendanceConfig::resolve(None);

    env::remove_var("ATTENDD_HOME");
    assert_eq!(config.unwrap(), AttendanceConfig::default());
}
