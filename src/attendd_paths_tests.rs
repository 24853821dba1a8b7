//! Tests for attendd_paths module.

use super::*;
use serial_test::serial;
use std::env;
use tempfile::tempdir;

#[test]
#[serial]
fn test_home_env_relocates_all_paths() {
    let dir = tempdir().unwrap();
    let custom = dir.path().join("state");
    env::set_var(HOME_ENV, &custom);

    assert_eq!(attendd_home_dir().unwrap(), custom);
    assert!(custom.is_dir(), "home dir should be created on demand");
    assert_eq!(port_path().unwrap(), custom.join("attendd.port"));
    assert_eq!(pid_path().unwrap(), custom.join("attendd.pid"));
    assert_eq!(lock_path().unwrap(), custom.join("attendd.lock"));
    assert_eq!(config_path().unwrap(), custom.join("config.yaml"));
    assert_eq!(daemon_log_path().unwrap(), custom.join("daemon.log"));

    env::remove_var(HOME_ENV);
}
