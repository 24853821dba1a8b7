//! Home-based storage paths for the attendance daemon.
//!
//! Everything lives under `~/.attendd/` unless `ATTENDD_HOME` points
//! elsewhere:
//! - `config.yaml` - Optional daemon configuration
//! - `attendd.lock` - Held exclusively by the running daemon
//! - `attendd.pid` / `attendd.port` - How clients find the daemon
//! - `daemon.log` - Transport-level debug log

use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;

/// The name of the attendd directory under the user's home.
const ATTENDD_DIR: &str = ".attendd";

/// Environment variable that relocates the whole state directory.
pub const HOME_ENV: &str = "ATTENDD_HOME";

/// Returns the attendd state directory, creating it if needed.
///
/// # Errors
///
/// Returns an error if:
/// - Neither `ATTENDD_HOME` nor a home directory is available
/// - Directory creation fails
pub fn attendd_home_dir() -> Result<PathBuf> {
    let dir = match std::env::var_os(HOME_ENV) {
        Some(custom) if !custom.is_empty() => PathBuf::from(custom),
        _ => dirs::home_dir()
            .context("Could not determine home directory for attendd state")?
            .join(ATTENDD_DIR),
    };
    fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create attendd directory: {}", dir.display()))?;
    Ok(dir)
}

/// Returns the default config file path: `~/.attendd/config.yaml`
pub fn config_path() -> Result<PathBuf> {
    Ok(attendd_home_dir()?.join("config.yaml"))
}

/// Returns the daemon lock file path: `~/.attendd/attendd.lock`
pub fn lock_path() -> Result<PathBuf> {
    Ok(attendd_home_dir()?.join("attendd.lock"))
}

/// Returns the daemon PID file path: `~/.attendd/attendd.pid`
pub fn pid_path() -> Result<PathBuf> {
    Ok(attendd_home_dir()?.join("attendd.pid"))
}

/// Returns the daemon port file path: `~/.attendd/attendd.port`
///
/// Contains JSON with the main and subscriber ports.
pub fn port_path() -> Result<PathBuf> {
    Ok(attendd_home_dir()?.join("attendd.port"))
}

/// Returns the transport log path: `~/.attendd/daemon.log`
pub fn daemon_log_path() -> Result<PathBuf> {
    Ok(attendd_home_dir()?.join("daemon.log"))
}

#[cfg(test)]
#[path = "attendd_paths_tests.rs"]
mod tests;
