use crate::attendd_paths;
use crate::domain::RedemptionPolicy;
use crate::domain::types::{
    DEFAULT_CREDENTIAL_TTL_SECS, DEFAULT_DEVICE_COOLDOWN_SECS, DEFAULT_GEOFENCE_RADIUS_M,
};
use crate::registry::broadcaster::DEFAULT_EVENT_BACKLOG;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

/// Longest time window accepted for any configured duration (one year).
const MAX_WINDOW_SECS: u64 = 365 * 24 * 60 * 60;

/// Daemon configuration, loaded from YAML. Every field has a default, so an
/// empty file (or no file) is a valid configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct AttendanceConfig {
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

/// Limits applied to every redemption.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct PolicyConfig {
    /// Lifetime of an issued credential. Default: 120
    #[serde(default = "default_credential_ttl_secs")]
    pub credential_ttl_secs: u64,
    /// Cross-session cooldown for a device. Default: 3000 (50 minutes)
    #[serde(default = "default_device_cooldown_secs")]
    pub device_cooldown_secs: u64,
    /// Radius applied to every geofenced session. Default: 50.0
    #[serde(default = "default_geofence_radius_m")]
    pub geofence_radius_m: f64,
    /// Events kept per session for subscriber replay. Default: 64
    #[serde(default = "default_event_backlog")]
    pub event_backlog: usize,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            credential_ttl_secs: default_credential_ttl_secs(),
            device_cooldown_secs: default_device_cooldown_secs(),
            geofence_radius_m: default_geofence_radius_m(),
            event_backlog: default_event_backlog(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    /// Main RPC port. 0 picks a free port.
    #[serde(default)]
    pub port: u16,
    /// Subscriber callback port. 0 picks a free port.
    #[serde(default)]
    pub subscriber_port: u16,
    #[serde(default = "default_subscriber_ping_secs")]
    pub subscriber_ping_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: 0,
            subscriber_port: 0,
            subscriber_ping_secs: default_subscriber_ping_secs(),
        }
    }
}

fn default_credential_ttl_secs() -> u64 {
    DEFAULT_CREDENTIAL_TTL_SECS
}

fn default_device_cooldown_secs() -> u64 {
    DEFAULT_DEVICE_COOLDOWN_SECS
}

fn default_geofence_radius_m() -> f64 {
    DEFAULT_GEOFENCE_RADIUS_M
}

fn default_event_backlog() -> usize {
    DEFAULT_EVENT_BACKLOG
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_subscriber_ping_secs() -> u64 {
    30
}

impl AttendanceConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Self = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file as YAML: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads the daemon configuration.
    ///
    /// An explicit path must exist. Without one, `~/.attendd/config.yaml` is
    /// used when present and defaults otherwise. Environment overrides are
    /// applied last.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        let mut config = match explicit {
            Some(path) => Self::load(path)?,
            None => {
                let path = attendd_paths::config_path()?;
                if path.exists() {
                    Self::load(&path)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Applies `ATTENDD_PORT`, `ATTENDD_SUBSCRIBER_PORT` and
    /// `ATTENDD_COOLDOWN_SECS`.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(port) = env_override("ATTENDD_PORT")? {
            self.server.port = port;
        }
        if let Some(port) = env_override("ATTENDD_SUBSCRIBER_PORT")? {
            self.server.subscriber_port = port;
        }
        if let Some(secs) = env_override("ATTENDD_COOLDOWN_SECS")? {
            self.policy.device_cooldown_secs = secs;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let windows = [
            ("policy.credential_ttl_secs", self.policy.credential_ttl_secs),
            ("policy.device_cooldown_secs", self.policy.device_cooldown_secs),
            ("server.subscriber_ping_secs", self.server.subscriber_ping_secs),
        ];
        for (name, secs) in windows {
            if secs == 0 || secs > MAX_WINDOW_SECS {
                anyhow::bail!(
                    "{} must be between 1 and {} seconds, got {}",
                    name,
                    MAX_WINDOW_SECS,
                    secs
                );
            }
        }

        let radius = self.policy.geofence_radius_m;
        if !radius.is_finite() || radius <= 0.0 {
            anyhow::bail!(
                "policy.geofence_radius_m must be a positive number, got {}",
                radius
            );
        }

        if self.policy.event_backlog == 0 {
            anyhow::bail!("policy.event_backlog must be at least 1");
        }

        if self.server.host.trim().is_empty() {
            anyhow::bail!("server.host must not be empty");
        }

        Ok(())
    }

    pub fn redemption_policy(&self) -> RedemptionPolicy {
        RedemptionPolicy {
            credential_ttl: chrono::Duration::seconds(self.policy.credential_ttl_secs as i64),
            device_cooldown: chrono::Duration::seconds(self.policy.device_cooldown_secs as i64),
            geofence_radius_m: self.policy.geofence_radius_m,
        }
    }
}

fn env_override<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("Invalid value for {}: {:?}", name, raw)),
        _ => Ok(None),
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
