//! Device Ledger: the last successful redemption of every device, across all
//! sessions.
//!
//! Each device gets its own slot lock. The validator holds that lock from the
//! cooldown check until the ledger entry is written, which serializes two
//! sessions racing for the same device.

use crate::domain::{CooldownEntry, DevicePrecheck, RedeemRejection};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

/// Exclusive access to one device's cooldown slot.
pub type DeviceGuard = OwnedMutexGuard<Option<CooldownEntry>>;

#[derive(Default)]
pub struct DeviceLedger {
    devices: RwLock<HashMap<String, Arc<Mutex<Option<CooldownEntry>>>>>,
}

impl DeviceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn last_redemption(&self, device_id: &str) -> Option<CooldownEntry> {
        let slot = {
            let devices = self.devices.read().await;
            devices.get(device_id).cloned()
        }?;
        let entry = slot.lock().await;
        entry.clone()
    }

    /// Locks a device's slot, creating an empty one on first sight.
    pub(crate) async fn lock(&self, device_id: &str) -> DeviceGuard {
        let existing = {
            let devices = self.devices.read().await;
            devices.get(device_id).cloned()
        };
        let slot = match existing {
            Some(slot) => slot,
            None => {
                let mut devices = self.devices.write().await;
                devices
                    .entry(device_id.to_string())
                    .or_insert_with(|| Arc::new(Mutex::new(None)))
                    .clone()
            }
        };
        slot.lock_owned().await
    }

    /// Overwrites the device's entry. Only called from the validator's commit.
    pub(crate) fn record_redemption(
        guard: &mut DeviceGuard,
        session_id: &str,
        redeemed_at: DateTime<Utc>,
    ) {
        **guard = Some(CooldownEntry {
            session_id: session_id.to_string(),
            redeemed_at,
        });
    }

    /// Advisory cooldown check. Never authoritative.
    pub async fn precheck(
        &self,
        device_id: &str,
        session_id: &str,
        now: DateTime<Utc>,
        cooldown: Duration,
    ) -> DevicePrecheck {
        let entry = self.last_redemption(device_id).await;
        match entry.and_then(|e| cooldown_remaining(&e, session_id, now, cooldown)) {
            Some(remaining) => DevicePrecheck::denied(RedeemRejection::DeviceCoolingDown {
                remaining_secs: ceil_secs(remaining),
            }),
            None => DevicePrecheck::allowed(),
        }
    }

    #[cfg(test)]
    pub async fn device_count(&self) -> usize {
        self.devices.read().await.len()
    }
}

/// Time left before `entry` stops blocking a redemption in `session_id`.
///
/// `None` when the entry is for the same session or the window has elapsed;
/// a redemption exactly `cooldown` after the last one is allowed.
pub fn cooldown_remaining(
    entry: &CooldownEntry,
    session_id: &str,
    now: DateTime<Utc>,
    cooldown: Duration,
) -> Option<Duration> {
    if entry.session_id == session_id {
        return None;
    }
    let elapsed = now - entry.redeemed_at;
    if elapsed >= cooldown {
        None
    } else {
        Some(cooldown - elapsed)
    }
}

/// Whole seconds, rounded up, so a user is never told "0 seconds".
pub fn ceil_secs(duration: Duration) -> u64 {
    let millis = duration.num_milliseconds().max(0) as u64;
    millis.div_ceil(1000)
}

#[cfg(test)]
#[path = "tests/device_ledger_tests.rs"]
mod tests;
