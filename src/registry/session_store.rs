//! Session Store: keyed session records behind per-session locks.
//!
//! The map itself is only write-locked to insert a session. Everything else
//! clones the session's `Arc` under a read lock and then locks that one
//! session, so unrelated sessions never contend.

use crate::domain::{AttendanceError, Geofence, RedemptionRecord, SessionSnapshot};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock, RwLockReadGuard};

pub(crate) type SessionMap = HashMap<String, Arc<Mutex<Session>>>;

/// Exclusive access to one session, held across a whole read-decide-commit.
pub type SessionGuard = OwnedMutexGuard<Session>;

/// Fields for a session about to be created.
#[derive(Debug, Clone, PartialEq)]
pub struct NewSession {
    pub session_id: String,
    pub owner_id: String,
    pub class_id: String,
    pub section: String,
    pub geofence: Option<Geofence>,
}

/// A session record. Only reachable through a [`SessionGuard`].
#[derive(Debug)]
pub struct Session {
    session_id: String,
    owner_id: String,
    class_id: String,
    section: String,
    active: bool,
    created_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    geofence: Option<Geofence>,
    consumed: HashSet<String>,
    devices: HashSet<String>,
    redemptions: Vec<RedemptionRecord>,
}

impl Session {
    fn new(new: NewSession, now: DateTime<Utc>) -> Self {
        Self {
            session_id: new.session_id,
            owner_id: new.owner_id,
            class_id: new.class_id,
            section: new.section,
            active: true,
            created_at: now,
            ended_at: None,
            geofence: new.geofence,
            consumed: HashSet::new(),
            devices: HashSet::new(),
            redemptions: Vec::new(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub fn class_id(&self) -> &str {
        &self.class_id
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }

    pub fn geofence(&self) -> Option<Geofence> {
        self.geofence
    }

    pub fn is_consumed(&self, credential_id: &str) -> bool {
        self.consumed.contains(credential_id)
    }

    pub fn has_device(&self, device_id: &str) -> bool {
        self.devices.contains(device_id)
    }

    pub fn device_count(&self) -> usize {
        self.redemptions.len()
    }

    pub fn redemptions(&self) -> &[RedemptionRecord] {
        &self.redemptions
    }

    /// Consumes the record's credential and appends the record.
    ///
    /// Callers must have checked `is_consumed` and `has_device` under the
    /// same guard; the debug assertions catch a validator that did not.
    pub(crate) fn append_redemption(&mut self, record: RedemptionRecord) -> usize {
        debug_assert!(!self.consumed.contains(&record.credential_id));
        debug_assert!(!self.devices.contains(&record.device_id));
        self.consumed.insert(record.credential_id.clone());
        self.devices.insert(record.device_id.clone());
        self.redemptions.push(record);
        self.redemptions.len()
    }

    /// Returns true only on the active -> ended transition.
    pub(crate) fn deactivate(&mut self, now: DateTime<Utc>) -> bool {
        if !self.active {
            return false;
        }
        self.active = false;
        self.ended_at = Some(now);
        true
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let mut consumed: Vec<String> = self.consumed.iter().cloned().collect();
        consumed.sort();
        SessionSnapshot {
            session_id: self.session_id.clone(),
            owner_id: self.owner_id.clone(),
            class_id: self.class_id.clone(),
            section: self.section.clone(),
            active: self.active,
            created_at: self.created_at,
            ended_at: self.ended_at,
            geofence: self.geofence,
            consumed_credentials: consumed,
            redemptions: self.redemptions.clone(),
        }
    }
}

/// Registry of all sessions.
#[derive(Default)]
pub struct SessionStore {
    sessions: RwLock<SessionMap>,
    active: AtomicUsize,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a new active session and returns it already locked, so the
    /// caller can publish its creation before anyone else observes it.
    pub async fn create(
        &self,
        new: NewSession,
        now: DateTime<Utc>,
    ) -> Result<SessionGuard, AttendanceError> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&new.session_id) {
            return Err(AttendanceError::AlreadyExists {
                session_id: new.session_id,
            });
        }
        let session_id = new.session_id.clone();
        let slot = Arc::new(Mutex::new(Session::new(new, now)));
        let guard = slot.clone().lock_owned().await;
        sessions.insert(session_id, slot);
        self.active.fetch_add(1, Ordering::SeqCst);
        Ok(guard)
    }

    /// Locks one session. The map lock is released before waiting on the
    /// session.
    pub async fn lock(&self, session_id: &str) -> Option<SessionGuard> {
        let slot = {
            let sessions = self.sessions.read().await;
            sessions.get(session_id).cloned()
        }?;
        Some(slot.lock_owned().await)
    }

    /// Locks one session while keeping the map read-locked, so no session can
    /// be created until both guards are dropped.
    pub(crate) async fn lock_pinned(
        &self,
        session_id: &str,
    ) -> (RwLockReadGuard<'_, SessionMap>, Option<SessionGuard>) {
        let sessions = self.sessions.read().await;
        let guard = match sessions.get(session_id) {
            Some(slot) => Some(slot.clone().lock_owned().await),
            None => None,
        };
        (sessions, guard)
    }

    pub async fn get(&self, session_id: &str) -> Result<SessionSnapshot, AttendanceError> {
        let session = self
            .lock(session_id)
            .await
            .ok_or_else(|| AttendanceError::session_not_found(session_id))?;
        Ok(session.snapshot())
    }

    /// Ends a session. Ending twice is not an error; the flag tells whether
    /// this call performed the transition.
    pub async fn end(
        &self,
        session_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(SessionGuard, bool), AttendanceError> {
        let mut session = self
            .lock(session_id)
            .await
            .ok_or_else(|| AttendanceError::session_not_found(session_id))?;
        let ended = session.deactivate(now);
        if ended {
            self.active.fetch_sub(1, Ordering::SeqCst);
        }
        Ok((session, ended))
    }

    /// Non-mutating check used by the API's credential-used probe.
    pub async fn credential_used(
        &self,
        session_id: &str,
        credential_id: &str,
    ) -> Result<bool, AttendanceError> {
        let session = self
            .lock(session_id)
            .await
            .ok_or_else(|| AttendanceError::session_not_found(session_id))?;
        Ok(session.is_consumed(credential_id))
    }

    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
#[path = "tests/session_store_tests.rs"]
mod tests;
