//! Backend collaborator contracts: document store, auth, connectivity.
//!
//! The orchestration core never talks to a concrete BaaS SDK; it is handed
//! these traits. [`MemoryStore`] is a complete in-process implementation
//! used by tests and the demo binary.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::error::BackendError;
use crate::model::{
    AudioAttachment, EmergencySession, EmergencyStatus, EmergencyUpdate, GeoPoint, LocationFix,
    UserProfile,
};

/// A volunteer candidate for proximity fan-out.
#[derive(Debug, Clone, PartialEq)]
pub struct Volunteer {
    pub id: String,
    pub name: String,
    pub push_token: String,
    pub location: GeoPoint,
    pub verified: bool,
    pub available: bool,
}

/// One of a user's registered emergency contacts.
#[derive(Debug, Clone, PartialEq)]
pub struct EmergencyContact {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub phone: Option<String>,
    pub push_token: Option<String>,
}

/// A community hazard report with its upvote state.
#[derive(Debug, Clone, PartialEq)]
pub struct HazardReport {
    pub id: String,
    pub description: String,
    pub upvotes: i64,
    pub upvoted_by: Vec<String>,
}

/// Partial update of an emergency record. `None` fields are left untouched;
/// the store refreshes `last_updated` on every patch.
#[derive(Debug, Clone, Default)]
pub struct SessionPatch {
    pub status: Option<EmergencyStatus>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub location: Option<LocationFix>,
    pub address: Option<String>,
    pub audio_recording: Option<AudioAttachment>,
}

impl SessionPatch {
    pub fn status(status: EmergencyStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn location(fix: LocationFix) -> Self {
        Self {
            location: Some(fix),
            ..Self::default()
        }
    }

    pub fn audio(attachment: AudioAttachment) -> Self {
        Self {
            audio_recording: Some(attachment),
            ..Self::default()
        }
    }
}

/// Document-database operations the orchestration core depends on.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Persist a new emergency record; the store assigns and returns its id.
    async fn create_emergency(&self, record: &EmergencySession) -> Result<String, BackendError>;

    async fn get_emergency(&self, id: &str) -> Result<Option<EmergencySession>, BackendError>;

    /// Apply a partial field update and refresh `last_updated`.
    async fn patch_emergency(&self, id: &str, patch: SessionPatch) -> Result<(), BackendError>;

    /// Rewrite the persisted `updates` array wholesale. Callers preserve
    /// append-only ordering; the store does not reorder.
    async fn put_updates(&self, id: &str, updates: &[EmergencyUpdate]) -> Result<(), BackendError>;

    /// Whether `user_id` has any session in an open status
    /// (active/acknowledged/responded).
    async fn has_open_emergency(&self, user_id: &str) -> Result<bool, BackendError>;

    /// Live-update channel: the returned receiver yields the full record
    /// after every remote mutation.
    async fn watch_emergency(
        &self,
        id: &str,
    ) -> Result<mpsc::Receiver<EmergencySession>, BackendError>;

    async fn get_user_profile(&self, uid: &str) -> Result<Option<UserProfile>, BackendError>;

    /// Push tokens of the active security-role users (the responder channel).
    async fn security_push_tokens(&self) -> Result<Vec<String>, BackendError>;

    /// Verified, currently-available volunteers.
    async fn available_volunteers(&self) -> Result<Vec<Volunteer>, BackendError>;

    async fn emergency_contacts(
        &self,
        user_id: &str,
    ) -> Result<Vec<EmergencyContact>, BackendError>;

    async fn get_hazard_report(&self, id: &str) -> Result<Option<HazardReport>, BackendError>;

    /// Atomic upvote mutation: `add` unions the user into `upvoted_by` and
    /// increments the counter; `!add` removes and decrements.
    async fn apply_upvote(
        &self,
        report_id: &str,
        user_id: &str,
        add: bool,
    ) -> Result<(), BackendError>;
}

/// Current-user identity from the auth provider.
pub trait AuthProvider: Send + Sync {
    fn current_uid(&self) -> Option<String>;
    fn id_token(&self) -> Option<String>;
}

/// Network reachability probe.
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn is_online(&self) -> bool;
}

/// Fixed-identity auth provider for tests and the demo binary.
pub struct StaticAuth {
    uid: Option<String>,
}

impl StaticAuth {
    pub fn signed_in(uid: impl Into<String>) -> Self {
        Self {
            uid: Some(uid.into()),
        }
    }

    pub fn signed_out() -> Self {
        Self { uid: None }
    }
}

impl AuthProvider for StaticAuth {
    fn current_uid(&self) -> Option<String> {
        self.uid.clone()
    }

    fn id_token(&self) -> Option<String> {
        self.uid.as_ref().map(|uid| format!("token-{uid}"))
    }
}

/// Switchable connectivity probe for tests and the demo binary.
pub struct StaticConnectivity {
    online: AtomicBool,
}

impl StaticConnectivity {
    pub fn new(online: bool) -> Self {
        Self {
            online: AtomicBool::new(online),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }
}

#[async_trait]
impl ConnectivityProbe for StaticConnectivity {
    async fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }
}

/// In-memory document store.
///
/// Watchers registered through [`DocumentStore::watch_emergency`] receive
/// the full record after every mutation, mirroring a remote snapshot
/// listener.
pub struct MemoryStore {
    emergencies: RwLock<HashMap<String, EmergencySession>>,
    profiles: RwLock<HashMap<String, UserProfile>>,
    security_tokens: RwLock<Vec<String>>,
    volunteers: RwLock<Vec<Volunteer>>,
    contacts: RwLock<HashMap<String, Vec<EmergencyContact>>>,
    hazards: RwLock<HashMap<String, HazardReport>>,
    watchers: Mutex<HashMap<String, Vec<mpsc::Sender<EmergencySession>>>>,
    next_id: AtomicU64,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            emergencies: RwLock::new(HashMap::new()),
            profiles: RwLock::new(HashMap::new()),
            security_tokens: RwLock::new(Vec::new()),
            volunteers: RwLock::new(Vec::new()),
            contacts: RwLock::new(HashMap::new()),
            hazards: RwLock::new(HashMap::new()),
            watchers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Make every create fail, to exercise the offline fallback path.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn insert_profile(&self, uid: &str, profile: UserProfile) {
        self.profiles
            .write()
            .unwrap()
            .insert(uid.to_string(), profile);
    }

    pub fn set_security_tokens(&self, tokens: Vec<String>) {
        *self.security_tokens.write().unwrap() = tokens;
    }

    pub fn insert_volunteer(&self, volunteer: Volunteer) {
        self.volunteers.write().unwrap().push(volunteer);
    }

    pub fn insert_contact(&self, contact: EmergencyContact) {
        self.contacts
            .write()
            .unwrap()
            .entry(contact.user_id.clone())
            .or_default()
            .push(contact);
    }

    pub fn insert_hazard_report(&self, report: HazardReport) {
        self.hazards
            .write()
            .unwrap()
            .insert(report.id.clone(), report);
    }

    /// Mutate a record directly and notify watchers, simulating a remote
    /// actor (e.g. a responder console) editing the session.
    pub fn remote_edit(&self, id: &str, edit: impl FnOnce(&mut EmergencySession)) {
        let updated = {
            let mut emergencies = self.emergencies.write().unwrap();
            let Some(record) = emergencies.get_mut(id) else {
                return;
            };
            edit(record);
            record.last_updated = Utc::now();
            record.clone()
        };
        self.notify_watchers(id, updated);
    }

    fn notify_watchers(&self, id: &str, record: EmergencySession) {
        let mut watchers = self.watchers.lock().unwrap();
        if let Some(senders) = watchers.get_mut(id) {
            senders.retain(|tx| tx.try_send(record.clone()).is_ok());
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn create_emergency(&self, record: &EmergencySession) -> Result<String, BackendError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(BackendError::WriteFailed(
                "simulated write failure".to_string(),
            ));
        }

        let id = format!("em-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let mut stored = record.clone();
        stored.id = id.clone();
        self.emergencies.write().unwrap().insert(id.clone(), stored);
        Ok(id)
    }

    async fn get_emergency(&self, id: &str) -> Result<Option<EmergencySession>, BackendError> {
        Ok(self.emergencies.read().unwrap().get(id).cloned())
    }

    async fn patch_emergency(&self, id: &str, patch: SessionPatch) -> Result<(), BackendError> {
        let updated = {
            let mut emergencies = self.emergencies.write().unwrap();
            let record = emergencies
                .get_mut(id)
                .ok_or_else(|| BackendError::NotFound(id.to_string()))?;

            if let Some(status) = patch.status {
                record.status = status;
            }
            if let Some(at) = patch.acknowledged_at {
                record.acknowledged_at = Some(at);
            }
            if let Some(at) = patch.resolved_at {
                record.resolved_at = Some(at);
            }
            if let Some(fix) = patch.location {
                record.location = fix.geo_point();
                record.location_data = fix;
            }
            if let Some(address) = patch.address {
                record.address = Some(address);
            }
            if let Some(audio) = patch.audio_recording {
                record.audio_recording = Some(audio);
            }
            record.last_updated = Utc::now();
            record.clone()
        };

        self.notify_watchers(id, updated);
        Ok(())
    }

    async fn put_updates(&self, id: &str, updates: &[EmergencyUpdate]) -> Result<(), BackendError> {
        let updated = {
            let mut emergencies = self.emergencies.write().unwrap();
            let record = emergencies
                .get_mut(id)
                .ok_or_else(|| BackendError::NotFound(id.to_string()))?;
            record.updates = updates.to_vec();
            record.last_updated = Utc::now();
            record.clone()
        };

        self.notify_watchers(id, updated);
        Ok(())
    }

    async fn has_open_emergency(&self, user_id: &str) -> Result<bool, BackendError> {
        Ok(self
            .emergencies
            .read()
            .unwrap()
            .values()
            .any(|s| s.reported_by == user_id && s.status.is_open()))
    }

    async fn watch_emergency(
        &self,
        id: &str,
    ) -> Result<mpsc::Receiver<EmergencySession>, BackendError> {
        let (tx, rx) = mpsc::channel(16);
        self.watchers
            .lock()
            .unwrap()
            .entry(id.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }

    async fn get_user_profile(&self, uid: &str) -> Result<Option<UserProfile>, BackendError> {
        Ok(self.profiles.read().unwrap().get(uid).cloned())
    }

    async fn security_push_tokens(&self) -> Result<Vec<String>, BackendError> {
        Ok(self.security_tokens.read().unwrap().clone())
    }

    async fn available_volunteers(&self) -> Result<Vec<Volunteer>, BackendError> {
        Ok(self
            .volunteers
            .read()
            .unwrap()
            .iter()
            .filter(|v| v.verified && v.available)
            .cloned()
            .collect())
    }

    async fn emergency_contacts(
        &self,
        user_id: &str,
    ) -> Result<Vec<EmergencyContact>, BackendError> {
        Ok(self
            .contacts
            .read()
            .unwrap()
            .get(user_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_hazard_report(&self, id: &str) -> Result<Option<HazardReport>, BackendError> {
        Ok(self.hazards.read().unwrap().get(id).cloned())
    }

    async fn apply_upvote(
        &self,
        report_id: &str,
        user_id: &str,
        add: bool,
    ) -> Result<(), BackendError> {
        let mut hazards = self.hazards.write().unwrap();
        let report = hazards
            .get_mut(report_id)
            .ok_or_else(|| BackendError::NotFound(report_id.to_string()))?;

        if add {
            if !report.upvoted_by.iter().any(|u| u == user_id) {
                report.upvoted_by.push(user_id.to_string());
                report.upvotes += 1;
            }
        } else if let Some(pos) = report.upvoted_by.iter().position(|u| u == user_id) {
            report.upvoted_by.remove(pos);
            report.upvotes -= 1;
        }

        Ok(())
    }
}
