//! Data models for Lifeline.
//!
//! The aggregate root is [`EmergencySession`]: one emergency from creation to
//! a terminal status, carrying its location, optional audio attachment, and
//! an append-only audit trail of [`EmergencyUpdate`] entries.
//!
//! Status transitions are declared once, in
//! [`EmergencyStatus::transition_effects`], rather than scattered across
//! call sites. The coordinator is the only dispatcher of that table.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A bare coordinate pair, the shape persisted on the session record.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

/// A full positioning reading from the device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationFix {
    pub latitude: f64,
    pub longitude: f64,

    /// Horizontal accuracy in meters, 0 when the provider reports none.
    pub accuracy: f64,

    pub altitude: Option<f64>,
    pub heading: Option<f64>,

    /// Ground speed in meters per second.
    pub speed: Option<f64>,

    /// When the reading was taken (UTC).
    pub timestamp: DateTime<Utc>,
}

impl LocationFix {
    /// The coordinate pair of this fix.
    pub fn geo_point(&self) -> GeoPoint {
        GeoPoint {
            latitude: self.latitude,
            longitude: self.longitude,
        }
    }
}

/// Category of a reported emergency. Supplied by the caller, never inferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmergencyType {
    Fire,
    Medical,
    RobberyTheft,
    Accident,
    /// Anything the fixed set does not recognize.
    Other,
}

impl EmergencyType {
    /// Parse the caller-supplied category string. Unrecognized input maps to
    /// [`EmergencyType::Other`] rather than failing.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_uppercase().as_str() {
            "FIRE" => EmergencyType::Fire,
            "MEDICAL" => EmergencyType::Medical,
            "ROBBERY/THEFT" | "ROBBERY" | "THEFT" => EmergencyType::RobberyTheft,
            "ACCIDENT" => EmergencyType::Accident,
            _ => EmergencyType::Other,
        }
    }

    /// Human-readable label used in alert messages.
    pub fn label(&self) -> &'static str {
        match self {
            EmergencyType::Fire => "FIRE",
            EmergencyType::Medical => "MEDICAL",
            EmergencyType::RobberyTheft => "ROBBERY/THEFT",
            EmergencyType::Accident => "ACCIDENT",
            EmergencyType::Other => "OTHER",
        }
    }

    /// Fixed priority lookup, applied once at session creation.
    ///
    /// - `critical`: fire, medical
    /// - `high`: robbery/theft, accident
    /// - `medium`: everything else
    pub fn priority(&self) -> Priority {
        match self {
            EmergencyType::Fire | EmergencyType::Medical => Priority::Critical,
            EmergencyType::RobberyTheft | EmergencyType::Accident => Priority::High,
            EmergencyType::Other => Priority::Medium,
        }
    }

    /// Whether this category also gets the SMS side channel when responders
    /// are alerted.
    pub fn warrants_sms(&self) -> bool {
        matches!(
            self,
            EmergencyType::Fire | EmergencyType::Medical | EmergencyType::RobberyTheft
        )
    }
}

/// Session priority, derived from the emergency type and never recomputed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

/// Lifecycle status of an emergency session.
///
/// Happy path is forward-only `active -> acknowledged -> responded ->
/// resolved`; `cancelled` is a side exit from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmergencyStatus {
    Active,
    Acknowledged,
    Responded,
    Resolved,
    Cancelled,
}

/// Side effect the coordinator must execute when a transition is taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionEffect {
    /// Stamp `acknowledged_at` with the current time.
    StampAcknowledged,
    /// Stamp `resolved_at` with the current time.
    StampResolved,
    /// Tear the session down (stop capture, detach listeners).
    StopSession,
}

impl EmergencyStatus {
    /// The declared transition table: effects for a legal move to `next`,
    /// `None` for an illegal one.
    ///
    /// Forward jumps are allowed (a responder team may resolve a session it
    /// never explicitly marked `responded`); moving backwards or out of a
    /// terminal state is not.
    pub fn transition_effects(self, next: EmergencyStatus) -> Option<&'static [TransitionEffect]> {
        use EmergencyStatus::*;
        use TransitionEffect::*;

        const ACK: &[TransitionEffect] = &[StampAcknowledged];
        const PLAIN: &[TransitionEffect] = &[];
        const RESOLVE: &[TransitionEffect] = &[StampResolved, StopSession];

        match (self, next) {
            (Active, Acknowledged) => Some(ACK),
            (Active | Acknowledged, Responded) => Some(PLAIN),
            (Active | Acknowledged | Responded, Resolved) => Some(RESOLVE),
            (Active | Acknowledged | Responded, Cancelled) => Some(PLAIN),
            _ => None,
        }
    }

    /// Terminal states accept no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, EmergencyStatus::Resolved | EmergencyStatus::Cancelled)
    }

    /// States that count as an ongoing emergency for duplicate detection.
    pub fn is_open(self) -> bool {
        matches!(
            self,
            EmergencyStatus::Active | EmergencyStatus::Acknowledged | EmergencyStatus::Responded
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EmergencyStatus::Active => "active",
            EmergencyStatus::Acknowledged => "acknowledged",
            EmergencyStatus::Responded => "responded",
            EmergencyStatus::Resolved => "resolved",
            EmergencyStatus::Cancelled => "cancelled",
        }
    }
}

/// Kind of audit-trail entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateKind {
    StatusChange,
    LocationUpdate,
    AudioReceived,
    ResponderAssigned,
    Message,
    Resolved,
}

/// One immutable audit-trail entry. The sequence on a session only grows;
/// entries are never reordered, edited, or deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmergencyUpdate {
    pub id: String,
    pub kind: UpdateKind,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub updated_by: String,
    pub data: Option<serde_json::Value>,
}

/// Caller-supplied portion of a new update; id, timestamp, and actor are
/// filled in by the coordinator.
#[derive(Debug, Clone)]
pub struct UpdateDraft {
    pub kind: UpdateKind,
    pub message: String,
    pub data: Option<serde_json::Value>,
}

impl UpdateDraft {
    pub fn new(kind: UpdateKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Best-effort snapshot of the reporting user, captured at creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub name: String,
    pub phone: Option<String>,
    pub student_id: Option<String>,
}

impl UserProfile {
    /// Placeholder used when the profile fetch fails or finds nothing.
    pub fn anonymous() -> Self {
        Self {
            name: "Anonymous".to_string(),
            phone: None,
            student_id: None,
        }
    }
}

/// Descriptor of the uploaded emergency recording. Populated at most once,
/// when recording stops and the upload succeeds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioAttachment {
    pub url: String,
    pub file_name: String,
    pub uploaded_at: DateTime<Utc>,
}

/// Free-form session metadata (device info, app version, offline flag).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    #[serde(default)]
    pub is_offline: bool,

    pub app_version: Option<String>,
    pub device_info: Option<serde_json::Value>,
    pub battery_level: Option<f32>,

    /// Anything else the caller attached.
    #[serde(default, flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// The aggregate root: one emergency session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmergencySession {
    /// Assigned by the document store, or synthesized with an `offline-`
    /// prefix when created without connectivity.
    pub id: String,

    pub emergency_type: EmergencyType,
    pub status: EmergencyStatus,
    pub priority: Priority,

    /// Authenticated user id, or a sentinel for offline capture.
    pub reported_by: String,
    pub user_profile: Option<UserProfile>,

    /// Last-known coordinate; refreshed by the tracker over the session's life.
    pub location: GeoPoint,
    pub location_data: LocationFix,
    pub address: Option<String>,

    pub audio_recording: Option<AudioAttachment>,

    pub description: Option<String>,

    /// Append-only audit trail.
    pub updates: Vec<EmergencyUpdate>,

    pub created_at: DateTime<Utc>,
    /// Refreshed on every mutation.
    pub last_updated: DateTime<Utc>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,

    pub metadata: SessionMetadata,
}

/// Parameters for creating an emergency session.
#[derive(Debug, Clone)]
pub struct CreateSessionParams {
    /// Raw category string from the caller, parsed via [`EmergencyType::parse`].
    pub emergency_type: String,
    pub location: LocationFix,
    pub description: Option<String>,
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
}

/// Reporter sentinel for sessions captured without an authenticated user.
pub const OFFLINE_USER: &str = "offline-user";

// Process-wide sequence folded into generated ids so two ids minted in the
// same millisecond still differ.
static ID_SEQ: AtomicU64 = AtomicU64::new(0);

/// Mint an audit-trail entry id: `<unix-millis>-<seq>`.
pub fn next_update_id(now: DateTime<Utc>) -> String {
    let seq = ID_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("{}-{}", now.timestamp_millis(), seq)
}

/// Mint a local session id for the offline path: `offline-<unix-millis>-<seq>`.
pub fn next_offline_id(now: DateTime<Utc>) -> String {
    let seq = ID_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("offline-{}-{}", now.timestamp_millis(), seq)
}
