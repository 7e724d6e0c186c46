//! Error types for the emergency orchestration core.
//!
//! The taxonomy mirrors how failures are allowed to travel:
//!
//! - [`StorageError`] and [`BackendError`] are hard failures that propagate
//!   to the immediate caller.
//! - [`AudioError`] distinguishes "nothing was recording" (not an error,
//!   surfaced as `Ok(None)`) from a failed upload of a real recording.
//! - [`CoordinatorError`] covers the session state machine's own
//!   preconditions.
//!
//! Permission denials and best-effort side effects (geocoding, volunteer or
//! contact fan-out, profile fetches) are never represented here; those paths
//! degrade and log instead of erroring.

use crate::model::EmergencyStatus;
use thiserror::Error;

/// Failures from the local key-value store.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage I/O failure: {0}")]
    Io(String),

    #[error("corrupt stored record: {0}")]
    Corrupt(#[from] serde_json::Error),
}

impl From<sqlx::Error> for StorageError {
    fn from(e: sqlx::Error) -> Self {
        StorageError::Io(e.to_string())
    }
}

/// Failures from the remote document store.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("document not found: {0}")]
    NotFound(String),

    #[error("document store unavailable: {0}")]
    Unavailable(String),

    #[error("document write failed: {0}")]
    WriteFailed(String),
}

/// Failures from the audio capture service.
#[derive(Debug, Error)]
pub enum AudioError {
    /// A recording is already running; exactly one is allowed at a time.
    #[error("a recording is already in progress")]
    RecordingInProgress,

    /// The recording finished locally but could not be uploaded. The clip is
    /// reported in the error so it is not lost silently.
    #[error("audio upload failed: {0}")]
    UploadFailed(String),

    #[error("recording device failure: {0}")]
    Device(String),
}

/// Failures from the session coordinator itself.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// Online session creation requires an authenticated user.
    #[error("an authenticated user is required to create an emergency session")]
    AuthRequired,

    /// One active session per coordinator; a second create is rejected
    /// rather than silently replacing the running one.
    #[error("an emergency session is already active: {0}")]
    SessionAlreadyActive(String),

    #[error("illegal status transition: {from:?} -> {to:?}")]
    InvalidTransition {
        from: EmergencyStatus,
        to: EmergencyStatus,
    },

    #[error(transparent)]
    Backend(#[from] BackendError),
}
