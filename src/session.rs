//! Auth-session cache over the local key-value store.
//!
//! Holds the lightweight `{user, tokens, timestamp}` record the app uses to
//! skip re-authentication. Records older than seven days are treated as
//! absent and deleted lazily on read.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::StorageError;
use crate::storage::KeyValueStore;

/// Fixed namespaced keys for session-related data.
mod keys {
    pub const USER_DATA: &str = "lifeline:userSession";
    pub const AUTH_TOKENS: &str = "lifeline:authTokens";
    pub const SESSION_TIMESTAMP: &str = "lifeline:sessionTimestamp";
}

/// Minimal user info stored in the session, decoupled from the auth
/// provider's full user object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSession {
    pub uid: String,
}

/// Tokens used for authenticated API access and session refresh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthTokens {
    pub id_token: Option<String>,
    pub last_refresh: DateTime<Utc>,
}

/// Full session payload persisted in local storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionData {
    pub user: UserSession,
    pub tokens: AuthTokens,
    /// When this session was created or last stored.
    pub timestamp: DateTime<Utc>,
}

/// Sessions older than this are expired.
const SESSION_TTL_DAYS: i64 = 7;

/// Auth-session cache with lazy expiry.
pub struct SessionStore {
    storage: Arc<dyn KeyValueStore>,
}

impl SessionStore {
    pub fn new(storage: Arc<dyn KeyValueStore>) -> Self {
        Self { storage }
    }

    /// Persist a session for `uid`, overwriting any prior record. The
    /// record's timestamp is set to now.
    pub async fn store(&self, uid: &str, id_token: Option<&str>) -> Result<(), StorageError> {
        let now = Utc::now();
        let session = SessionData {
            user: UserSession {
                uid: uid.to_string(),
            },
            tokens: AuthTokens {
                id_token: id_token.map(str::to_string),
                last_refresh: now,
            },
            timestamp: now,
        };

        let serialized = serde_json::to_string(&session)?;
        self.storage.set(keys::USER_DATA, &serialized).await?;
        debug!(uid, "session stored");
        Ok(())
    }

    /// Read the stored session. Absent records and records older than seven
    /// days read as `None`; an expired record is deleted as a side effect.
    pub async fn get(&self) -> Result<Option<SessionData>, StorageError> {
        let Some(raw) = self.storage.get(keys::USER_DATA).await? else {
            return Ok(None);
        };

        let session: SessionData = serde_json::from_str(&raw)?;

        let age = Utc::now() - session.timestamp;
        if age > Duration::days(SESSION_TTL_DAYS) {
            debug!("stored session expired, clearing");
            self.clear().await?;
            return Ok(None);
        }

        Ok(Some(session))
    }

    /// Just the user sub-record, if a valid session exists.
    pub async fn get_user(&self) -> Result<Option<UserSession>, StorageError> {
        Ok(self.get().await?.map(|s| s.user))
    }

    /// Whether a non-expired session exists.
    pub async fn has_valid(&self) -> Result<bool, StorageError> {
        Ok(self.get().await?.is_some())
    }

    /// Delete the session record and related keys. Idempotent.
    pub async fn clear(&self) -> Result<(), StorageError> {
        self.storage.delete(keys::USER_DATA).await?;
        self.storage.delete(keys::AUTH_TOKENS).await?;
        self.storage.delete(keys::SESSION_TIMESTAMP).await?;
        Ok(())
    }
}
