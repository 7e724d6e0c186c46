//! The emergency session coordinator.
//!
//! Owns the single active [`EmergencySession`] and drives its lifecycle:
//! creation (online or offline), the side-effect sequence around it,
//! status transitions via the declared table, the append-only audit trail,
//! and teardown.
//!
//! Collaborators are injected, never ambient: the document store, auth and
//! connectivity probes, the location tracker, the audio capture service,
//! and the notification dispatcher.
//!
//! # Failure isolation
//!
//! Each step of the creation side-effect sequence is independently
//! best-effort. A tracker that cannot start must not prevent audio capture;
//! an unreachable responder channel must not prevent volunteer fan-out.
//! Only the primary record write can fail creation, and even that falls
//! back to the offline path.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::audio::AudioCapture;
use crate::backend::{AuthProvider, ConnectivityProbe, DocumentStore, SessionPatch};
use crate::error::CoordinatorError;
use crate::location::LocationTracker;
use crate::model::{
    CreateSessionParams, EmergencySession, EmergencyStatus, EmergencyType, EmergencyUpdate,
    LocationFix, OFFLINE_USER, SessionMetadata, TransitionEffect, UpdateDraft, UpdateKind,
    UserProfile, next_offline_id, next_update_id,
};
use crate::notify::NotificationDispatcher;

/// Tunables for the coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Radius for volunteer fan-out, in meters.
    pub volunteer_radius_m: f64,

    /// Stamped into session metadata.
    pub app_version: Option<String>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            volunteer_radius_m: 1_000.0,
            app_version: Some(env!("CARGO_PKG_VERSION").to_string()),
        }
    }
}

struct ActiveSlot {
    session: EmergencySession,
    watch_task: Option<JoinHandle<()>>,
}

/// Coordinator for the emergency session lifecycle.
pub struct Coordinator {
    store: Arc<dyn DocumentStore>,
    auth: Arc<dyn AuthProvider>,
    connectivity: Arc<dyn ConnectivityProbe>,
    location: Arc<LocationTracker>,
    audio: Arc<AudioCapture>,
    notifier: Arc<NotificationDispatcher>,
    config: CoordinatorConfig,
    active: Arc<Mutex<Option<ActiveSlot>>>,
}

impl Coordinator {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        auth: Arc<dyn AuthProvider>,
        connectivity: Arc<dyn ConnectivityProbe>,
        location: Arc<LocationTracker>,
        audio: Arc<AudioCapture>,
        notifier: Arc<NotificationDispatcher>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            store,
            auth,
            connectivity,
            location,
            audio,
            notifier,
            config,
            active: Arc::new(Mutex::new(None)),
        }
    }

    /// Create a new emergency session and run the side-effect sequence.
    ///
    /// Offline, or when the primary record write fails, creation falls back
    /// to a local-only session: location and audio capture still run, and
    /// remote notification dispatch is deferred rather than attempted.
    pub async fn create_emergency_session(
        &self,
        params: CreateSessionParams,
    ) -> Result<String, CoordinatorError> {
        {
            let active = self.active.lock().await;
            if let Some(slot) = active.as_ref() {
                return Err(CoordinatorError::SessionAlreadyActive(
                    slot.session.id.clone(),
                ));
            }
        }

        let emergency_type = EmergencyType::parse(&params.emergency_type);
        info!(
            emergency_type = emergency_type.label(),
            latitude = params.location.latitude,
            longitude = params.location.longitude,
            "creating emergency session"
        );

        if !self.connectivity.is_online().await {
            warn!("no connectivity, creating offline session");
            return self.create_offline_session(params, emergency_type).await;
        }

        let Some(uid) = self.auth.current_uid() else {
            return Err(CoordinatorError::AuthRequired);
        };

        let priority = emergency_type.priority();
        let profile = match self.store.get_user_profile(&uid).await {
            Ok(Some(profile)) => profile,
            Ok(None) => UserProfile::anonymous(),
            Err(e) => {
                warn!(error = %e, "profile fetch failed, using placeholder");
                UserProfile::anonymous()
            }
        };

        let now = Utc::now();
        let seed = build_update(
            UpdateKind::StatusChange,
            format!("{} emergency reported", emergency_type.label()),
            &uid,
            None,
            now,
        );

        let mut record = EmergencySession {
            id: String::new(),
            emergency_type,
            status: EmergencyStatus::Active,
            priority,
            reported_by: uid.clone(),
            user_profile: Some(profile),
            location: params.location.geo_point(),
            location_data: params.location.clone(),
            address: None,
            audio_recording: None,
            description: params.description.clone(),
            updates: vec![seed],
            created_at: now,
            last_updated: now,
            acknowledged_at: None,
            resolved_at: None,
            metadata: self.build_metadata(params.metadata.clone(), false),
        };

        let id = match self.store.create_emergency(&record).await {
            Ok(id) => id,
            Err(e) => {
                warn!(error = %e, "primary session write failed, falling back to offline mode");
                return self.create_offline_session(params, emergency_type).await;
            }
        };
        record.id = id.clone();
        info!(session_id = id.as_str(), "emergency session created");

        *self.active.lock().await = Some(ActiveSlot {
            session: record,
            watch_task: None,
        });

        self.run_side_effects(&id, emergency_type, &params.location, &uid)
            .await;

        Ok(id)
    }

    /// Local-only session creation. Device-side capture still runs; remote
    /// dispatch is deferred until connectivity returns.
    async fn create_offline_session(
        &self,
        params: CreateSessionParams,
        emergency_type: EmergencyType,
    ) -> Result<String, CoordinatorError> {
        let uid = self
            .auth
            .current_uid()
            .unwrap_or_else(|| OFFLINE_USER.to_string());
        let now = Utc::now();
        let id = next_offline_id(now);

        let seed = build_update(
            UpdateKind::StatusChange,
            format!("{} emergency reported (OFFLINE MODE)", emergency_type.label()),
            &uid,
            None,
            now,
        );

        let record = EmergencySession {
            id: id.clone(),
            emergency_type,
            status: EmergencyStatus::Active,
            priority: emergency_type.priority(),
            reported_by: uid,
            user_profile: None,
            location: params.location.geo_point(),
            location_data: params.location.clone(),
            address: None,
            audio_recording: None,
            description: params.description,
            updates: vec![seed],
            created_at: now,
            last_updated: now,
            acknowledged_at: None,
            resolved_at: None,
            metadata: self.build_metadata(params.metadata, true),
        };

        *self.active.lock().await = Some(ActiveSlot {
            session: record,
            watch_task: None,
        });

        // Location and audio capture work without connectivity.
        if !self.location.start_emergency_tracking(&id).await {
            warn!(session_id = id.as_str(), "offline location tracking unavailable");
        }
        match self
            .audio
            .start_emergency_recording(&id, emergency_type)
            .await
        {
            Ok(true) => {}
            Ok(false) => warn!(session_id = id.as_str(), "offline recording skipped"),
            Err(e) => warn!(session_id = id.as_str(), error = %e, "offline recording failed"),
        }

        info!(
            session_id = id.as_str(),
            "offline emergency session created; responder dispatch deferred until connectivity returns"
        );
        Ok(id)
    }

    /// The creation side-effect sequence. Steps are isolated: a failure in
    /// one never prevents the remaining steps from running.
    async fn run_side_effects(
        &self,
        id: &str,
        emergency_type: EmergencyType,
        location: &LocationFix,
        uid: &str,
    ) {
        // 1. Location tracking
        if self.location.start_emergency_tracking(id).await {
            self.append_best_effort(
                id,
                UpdateDraft::new(UpdateKind::LocationUpdate, "Location tracking activated")
                    .with_data(json!({ "tracking_active": true })),
            )
            .await;
        } else {
            warn!(session_id = id, "location tracking could not be started");
        }

        // 2. Audio recording
        match self
            .audio
            .start_emergency_recording(id, emergency_type)
            .await
        {
            Ok(true) => {
                self.append_best_effort(
                    id,
                    UpdateDraft::new(UpdateKind::AudioReceived, "Audio recording started")
                        .with_data(json!({ "recording_active": true })),
                )
                .await;
            }
            Ok(false) => warn!(session_id = id, "audio recording skipped (permission denied)"),
            Err(e) => warn!(session_id = id, error = %e, "audio recording failed to start"),
        }

        // 3. Responder channel; success acknowledges the session.
        if self.notifier.alert_responders(emergency_type, location, id).await {
            if let Err(e) = self
                .update_status(id, EmergencyStatus::Acknowledged, Some("Security team notified"))
                .await
            {
                warn!(session_id = id, error = %e, "failed to acknowledge session");
            }
        } else {
            warn!(session_id = id, "responder channel alert failed");
        }

        // 4. Volunteer fan-out, fire-and-forget.
        {
            let notifier = Arc::clone(&self.notifier);
            let location = location.clone();
            let id = id.to_string();
            let radius = self.config.volunteer_radius_m;
            tokio::spawn(async move {
                notifier
                    .notify_nearby_volunteers(&location, emergency_type, &id, radius)
                    .await;
            });
        }

        // 5. Emergency-contact fan-out, fire-and-forget.
        {
            let notifier = Arc::clone(&self.notifier);
            let location = location.clone();
            let id = id.to_string();
            let uid = uid.to_string();
            tokio::spawn(async move {
                notifier
                    .notify_emergency_contacts(&uid, emergency_type, &location, &id)
                    .await;
            });
        }

        // 6. Live-update mirroring
        self.attach_watch(id).await;
    }

    /// Mirror remote changes to the session record into the in-memory copy.
    async fn attach_watch(&self, id: &str) {
        let rx = match self.store.watch_emergency(id).await {
            Ok(rx) => rx,
            Err(e) => {
                warn!(session_id = id, error = %e, "failed to attach live-update listener");
                return;
            }
        };

        let active = Arc::clone(&self.active);
        let session_id = id.to_string();
        let task = tokio::spawn(async move {
            let mut rx = rx;
            while let Some(remote) = rx.recv().await {
                let mut guard = active.lock().await;
                if let Some(slot) = guard.as_mut().filter(|s| s.session.id == session_id) {
                    merge_remote(&mut slot.session, remote);
                }
            }
            debug!(session_id, "live-update stream closed");
        });

        let mut guard = self.active.lock().await;
        match guard.as_mut().filter(|s| s.session.id == id) {
            Some(slot) => slot.watch_task = Some(task),
            // Session ended while we were attaching
            None => task.abort(),
        }
    }

    /// Drive a status transition through the declared table.
    ///
    /// Acting on an id that exists nowhere is a logged no-op. An illegal
    /// transition is a typed error. Entering `resolved` also tears the
    /// session down.
    pub async fn update_status(
        &self,
        id: &str,
        status: EmergencyStatus,
        message: Option<&str>,
    ) -> Result<(), CoordinatorError> {
        let (current, offline) = match self.current_status(id).await? {
            Some(state) => state,
            None => {
                warn!(session_id = id, "status update for unknown session ignored");
                return Ok(());
            }
        };

        let effects = current
            .transition_effects(status)
            .ok_or(CoordinatorError::InvalidTransition {
                from: current,
                to: status,
            })?;

        let now = Utc::now();
        let mut patch = SessionPatch::status(status);
        let mut stop_after = false;
        for effect in effects {
            match effect {
                TransitionEffect::StampAcknowledged => patch.acknowledged_at = Some(now),
                TransitionEffect::StampResolved => patch.resolved_at = Some(now),
                TransitionEffect::StopSession => stop_after = true,
            }
        }

        if !offline {
            self.store.patch_emergency(id, patch.clone()).await?;
        }

        {
            let mut guard = self.active.lock().await;
            if let Some(slot) = guard.as_mut().filter(|s| s.session.id == id) {
                slot.session.status = status;
                slot.session.last_updated = now;
                if let Some(at) = patch.acknowledged_at {
                    slot.session.acknowledged_at = Some(at);
                }
                if let Some(at) = patch.resolved_at {
                    slot.session.resolved_at = Some(at);
                }
            }
        }

        if let Some(message) = message {
            self.append_best_effort(
                id,
                UpdateDraft::new(
                    UpdateKind::StatusChange,
                    format!("Status: {} - {}", status.as_str(), message),
                ),
            )
            .await;
        }

        info!(session_id = id, status = status.as_str(), "session status updated");

        if stop_after {
            self.stop_emergency_session(id).await?;
        }

        Ok(())
    }

    /// Append to the session's audit trail. Entries get a generated id,
    /// timestamp, and actor; prior entries are never touched.
    pub async fn add_update(&self, id: &str, draft: UpdateDraft) -> Result<(), CoordinatorError> {
        let now = Utc::now();
        let actor = self
            .auth
            .current_uid()
            .unwrap_or_else(|| "system".to_string());
        let update = build_update(draft.kind, draft.message, &actor, draft.data, now);

        let mut guard = self.active.lock().await;
        if let Some(slot) = guard.as_mut().filter(|s| s.session.id == id) {
            slot.session.updates.push(update);
            slot.session.last_updated = now;
            let offline = slot.session.metadata.is_offline;
            let updates = slot.session.updates.clone();
            drop(guard);

            if !offline {
                // Wholesale rewrite of the array; ordering is preserved by
                // construction.
                self.store.put_updates(id, &updates).await?;
            }
            return Ok(());
        }
        drop(guard);

        // Not the active session: write through against the store.
        let Some(session) = self.store.get_emergency(id).await? else {
            warn!(session_id = id, "update for unknown session ignored");
            return Ok(());
        };
        let mut updates = session.updates;
        updates.push(update);
        self.store.put_updates(id, &updates).await?;
        Ok(())
    }

    /// Stop the session: finalize audio (attaching the upload result),
    /// stop tracking, detach the live-update listener, append the terminal
    /// update, and clear the active slot. Idempotent.
    pub async fn stop_emergency_session(&self, id: &str) -> Result<(), CoordinatorError> {
        let mut guard = self.active.lock().await;
        let Some(slot) = guard.as_mut().filter(|s| s.session.id == id) else {
            debug!(session_id = id, "stop with no matching active session is a no-op");
            return Ok(());
        };

        info!(session_id = id, "stopping emergency session");

        let emergency_type = slot.session.emergency_type;
        let offline = slot.session.metadata.is_offline;
        let actor = self
            .auth
            .current_uid()
            .unwrap_or_else(|| "system".to_string());

        // Finalize audio; an upload failure is logged, never blocks teardown.
        let mut audio_patch = None;
        match self
            .audio
            .stop_emergency_recording(id, emergency_type)
            .await
        {
            Ok(Some(result)) => {
                let attachment = crate::model::AudioAttachment {
                    url: result.download_url.clone(),
                    file_name: result.file_name,
                    uploaded_at: result.uploaded_at,
                };
                slot.session.audio_recording = Some(attachment.clone());
                slot.session.updates.push(build_update(
                    UpdateKind::AudioReceived,
                    "Audio recording uploaded and available for review".to_string(),
                    &actor,
                    Some(json!({ "audio_url": result.download_url })),
                    Utc::now(),
                ));
                audio_patch = Some(attachment);
            }
            Ok(None) => {}
            Err(e) => warn!(session_id = id, error = %e, "failed to finalize recording"),
        }

        self.location.stop_tracking();

        if let Some(task) = slot.watch_task.take() {
            task.abort();
        }

        let now = Utc::now();
        slot.session.updates.push(build_update(
            UpdateKind::Resolved,
            "Emergency session ended".to_string(),
            &actor,
            None,
            now,
        ));
        slot.session.last_updated = now;

        let updates = slot.session.updates.clone();
        *guard = None;
        drop(guard);

        if !offline {
            if let Some(attachment) = audio_patch {
                if let Err(e) = self
                    .store
                    .patch_emergency(id, SessionPatch::audio(attachment))
                    .await
                {
                    warn!(session_id = id, error = %e, "failed to persist audio attachment");
                }
            }
            if let Err(e) = self.store.put_updates(id, &updates).await {
                warn!(session_id = id, error = %e, "failed to persist final updates");
            }
        }

        info!(session_id = id, "emergency session stopped");
        Ok(())
    }

    /// Cancel: transition to `cancelled`, then tear down.
    pub async fn cancel_emergency(
        &self,
        id: &str,
        reason: Option<&str>,
    ) -> Result<(), CoordinatorError> {
        self.update_status(id, EmergencyStatus::Cancelled, reason)
            .await?;
        self.stop_emergency_session(id).await
    }

    /// Whether `user_id` has any session in an open status, counting a
    /// local-only offline session.
    pub async fn has_active_emergency(&self, user_id: &str) -> Result<bool, CoordinatorError> {
        {
            let guard = self.active.lock().await;
            if let Some(slot) = guard.as_ref() {
                if slot.session.reported_by == user_id && slot.session.status.is_open() {
                    return Ok(true);
                }
            }
        }
        Ok(self.store.has_open_emergency(user_id).await?)
    }

    /// Snapshot of the active in-memory session, if any.
    pub async fn active_session(&self) -> Option<EmergencySession> {
        self.active
            .lock()
            .await
            .as_ref()
            .map(|slot| slot.session.clone())
    }

    /// Fetch a session by id, preferring the live in-memory copy. An
    /// offline session is only visible here; it has no remote record.
    pub async fn get_emergency_session(
        &self,
        id: &str,
    ) -> Result<Option<EmergencySession>, CoordinatorError> {
        {
            let guard = self.active.lock().await;
            if let Some(slot) = guard.as_ref().filter(|s| s.session.id == id) {
                return Ok(Some(slot.session.clone()));
            }
        }
        Ok(self.store.get_emergency(id).await?)
    }

    /// Full shutdown: stop the active session and cascade cleanup to the
    /// tracker and audio capture.
    pub async fn cleanup(&self) -> Result<(), CoordinatorError> {
        let active_id = self
            .active
            .lock()
            .await
            .as_ref()
            .map(|slot| slot.session.id.clone());
        if let Some(id) = active_id {
            self.stop_emergency_session(&id).await?;
        }

        self.location.cleanup();
        self.audio.cleanup().await;
        Ok(())
    }

    async fn current_status(
        &self,
        id: &str,
    ) -> Result<Option<(EmergencyStatus, bool)>, CoordinatorError> {
        {
            let guard = self.active.lock().await;
            if let Some(slot) = guard.as_ref().filter(|s| s.session.id == id) {
                return Ok(Some((slot.session.status, slot.session.metadata.is_offline)));
            }
        }
        Ok(self
            .store
            .get_emergency(id)
            .await?
            .map(|s| (s.status, false)))
    }

    async fn append_best_effort(&self, id: &str, draft: UpdateDraft) {
        if let Err(e) = self.add_update(id, draft).await {
            warn!(session_id = id, error = %e, "failed to append session update");
        }
    }

    fn build_metadata(
        &self,
        extra: Option<serde_json::Map<String, serde_json::Value>>,
        is_offline: bool,
    ) -> SessionMetadata {
        SessionMetadata {
            is_offline,
            app_version: self.config.app_version.clone(),
            device_info: None,
            battery_level: None,
            extra: extra.unwrap_or_default(),
        }
    }
}

fn build_update(
    kind: UpdateKind,
    message: String,
    updated_by: &str,
    data: Option<serde_json::Value>,
    now: DateTime<Utc>,
) -> EmergencyUpdate {
    EmergencyUpdate {
        id: next_update_id(now),
        kind,
        message,
        timestamp: now,
        updated_by: updated_by.to_string(),
        data,
    }
}

/// Merge a remote record into the in-memory copy: last-write-wins on
/// whole-document fields, but the `updates` sequence is never truncated.
fn merge_remote(local: &mut EmergencySession, remote: EmergencySession) {
    let local_updates = std::mem::take(&mut local.updates);
    *local = remote;
    if local_updates.len() > local.updates.len() {
        local.updates = local_updates;
    }
}
