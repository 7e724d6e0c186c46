//! Integration tests for the emergency session lifecycle.
//!
//! These drive the coordinator end to end over the in-memory backend and
//! simulated device providers: creation (online and offline), the
//! side-effect sequence, status transitions, live-update mirroring, and
//! teardown.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use lifeline::audio::{AudioCapture, MemoryBlobs, SimulatedRecorder};
use lifeline::backend::{DocumentStore, MemoryStore, StaticAuth, StaticConnectivity};
use lifeline::coordinator::{Coordinator, CoordinatorConfig};
use lifeline::error::CoordinatorError;
use lifeline::gateways::{MemoryPushGateway, MemorySmsGateway};
use lifeline::location::{LocationTracker, SimulatedPositioning};
use lifeline::model::{
    CreateSessionParams, EmergencyStatus, LocationFix, Priority, UpdateDraft, UpdateKind,
    UserProfile,
};
use lifeline::notify::NotificationDispatcher;

struct Harness {
    coordinator: Coordinator,
    store: Arc<MemoryStore>,
    device: Arc<SimulatedPositioning>,
    push: Arc<MemoryPushGateway>,
    sms: Arc<MemorySmsGateway>,
    connectivity: Arc<StaticConnectivity>,
}

fn harness_with_auth(auth: StaticAuth) -> Harness {
    let store = Arc::new(MemoryStore::new());
    store.insert_profile(
        "user-1",
        UserProfile {
            name: "Test Student".to_string(),
            phone: Some("+60123456789".to_string()),
            student_id: Some("S1001".to_string()),
        },
    );
    store.set_security_tokens(vec!["sec-token-1".to_string()]);

    let device = Arc::new(SimulatedPositioning::new());
    let recorder = Arc::new(SimulatedRecorder::new());
    let blobs = Arc::new(MemoryBlobs::new());
    let push = Arc::new(MemoryPushGateway::new());
    let sms = Arc::new(MemorySmsGateway::new());
    let connectivity = Arc::new(StaticConnectivity::new(true));

    let location = Arc::new(LocationTracker::new(device.clone(), store.clone()));
    let audio = Arc::new(AudioCapture::new(recorder, blobs));
    let notifier = Arc::new(NotificationDispatcher::new(
        store.clone(),
        push.clone(),
        sms.clone(),
    ));

    let coordinator = Coordinator::new(
        store.clone(),
        Arc::new(auth),
        connectivity.clone(),
        location,
        audio,
        notifier,
        CoordinatorConfig::default(),
    );

    Harness {
        coordinator,
        store,
        device,
        push,
        sms,
        connectivity,
    }
}

fn harness() -> Harness {
    harness_with_auth(StaticAuth::signed_in("user-1"))
}

fn fire_params() -> CreateSessionParams {
    CreateSessionParams {
        emergency_type: "FIRE".to_string(),
        location: LocationFix {
            latitude: 3.1275,
            longitude: 101.6412,
            accuracy: 8.0,
            altitude: None,
            heading: None,
            speed: None,
            timestamp: Utc::now(),
        },
        description: Some("smoke near the library".to_string()),
        metadata: None,
    }
}

#[tokio::test]
async fn test_online_creation_runs_full_protocol() {
    let h = harness();

    let id = h
        .coordinator
        .create_emergency_session(fire_params())
        .await
        .unwrap();

    assert!(!id.starts_with("offline-"));

    let record = h.store.get_emergency(&id).await.unwrap().unwrap();
    assert_eq!(record.priority, Priority::Critical);
    assert_eq!(record.reported_by, "user-1");
    assert_eq!(
        record.user_profile.as_ref().unwrap().name,
        "Test Student"
    );
    // Responder alert succeeded, so the session is acknowledged
    assert_eq!(record.status, EmergencyStatus::Acknowledged);
    assert!(record.acknowledged_at.is_some());
    assert!(!record.metadata.is_offline);

    // Seed update plus tracking/audio/status entries, in order
    assert!(record.updates.len() >= 4);
    assert_eq!(record.updates[0].kind, UpdateKind::StatusChange);
    assert!(record.updates[0].message.contains("FIRE emergency reported"));

    // Responder push went out; fire also gets the SMS side channel
    assert_eq!(h.push.sent().len(), 1);
    assert_eq!(h.sms.emergency_sent().len(), 1);

    h.coordinator.cleanup().await.unwrap();
}

#[tokio::test]
async fn test_tracked_readings_update_the_record() {
    let h = harness();
    let id = h
        .coordinator
        .create_emergency_session(fire_params())
        .await
        .unwrap();

    h.device
        .emit(LocationFix {
            latitude: 3.1300,
            longitude: 101.6500,
            accuracy: 5.0,
            altitude: None,
            heading: None,
            speed: Some(1.4),
            timestamp: Utc::now(),
        })
        .await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let record = h.store.get_emergency(&id).await.unwrap().unwrap();
    assert_eq!(record.location.latitude, 3.1300);
    assert_eq!(record.location_data.speed, Some(1.4));

    h.coordinator.cleanup().await.unwrap();
}

#[tokio::test]
async fn test_updates_are_append_only() {
    let h = harness();
    let id = h
        .coordinator
        .create_emergency_session(fire_params())
        .await
        .unwrap();

    let before = h.store.get_emergency(&id).await.unwrap().unwrap().updates;

    for i in 0..5 {
        h.coordinator
            .add_update(&id, UpdateDraft::new(UpdateKind::Message, format!("note {i}")))
            .await
            .unwrap();
    }

    let after = h.store.get_emergency(&id).await.unwrap().unwrap().updates;
    assert_eq!(after.len(), before.len() + 5);

    // Prior entries are byte-for-byte unchanged and order is call order
    assert_eq!(&after[..before.len()], &before[..]);
    for (i, update) in after[before.len()..].iter().enumerate() {
        assert_eq!(update.message, format!("note {i}"));
    }

    h.coordinator.cleanup().await.unwrap();
}

#[tokio::test]
async fn test_location_failure_does_not_block_creation() {
    let h = harness();
    // Location permission denied: tracking cannot start
    h.device.deny_foreground();

    let id = h
        .coordinator
        .create_emergency_session(fire_params())
        .await
        .unwrap();

    let session = h.coordinator.active_session().await.unwrap();
    assert_eq!(session.id, id);

    // Audio capture still started despite the tracker failure
    let record = h.store.get_emergency(&id).await.unwrap().unwrap();
    assert!(
        record
            .updates
            .iter()
            .any(|u| u.message == "Audio recording started")
    );
    assert!(
        !record
            .updates
            .iter()
            .any(|u| u.message == "Location tracking activated")
    );

    h.coordinator.cleanup().await.unwrap();
}

#[tokio::test]
async fn test_offline_fallback_never_dispatches_remotely() {
    let h = harness();
    h.connectivity.set_online(false);

    let id = h
        .coordinator
        .create_emergency_session(fire_params())
        .await
        .unwrap();

    assert!(id.starts_with("offline-"));

    let session = h.coordinator.active_session().await.unwrap();
    assert!(session.metadata.is_offline);
    assert_eq!(session.status, EmergencyStatus::Active);
    assert!(session.updates[0].message.contains("OFFLINE MODE"));

    // No remote record, no notification dispatch of any kind
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.store.get_emergency(&id).await.unwrap().is_none());
    assert!(h.push.sent().is_empty());
    assert!(h.sms.emergency_sent().is_empty());

    // The local-only record is still reachable by id
    let fetched = h
        .coordinator
        .get_emergency_session(&id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fetched.id, id);

    h.coordinator.cleanup().await.unwrap();
}

#[tokio::test]
async fn test_primary_write_failure_falls_back_to_offline() {
    let h = harness();
    h.store.set_fail_writes(true);

    let id = h
        .coordinator
        .create_emergency_session(fire_params())
        .await
        .unwrap();

    assert!(id.starts_with("offline-"));
    let session = h.coordinator.active_session().await.unwrap();
    assert!(session.metadata.is_offline);

    h.coordinator.cleanup().await.unwrap();
}

#[tokio::test]
async fn test_auth_required_for_online_creation() {
    let h = harness_with_auth(StaticAuth::signed_out());

    let err = h
        .coordinator
        .create_emergency_session(fire_params())
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinatorError::AuthRequired));
}

#[tokio::test]
async fn test_second_create_is_rejected_while_active() {
    let h = harness();
    let id = h
        .coordinator
        .create_emergency_session(fire_params())
        .await
        .unwrap();

    let err = h
        .coordinator
        .create_emergency_session(fire_params())
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinatorError::SessionAlreadyActive(active) if active == id));

    h.coordinator.cleanup().await.unwrap();
}

#[tokio::test]
async fn test_resolve_tears_down_and_attaches_audio() {
    let h = harness();
    let id = h
        .coordinator
        .create_emergency_session(fire_params())
        .await
        .unwrap();

    h.coordinator
        .update_status(&id, EmergencyStatus::Resolved, Some("all clear"))
        .await
        .unwrap();

    let record = h.store.get_emergency(&id).await.unwrap().unwrap();
    assert_eq!(record.status, EmergencyStatus::Resolved);
    assert!(record.resolved_at.is_some());

    // The recording was finalized and attached on teardown
    let audio = record.audio_recording.as_ref().unwrap();
    assert!(audio.file_name.starts_with(&format!("emergency-audio/{id}-")));
    assert!(
        record
            .updates
            .iter()
            .any(|u| u.kind == UpdateKind::AudioReceived && u.message.contains("uploaded"))
    );

    // Terminal update appended, session slot cleared
    assert_eq!(record.updates.last().unwrap().kind, UpdateKind::Resolved);
    assert!(h.coordinator.active_session().await.is_none());
}

#[tokio::test]
async fn test_stop_twice_is_a_noop() {
    let h = harness();
    let id = h
        .coordinator
        .create_emergency_session(fire_params())
        .await
        .unwrap();

    h.coordinator.stop_emergency_session(&id).await.unwrap();
    h.coordinator.stop_emergency_session(&id).await.unwrap();

    let record = h.store.get_emergency(&id).await.unwrap().unwrap();
    let terminal = record
        .updates
        .iter()
        .filter(|u| u.kind == UpdateKind::Resolved && u.message == "Emergency session ended")
        .count();
    assert_eq!(terminal, 1);
}

#[tokio::test]
async fn test_cancel_reaches_terminal_state() {
    let h = harness();
    let id = h
        .coordinator
        .create_emergency_session(fire_params())
        .await
        .unwrap();

    h.coordinator
        .cancel_emergency(&id, Some("false alarm"))
        .await
        .unwrap();

    let record = h.store.get_emergency(&id).await.unwrap().unwrap();
    assert_eq!(record.status, EmergencyStatus::Cancelled);
    assert!(
        record
            .updates
            .iter()
            .any(|u| u.message.contains("false alarm"))
    );
    assert!(h.coordinator.active_session().await.is_none());

    // Terminal states accept no further transitions
    let err = h
        .coordinator
        .update_status(&id, EmergencyStatus::Responded, None)
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinatorError::InvalidTransition { .. }));
}

#[tokio::test]
async fn test_has_active_emergency_tracks_open_statuses() {
    let h = harness();
    assert!(!h.coordinator.has_active_emergency("user-1").await.unwrap());

    let id = h
        .coordinator
        .create_emergency_session(fire_params())
        .await
        .unwrap();
    assert!(h.coordinator.has_active_emergency("user-1").await.unwrap());
    assert!(!h.coordinator.has_active_emergency("user-2").await.unwrap());

    h.coordinator
        .update_status(&id, EmergencyStatus::Resolved, None)
        .await
        .unwrap();
    assert!(!h.coordinator.has_active_emergency("user-1").await.unwrap());
}

#[tokio::test]
async fn test_offline_session_counts_as_active() {
    let h = harness();
    h.connectivity.set_online(false);

    h.coordinator
        .create_emergency_session(fire_params())
        .await
        .unwrap();

    // The offline record lives only in memory, yet still counts
    assert!(h.coordinator.has_active_emergency("user-1").await.unwrap());

    h.coordinator.cleanup().await.unwrap();
}

#[tokio::test]
async fn test_remote_changes_are_mirrored() {
    let h = harness();
    let id = h
        .coordinator
        .create_emergency_session(fire_params())
        .await
        .unwrap();

    // A responder console marks the session responded remotely
    h.store.remote_edit(&id, |record| {
        record.status = EmergencyStatus::Responded;
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let session = h.coordinator.active_session().await.unwrap();
    assert_eq!(session.status, EmergencyStatus::Responded);

    h.coordinator.cleanup().await.unwrap();
}

#[tokio::test]
async fn test_update_for_unknown_session_is_a_noop() {
    let h = harness();

    // No session exists: nothing happens, no error
    h.coordinator
        .update_status("missing", EmergencyStatus::Resolved, None)
        .await
        .unwrap();
    h.coordinator
        .add_update("missing", UpdateDraft::new(UpdateKind::Message, "hello"))
        .await
        .unwrap();
}
