//! Lifeline demo runner.
//!
//! Wires the coordinator against the in-memory backend and simulated device
//! providers, then drives one emergency session through its lifecycle:
//! create, track, update, resolve. Useful for watching the orchestration
//! logs end to end without a device or a backend.

use std::env;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use lifeline::audio::{AudioCapture, MemoryBlobs, SimulatedRecorder};
use lifeline::backend::{DocumentStore, MemoryStore, StaticAuth, StaticConnectivity};
use lifeline::coordinator::{Coordinator, CoordinatorConfig};
use lifeline::gateways::{MemoryPushGateway, MemorySmsGateway};
use lifeline::location::{LocationTracker, SimulatedPositioning};
use lifeline::model::{CreateSessionParams, LocationFix, UserProfile};
use lifeline::notify::NotificationDispatcher;
use lifeline::session::SessionStore;
use lifeline::storage::SqliteKeyValue;

/// Default local database if not specified via environment variable.
const DEFAULT_DB_PATH: &str = "sqlite:lifeline.db?mode=rwc";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("lifeline=info".parse()?))
        .init();

    let db_url = env::var("LIFELINE_DATABASE_URL").unwrap_or_else(|_| DEFAULT_DB_PATH.to_string());
    let uid = env::var("LIFELINE_USER").unwrap_or_else(|_| "demo-user".to_string());

    info!(db_url = %db_url, uid = %uid, "starting Lifeline demo");

    // Auth-session cache over the local store
    let kv = Arc::new(SqliteKeyValue::new(&db_url).await?);
    let sessions = SessionStore::new(kv);
    sessions.store(&uid, Some("demo-token")).await?;
    info!(has_valid = sessions.has_valid().await?, "auth session cached");

    // Backend and device doubles
    let store = Arc::new(MemoryStore::new());
    store.insert_profile(
        &uid,
        UserProfile {
            name: "Demo Student".to_string(),
            phone: Some("+60123456789".to_string()),
            student_id: Some("S1234".to_string()),
        },
    );
    store.set_security_tokens(vec!["security-device-1".to_string()]);

    let device = Arc::new(SimulatedPositioning::new());
    let recorder = Arc::new(SimulatedRecorder::new());
    let blobs = Arc::new(MemoryBlobs::new());
    let push = Arc::new(MemoryPushGateway::new());
    let sms = Arc::new(MemorySmsGateway::new());

    let location = Arc::new(LocationTracker::new(device.clone(), store.clone()));
    let audio = Arc::new(AudioCapture::new(recorder, blobs));
    let notifier = Arc::new(NotificationDispatcher::new(
        store.clone(),
        push.clone(),
        sms.clone(),
    ));

    let coordinator = Coordinator::new(
        store.clone(),
        Arc::new(StaticAuth::signed_in(&uid)),
        Arc::new(StaticConnectivity::new(true)),
        location,
        audio,
        notifier,
        CoordinatorConfig::default(),
    );

    // Drive one session through its lifecycle
    let id = coordinator
        .create_emergency_session(CreateSessionParams {
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
            description: Some("Smoke reported near the library".to_string()),
            metadata: None,
        })
        .await?;

    // A couple of tracked readings
    for (lat, lng) in [(3.1277, 101.6413), (3.1280, 101.6415)] {
        device
            .emit(LocationFix {
                latitude: lat,
                longitude: lng,
                accuracy: 6.0,
                altitude: None,
                heading: None,
                speed: Some(1.2),
                timestamp: Utc::now(),
            })
            .await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    coordinator
        .update_status(&id, lifeline::model::EmergencyStatus::Responded, Some("Patrol en route"))
        .await?;
    coordinator
        .update_status(&id, lifeline::model::EmergencyStatus::Resolved, Some("All clear"))
        .await?;

    let record = store.get_emergency(&id).await?.expect("record exists");
    info!(
        session_id = %id,
        status = record.status.as_str(),
        updates = record.updates.len(),
        pushes = push.sent().len(),
        sms = sms.emergency_sent().len(),
        "session lifecycle complete"
    );

    coordinator.cleanup().await?;
    Ok(())
}
