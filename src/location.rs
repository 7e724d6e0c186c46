//! Location tracking for emergency sessions.
//!
//! Wraps an injected [`DevicePositioning`] provider: one-shot fixes with
//! emergency-grade accuracy options, a continuous watch that mirrors each
//! reading into the session's persisted location, geocoding helpers, and
//! proximity search over volunteer candidates.
//!
//! Every permission or service denial degrades to a `false`/`None` return;
//! nothing in this module throws past its caller for a denied prompt.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::{DocumentStore, SessionPatch, Volunteer};
use crate::geo::{self, Ranked};
use crate::model::LocationFix;
use crate::observers::{ObserverSet, SubscriptionHandle};

/// Positioning accuracy requested from the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixAccuracy {
    /// Power-friendly accuracy for routine fixes.
    Balanced,
    /// Highest available accuracy, for emergencies.
    BestForNavigation,
}

/// Options for a one-shot fix.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FixOptions {
    pub accuracy: FixAccuracy,
    /// Maximum acceptable age of a cached fix. Zero means a fresh fix only.
    pub max_age: Duration,
    pub timeout: Duration,
}

impl FixOptions {
    /// Emergency fixes must be fresh and get the extended timeout.
    pub fn emergency() -> Self {
        Self {
            accuracy: FixAccuracy::BestForNavigation,
            max_age: Duration::ZERO,
            timeout: Duration::from_secs(30),
        }
    }

    pub fn normal() -> Self {
        Self {
            accuracy: FixAccuracy::Balanced,
            max_age: Duration::from_secs(60),
            timeout: Duration::from_secs(15),
        }
    }
}

/// Options for a continuous watch: a reading every `interval` or every
/// `min_distance_m` of movement, whichever triggers first.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WatchOptions {
    pub accuracy: FixAccuracy,
    pub interval: Duration,
    pub min_distance_m: f64,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            accuracy: FixAccuracy::BestForNavigation,
            interval: Duration::from_secs(5),
            min_distance_m: 10.0,
        }
    }
}

/// A one-shot fix plus its best-effort reverse-geocoded address.
#[derive(Debug, Clone, PartialEq)]
pub struct LocationResult {
    pub fix: LocationFix,
    pub address: Option<String>,
    pub is_emergency: bool,
}

/// Device positioning and geocoding APIs.
///
/// Geocoding lookups return `None` on failure since they are always
/// auxiliary to the primary fix.
#[async_trait]
pub trait DevicePositioning: Send + Sync {
    async fn services_enabled(&self) -> bool;

    async fn request_foreground_permission(&self) -> bool;

    async fn request_background_permission(&self) -> bool;

    /// One-shot fix; `None` on hard failure or timeout.
    async fn current_fix(&self, options: FixOptions) -> Option<LocationFix>;

    /// Continuous positioning. The provider owns the cadence described by
    /// `options` and closes the channel when the watch is cancelled
    /// device-side.
    async fn watch(&self, options: WatchOptions) -> Option<mpsc::Receiver<LocationFix>>;

    async fn reverse_geocode(&self, latitude: f64, longitude: f64) -> Option<String>;

    async fn geocode(&self, address: &str) -> Option<LocationFix>;
}

/// Continuous and one-shot positioning for the emergency core.
pub struct LocationTracker {
    device: Arc<dyn DevicePositioning>,
    store: Arc<dyn DocumentStore>,
    observers: Arc<ObserverSet<LocationFix>>,
    last_known: Arc<Mutex<Option<LocationFix>>>,
    watch_task: Mutex<Option<JoinHandle<()>>>,
    watch_options: WatchOptions,
}

impl LocationTracker {
    pub fn new(device: Arc<dyn DevicePositioning>, store: Arc<dyn DocumentStore>) -> Self {
        Self {
            device,
            store,
            observers: Arc::new(ObserverSet::new()),
            last_known: Arc::new(Mutex::new(None)),
            watch_task: Mutex::new(None),
            watch_options: WatchOptions::default(),
        }
    }

    pub fn with_watch_options(mut self, options: WatchOptions) -> Self {
        self.watch_options = options;
        self
    }

    /// Verify services and permissions. Returns `false` when location
    /// services are disabled or the foreground permission is denied;
    /// background denial only limits tracking and is logged.
    pub async fn initialize(&self) -> bool {
        if !self.device.services_enabled().await {
            warn!("location services are disabled");
            return false;
        }

        if !self.device.request_foreground_permission().await {
            warn!("foreground location permission denied");
            return false;
        }

        if !self.device.request_background_permission().await {
            warn!("background location permission denied, emergency tracking limited");
        }

        true
    }

    /// One-shot fix. Emergency fixes request the highest accuracy, refuse
    /// cached readings, use the extended timeout, and attach a best-effort
    /// address. Returns `None` on hard failure; callers keep a fallback.
    pub async fn current_location(&self, is_emergency: bool) -> Option<LocationResult> {
        if !self.initialize().await {
            return None;
        }

        let options = if is_emergency {
            FixOptions::emergency()
        } else {
            FixOptions::normal()
        };

        let fix = self.device.current_fix(options).await?;
        *self.last_known.lock().unwrap() = Some(fix.clone());

        let address = if is_emergency {
            // Address is context, not a requirement; a geocoder failure
            // never fails the fix.
            self.device
                .reverse_geocode(fix.latitude, fix.longitude)
                .await
        } else {
            None
        };

        info!(
            latitude = fix.latitude,
            longitude = fix.longitude,
            accuracy_m = fix.accuracy,
            is_emergency,
            "location obtained"
        );

        Some(LocationResult {
            fix,
            address,
            is_emergency,
        })
    }

    /// Begin continuous positioning for `session_id`. Idempotent: calling
    /// while already tracking is a no-op success. Each reading refreshes the
    /// last-known cache, notifies observers, and patches the persisted
    /// session location (best-effort).
    pub async fn start_emergency_tracking(&self, session_id: &str) -> bool {
        if self.is_tracking() {
            warn!(session_id, "already tracking, ignoring start");
            return true;
        }

        if !self.initialize().await {
            return false;
        }

        let Some(mut rx) = self.device.watch(self.watch_options).await else {
            warn!(session_id, "device watch unavailable");
            return false;
        };

        let observers = Arc::clone(&self.observers);
        let last_known = Arc::clone(&self.last_known);
        let store = Arc::clone(&self.store);
        let session_id = session_id.to_string();

        let task = tokio::spawn(async move {
            while let Some(fix) = rx.recv().await {
                *last_known.lock().unwrap() = Some(fix.clone());
                observers.notify(&fix);

                if let Err(e) = store
                    .patch_emergency(&session_id, SessionPatch::location(fix))
                    .await
                {
                    warn!(session_id, error = %e, "failed to persist location update");
                }
            }
            debug!(session_id, "watch channel closed");
        });

        *self.watch_task.lock().unwrap() = Some(task);
        info!("emergency location tracking started");
        true
    }

    /// Cancel the continuous watch. Safe to call when not tracking.
    pub fn stop_tracking(&self) {
        if let Some(task) = self.watch_task.lock().unwrap().take() {
            task.abort();
            info!("location tracking stopped");
        }
    }

    pub fn is_tracking(&self) -> bool {
        self.watch_task
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }

    /// Register an observer for continuous readings.
    pub fn subscribe(
        &self,
        callback: impl Fn(&LocationFix) + Send + Sync + 'static,
    ) -> SubscriptionHandle {
        self.observers.subscribe(callback)
    }

    pub fn unsubscribe(&self, handle: SubscriptionHandle) {
        self.observers.unsubscribe(handle);
    }

    pub fn last_known(&self) -> Option<LocationFix> {
        self.last_known.lock().unwrap().clone()
    }

    pub async fn reverse_geocode(&self, latitude: f64, longitude: f64) -> Option<String> {
        self.device.reverse_geocode(latitude, longitude).await
    }

    pub async fn geocode(&self, address: &str) -> Option<LocationFix> {
        self.device.geocode(address).await
    }

    /// Volunteers within `radius_m` of `location`, closest first.
    pub async fn find_nearby_volunteers(
        &self,
        location: &LocationFix,
        radius_m: f64,
    ) -> Vec<Ranked<Volunteer>> {
        let candidates = match self.store.available_volunteers().await {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!(error = %e, "volunteer lookup failed");
                return Vec::new();
            }
        };

        geo::within_radius(
            candidates,
            location.latitude,
            location.longitude,
            radius_m,
            |v| (v.location.latitude, v.location.longitude),
        )
    }

    /// Stop tracking and drop observer and cache state.
    pub fn cleanup(&self) {
        self.stop_tracking();
        self.observers.clear();
        *self.last_known.lock().unwrap() = None;
    }
}

/// Scriptable positioning provider for tests and the demo binary.
pub struct SimulatedPositioning {
    services_enabled: std::sync::atomic::AtomicBool,
    grant_foreground: std::sync::atomic::AtomicBool,
    grant_background: std::sync::atomic::AtomicBool,
    next_fix: Mutex<Option<LocationFix>>,
    last_fix_options: Mutex<Option<FixOptions>>,
    watch_tx: Mutex<Option<mpsc::Sender<LocationFix>>>,
    address: Mutex<Option<String>>,
}

impl SimulatedPositioning {
    pub fn new() -> Self {
        Self {
            services_enabled: std::sync::atomic::AtomicBool::new(true),
            grant_foreground: std::sync::atomic::AtomicBool::new(true),
            grant_background: std::sync::atomic::AtomicBool::new(true),
            next_fix: Mutex::new(None),
            last_fix_options: Mutex::new(None),
            watch_tx: Mutex::new(None),
            address: Mutex::new(None),
        }
    }

    pub fn set_services_enabled(&self, enabled: bool) {
        self.services_enabled
            .store(enabled, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn deny_foreground(&self) {
        self.grant_foreground
            .store(false, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn set_next_fix(&self, fix: LocationFix) {
        *self.next_fix.lock().unwrap() = Some(fix);
    }

    pub fn set_address(&self, address: &str) {
        *self.address.lock().unwrap() = Some(address.to_string());
    }

    /// Options passed to the most recent one-shot fix.
    pub fn last_fix_options(&self) -> Option<FixOptions> {
        *self.last_fix_options.lock().unwrap()
    }

    /// Push a reading into an active watch, as the device would.
    pub async fn emit(&self, fix: LocationFix) {
        let tx = self.watch_tx.lock().unwrap().clone();
        if let Some(tx) = tx {
            let _ = tx.send(fix).await;
        }
    }
}

impl Default for SimulatedPositioning {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DevicePositioning for SimulatedPositioning {
    async fn services_enabled(&self) -> bool {
        self.services_enabled
            .load(std::sync::atomic::Ordering::SeqCst)
    }

    async fn request_foreground_permission(&self) -> bool {
        self.grant_foreground
            .load(std::sync::atomic::Ordering::SeqCst)
    }

    async fn request_background_permission(&self) -> bool {
        self.grant_background
            .load(std::sync::atomic::Ordering::SeqCst)
    }

    async fn current_fix(&self, options: FixOptions) -> Option<LocationFix> {
        *self.last_fix_options.lock().unwrap() = Some(options);
        self.next_fix.lock().unwrap().clone()
    }

    async fn watch(&self, _options: WatchOptions) -> Option<mpsc::Receiver<LocationFix>> {
        let (tx, rx) = mpsc::channel(16);
        *self.watch_tx.lock().unwrap() = Some(tx);
        Some(rx)
    }

    async fn reverse_geocode(&self, _latitude: f64, _longitude: f64) -> Option<String> {
        self.address.lock().unwrap().clone()
    }

    async fn geocode(&self, _address: &str) -> Option<LocationFix> {
        self.next_fix.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryStore;
    use crate::model::{
        EmergencySession, EmergencyStatus, EmergencyType, Priority, SessionMetadata,
    };
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fix_at(lat: f64, lng: f64) -> LocationFix {
        LocationFix {
            latitude: lat,
            longitude: lng,
            accuracy: 5.0,
            altitude: None,
            heading: None,
            speed: None,
            timestamp: Utc::now(),
        }
    }

    async fn seeded_store() -> (Arc<MemoryStore>, String) {
        let store = Arc::new(MemoryStore::new());
        let fix = fix_at(3.1275, 101.6412);
        let now = Utc::now();
        let session = EmergencySession {
            id: String::new(),
            emergency_type: EmergencyType::Fire,
            status: EmergencyStatus::Active,
            priority: Priority::Critical,
            reported_by: "user-1".to_string(),
            user_profile: None,
            location: fix.geo_point(),
            location_data: fix,
            address: None,
            audio_recording: None,
            description: None,
            updates: vec![],
            created_at: now,
            last_updated: now,
            acknowledged_at: None,
            resolved_at: None,
            metadata: SessionMetadata::default(),
        };
        let id = store.create_emergency(&session).await.unwrap();
        (store, id)
    }

    #[tokio::test]
    async fn test_emergency_fix_options() {
        let device = Arc::new(SimulatedPositioning::new());
        device.set_next_fix(fix_at(3.1, 101.6));
        let store = Arc::new(MemoryStore::new());
        let tracker = LocationTracker::new(device.clone(), store);

        tracker.current_location(true).await.unwrap();

        let options = device.last_fix_options().unwrap();
        assert_eq!(options.accuracy, FixAccuracy::BestForNavigation);
        assert_eq!(options.max_age, Duration::ZERO);
        assert_eq!(options.timeout, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_normal_fix_options() {
        let device = Arc::new(SimulatedPositioning::new());
        device.set_next_fix(fix_at(3.1, 101.6));
        let store = Arc::new(MemoryStore::new());
        let tracker = LocationTracker::new(device.clone(), store);

        let result = tracker.current_location(false).await.unwrap();
        assert!(result.address.is_none());

        let options = device.last_fix_options().unwrap();
        assert_eq!(options.accuracy, FixAccuracy::Balanced);
        assert_eq!(options.timeout, Duration::from_secs(15));
    }

    #[tokio::test]
    async fn test_emergency_fix_attaches_address_best_effort() {
        let device = Arc::new(SimulatedPositioning::new());
        device.set_next_fix(fix_at(3.1, 101.6));
        device.set_address("Jalan Universiti, Cyberjaya");
        let store = Arc::new(MemoryStore::new());
        let tracker = LocationTracker::new(device, store);

        let result = tracker.current_location(true).await.unwrap();
        assert_eq!(result.address.as_deref(), Some("Jalan Universiti, Cyberjaya"));
    }

    #[tokio::test]
    async fn test_permission_denied_degrades_to_none() {
        let device = Arc::new(SimulatedPositioning::new());
        device.deny_foreground();
        let store = Arc::new(MemoryStore::new());
        let tracker = LocationTracker::new(device, store);

        assert!(tracker.current_location(true).await.is_none());
        assert!(!tracker.start_emergency_tracking("em-1").await);
    }

    #[tokio::test]
    async fn test_tracking_readings_fan_out() {
        let (store, id) = seeded_store().await;
        let device = Arc::new(SimulatedPositioning::new());
        let tracker = LocationTracker::new(device.clone(), store.clone());

        let seen = Arc::new(AtomicUsize::new(0));
        let seen_cb = Arc::clone(&seen);
        tracker.subscribe(move |_| {
            seen_cb.fetch_add(1, Ordering::SeqCst);
        });

        assert!(tracker.start_emergency_tracking(&id).await);

        device.emit(fix_at(3.13, 101.65)).await;
        device.emit(fix_at(3.14, 101.66)).await;
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(seen.load(Ordering::SeqCst), 2);
        let last = tracker.last_known().unwrap();
        assert_eq!(last.latitude, 3.14);

        // Persisted location followed the readings
        let record = store.get_emergency(&id).await.unwrap().unwrap();
        assert_eq!(record.location.latitude, 3.14);

        tracker.stop_tracking();
        assert!(!tracker.is_tracking());
    }

    #[tokio::test]
    async fn test_start_tracking_is_idempotent() {
        let (store, id) = seeded_store().await;
        let device = Arc::new(SimulatedPositioning::new());
        let tracker = LocationTracker::new(device, store);

        assert!(tracker.start_emergency_tracking(&id).await);
        assert!(tracker.start_emergency_tracking(&id).await);
        assert!(tracker.is_tracking());
    }

    #[tokio::test]
    async fn test_stop_when_not_tracking_is_noop() {
        let device = Arc::new(SimulatedPositioning::new());
        let store = Arc::new(MemoryStore::new());
        let tracker = LocationTracker::new(device, store);

        tracker.stop_tracking();
        tracker.stop_tracking();
        assert!(!tracker.is_tracking());
    }

    #[tokio::test]
    async fn test_find_nearby_volunteers_filters_by_radius() {
        let store = Arc::new(MemoryStore::new());
        store.insert_volunteer(Volunteer {
            id: "vol-1".to_string(),
            name: "Alex".to_string(),
            push_token: "tok-1".to_string(),
            location: crate::model::GeoPoint {
                latitude: 3.1280,
                longitude: 101.6412,
            },
            verified: true,
            available: true,
        });
        store.insert_volunteer(Volunteer {
            id: "vol-2".to_string(),
            name: "Sam".to_string(),
            push_token: "tok-2".to_string(),
            location: crate::model::GeoPoint {
                latitude: 3.5,
                longitude: 101.9,
            },
            verified: true,
            available: true,
        });
        // Unverified volunteers never surface
        store.insert_volunteer(Volunteer {
            id: "vol-3".to_string(),
            name: "Riley".to_string(),
            push_token: "tok-3".to_string(),
            location: crate::model::GeoPoint {
                latitude: 3.1276,
                longitude: 101.6412,
            },
            verified: false,
            available: true,
        });

        let device = Arc::new(SimulatedPositioning::new());
        let tracker = LocationTracker::new(device, store);

        let nearby = tracker
            .find_nearby_volunteers(&fix_at(3.1275, 101.6412), 1_000.0)
            .await;

        assert_eq!(nearby.len(), 1);
        assert_eq!(nearby[0].item.id, "vol-1");
    }
}
