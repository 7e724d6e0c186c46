//! Exclusive audio capture tied to an emergency session.
//!
//! State machine is `idle -> recording -> idle`; the upload to blob storage
//! happens inside the stop transition, not as a separate state. Exactly one
//! recording may run at a time; a second start is rejected so the caller
//! learns its recording did not begin.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::AudioError;
use crate::model::EmergencyType;
use crate::observers::{ObserverSet, SubscriptionHandle};

/// A finished local recording, before upload.
#[derive(Debug, Clone)]
pub struct RecordedClip {
    pub bytes: Vec<u8>,
    /// File extension without the dot, e.g. `m4a`.
    pub extension: String,
}

/// Result of a successful stop-and-upload.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioUploadResult {
    pub download_url: String,
    pub file_name: String,
    pub uploaded_at: DateTime<Utc>,
}

/// Device microphone recording API.
#[async_trait]
pub trait AudioRecorder: Send + Sync {
    async fn request_permission(&self) -> bool;

    /// Begin recording. The returned channel carries metering levels until
    /// the recording stops.
    async fn start(&self) -> Result<mpsc::Receiver<f32>, AudioError>;

    /// Stop and finalize the recording.
    async fn stop(&self) -> Result<RecordedClip, AudioError>;
}

/// Object storage for recorded clips.
#[async_trait]
pub trait BlobStorage: Send + Sync {
    /// Upload `bytes` under `path` and return a durable download URL.
    async fn upload(&self, path: &str, bytes: Vec<u8>) -> anyhow::Result<String>;
}

struct ActiveRecording {
    session_id: String,
    meter_task: JoinHandle<()>,
}

/// Single-recording capture service with level fan-out and upload-on-stop.
pub struct AudioCapture {
    recorder: Arc<dyn AudioRecorder>,
    blobs: Arc<dyn BlobStorage>,
    observers: Arc<ObserverSet<f32>>,
    active: Mutex<Option<ActiveRecording>>,
}

impl AudioCapture {
    pub fn new(recorder: Arc<dyn AudioRecorder>, blobs: Arc<dyn BlobStorage>) -> Self {
        Self {
            recorder,
            blobs,
            observers: Arc::new(ObserverSet::new()),
            active: Mutex::new(None),
        }
    }

    /// Start the exclusive emergency recording.
    ///
    /// Returns `Ok(false)` when the microphone permission is denied and
    /// `Err(RecordingInProgress)` when a recording is already running.
    pub async fn start_emergency_recording(
        &self,
        session_id: &str,
        emergency_type: EmergencyType,
    ) -> Result<bool, AudioError> {
        let mut active = self.active.lock().await;
        if active.is_some() {
            return Err(AudioError::RecordingInProgress);
        }

        if !self.recorder.request_permission().await {
            warn!(session_id, "microphone permission denied, skipping recording");
            return Ok(false);
        }

        let mut meter_rx = self.recorder.start().await?;

        let observers = Arc::clone(&self.observers);
        let meter_task = tokio::spawn(async move {
            while let Some(level) = meter_rx.recv().await {
                observers.notify(&level);
            }
        });

        *active = Some(ActiveRecording {
            session_id: session_id.to_string(),
            meter_task,
        });

        info!(
            session_id,
            emergency_type = emergency_type.label(),
            "emergency recording started"
        );
        Ok(true)
    }

    /// Stop the active recording and upload it.
    ///
    /// `Ok(None)` when nothing was recording. An upload failure is reported
    /// as [`AudioError::UploadFailed`] so it cannot be mistaken for the
    /// no-op case.
    pub async fn stop_emergency_recording(
        &self,
        session_id: &str,
        emergency_type: EmergencyType,
    ) -> Result<Option<AudioUploadResult>, AudioError> {
        let mut active = self.active.lock().await;
        let Some(recording) = active.take() else {
            return Ok(None);
        };

        recording.meter_task.abort();
        if recording.session_id != session_id {
            warn!(
                requested = session_id,
                active = recording.session_id.as_str(),
                "stop requested for a different session id"
            );
        }

        let clip = self.recorder.stop().await?;

        let uploaded_at = Utc::now();
        let file_name = format!(
            "emergency-audio/{}-{}.{}",
            session_id,
            uploaded_at.timestamp_millis(),
            clip.extension
        );

        let download_url = self
            .blobs
            .upload(&file_name, clip.bytes)
            .await
            .map_err(|e| AudioError::UploadFailed(e.to_string()))?;

        info!(
            session_id,
            emergency_type = emergency_type.label(),
            file_name = file_name.as_str(),
            "emergency recording uploaded"
        );

        Ok(Some(AudioUploadResult {
            download_url,
            file_name,
            uploaded_at,
        }))
    }

    pub async fn is_recording(&self) -> bool {
        self.active.lock().await.is_some()
    }

    /// Register an observer for metering levels.
    pub fn subscribe_levels(
        &self,
        callback: impl Fn(&f32) + Send + Sync + 'static,
    ) -> SubscriptionHandle {
        self.observers.subscribe(callback)
    }

    pub fn unsubscribe_levels(&self, handle: SubscriptionHandle) {
        self.observers.unsubscribe(handle);
    }

    /// Stop any in-flight recording without uploading and clear observer
    /// state. Safe to call repeatedly.
    pub async fn cleanup(&self) {
        let mut active = self.active.lock().await;
        if let Some(recording) = active.take() {
            recording.meter_task.abort();
            if let Err(e) = self.recorder.stop().await {
                warn!(error = %e, "recorder stop during cleanup failed");
            }
        }
        self.observers.clear();
    }
}

/// Scriptable recorder for tests and the demo binary.
pub struct SimulatedRecorder {
    grant_permission: std::sync::atomic::AtomicBool,
    meter_tx: std::sync::Mutex<Option<mpsc::Sender<f32>>>,
    clip: std::sync::Mutex<RecordedClip>,
}

impl SimulatedRecorder {
    pub fn new() -> Self {
        Self {
            grant_permission: std::sync::atomic::AtomicBool::new(true),
            meter_tx: std::sync::Mutex::new(None),
            clip: std::sync::Mutex::new(RecordedClip {
                bytes: vec![0u8; 16],
                extension: "m4a".to_string(),
            }),
        }
    }

    pub fn deny_permission(&self) {
        self.grant_permission
            .store(false, std::sync::atomic::Ordering::SeqCst);
    }

    /// Feed a metering level into an active recording.
    pub async fn emit_level(&self, level: f32) {
        let tx = self.meter_tx.lock().unwrap().clone();
        if let Some(tx) = tx {
            let _ = tx.send(level).await;
        }
    }
}

impl Default for SimulatedRecorder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AudioRecorder for SimulatedRecorder {
    async fn request_permission(&self) -> bool {
        self.grant_permission
            .load(std::sync::atomic::Ordering::SeqCst)
    }

    async fn start(&self) -> Result<mpsc::Receiver<f32>, AudioError> {
        let (tx, rx) = mpsc::channel(16);
        *self.meter_tx.lock().unwrap() = Some(tx);
        Ok(rx)
    }

    async fn stop(&self) -> Result<RecordedClip, AudioError> {
        *self.meter_tx.lock().unwrap() = None;
        Ok(self.clip.lock().unwrap().clone())
    }
}

/// In-memory blob store for tests and the demo binary.
pub struct MemoryBlobs {
    uploads: std::sync::Mutex<Vec<String>>,
    fail_uploads: std::sync::atomic::AtomicBool,
}

impl MemoryBlobs {
    pub fn new() -> Self {
        Self {
            uploads: std::sync::Mutex::new(Vec::new()),
            fail_uploads: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn set_fail_uploads(&self, fail: bool) {
        self.fail_uploads
            .store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn uploaded_paths(&self) -> Vec<String> {
        self.uploads.lock().unwrap().clone()
    }
}

impl Default for MemoryBlobs {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BlobStorage for MemoryBlobs {
    async fn upload(&self, path: &str, _bytes: Vec<u8>) -> anyhow::Result<String> {
        if self.fail_uploads.load(std::sync::atomic::Ordering::SeqCst) {
            anyhow::bail!("simulated upload failure");
        }
        self.uploads.lock().unwrap().push(path.to_string());
        Ok(format!("https://blobs.local/{path}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn capture() -> (AudioCapture, Arc<SimulatedRecorder>, Arc<MemoryBlobs>) {
        let recorder = Arc::new(SimulatedRecorder::new());
        let blobs = Arc::new(MemoryBlobs::new());
        (
            AudioCapture::new(recorder.clone(), blobs.clone()),
            recorder,
            blobs,
        )
    }

    #[tokio::test]
    async fn test_permission_denied_returns_false() {
        let (capture, recorder, _) = capture();
        recorder.deny_permission();

        let started = capture
            .start_emergency_recording("em-1", EmergencyType::Fire)
            .await
            .unwrap();
        assert!(!started);
        assert!(!capture.is_recording().await);
    }

    #[tokio::test]
    async fn test_double_start_is_rejected() {
        let (capture, _, _) = capture();

        assert!(
            capture
                .start_emergency_recording("em-1", EmergencyType::Fire)
                .await
                .unwrap()
        );

        let err = capture
            .start_emergency_recording("em-1", EmergencyType::Fire)
            .await
            .unwrap_err();
        assert!(matches!(err, AudioError::RecordingInProgress));
    }

    #[tokio::test]
    async fn test_stop_without_recording_is_none() {
        let (capture, _, _) = capture();

        let result = capture
            .stop_emergency_recording("em-1", EmergencyType::Fire)
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_stop_uploads_under_session_path() {
        let (capture, _, blobs) = capture();

        capture
            .start_emergency_recording("em-1", EmergencyType::Fire)
            .await
            .unwrap();

        let result = capture
            .stop_emergency_recording("em-1", EmergencyType::Fire)
            .await
            .unwrap()
            .unwrap();

        assert!(result.file_name.starts_with("emergency-audio/em-1-"));
        assert!(result.file_name.ends_with(".m4a"));
        assert!(result.download_url.contains(&result.file_name));
        assert_eq!(blobs.uploaded_paths().len(), 1);
        assert!(!capture.is_recording().await);
    }

    #[tokio::test]
    async fn test_upload_failure_is_distinct_error() {
        let (capture, _, blobs) = capture();
        blobs.set_fail_uploads(true);

        capture
            .start_emergency_recording("em-1", EmergencyType::Fire)
            .await
            .unwrap();

        let err = capture
            .stop_emergency_recording("em-1", EmergencyType::Fire)
            .await
            .unwrap_err();
        assert!(matches!(err, AudioError::UploadFailed(_)));
    }

    #[tokio::test]
    async fn test_metering_fans_out_to_observers() {
        let (capture, recorder, _) = capture();

        let seen = Arc::new(AtomicUsize::new(0));
        let seen_cb = Arc::clone(&seen);
        capture.subscribe_levels(move |_| {
            seen_cb.fetch_add(1, Ordering::SeqCst);
        });

        capture
            .start_emergency_recording("em-1", EmergencyType::Medical)
            .await
            .unwrap();

        recorder.emit_level(-12.5).await;
        recorder.emit_level(-10.0).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cleanup_is_repeatable() {
        let (capture, _, _) = capture();

        capture
            .start_emergency_recording("em-1", EmergencyType::Fire)
            .await
            .unwrap();

        capture.cleanup().await;
        assert!(!capture.is_recording().await);

        // Second cleanup is a no-op
        capture.cleanup().await;
    }
}
