//! Media device management — acquire, toggle, switch, release.
//!
//! The capture stream is owned exclusively by the call session through the
//! [`MediaDeviceManager`]; the frame sender and the local preview only read
//! from it and may never stop or replace it themselves. Actual device I/O
//! sits behind the [`MediaBackend`] trait; [`synthetic`] provides the test
//! pattern backend used by the harness and tests.

pub mod synthetic;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::CallError;

/// A raw RGB8 frame (len == width * height * 3).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RgbFrame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl RgbFrame {
    pub fn filled(width: u32, height: u32, rgb: [u8; 3]) -> Self {
        let mut data = Vec::with_capacity((width * height * 3) as usize);
        for _ in 0..width * height {
            data.extend_from_slice(&rgb);
        }
        Self {
            width,
            height,
            data,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Requested capture parameters.
#[derive(Debug, Clone)]
pub struct MediaConstraints {
    pub video: bool,
    pub audio: bool,
    /// Preferred device id; `None` means the backend default.
    pub preferred_device: Option<String>,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            video: true,
            audio: true,
            preferred_device: None,
            width: 320,
            height: 240,
            fps: 15,
        }
    }
}

impl MediaConstraints {
    /// Relaxed fallback used for the single automatic retry: drop the
    /// optional device preference and fall back to video-only.
    pub fn relaxed(&self) -> Self {
        Self {
            audio: false,
            preferred_device: None,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub id: String,
    pub label: String,
}

/// A live local video track. The producer task checks the enabled flag
/// before publishing; the token is the capture stream's root, so stopping
/// the track tears the producer down with it.
#[derive(Debug)]
pub struct VideoTrack {
    enabled: Arc<AtomicBool>,
    frames: watch::Receiver<RgbFrame>,
    cancel: CancellationToken,
}

impl VideoTrack {
    pub(crate) fn new(
        frames: watch::Receiver<RgbFrame>,
        enabled: Arc<AtomicBool>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            enabled,
            frames,
            cancel,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, on: bool) {
        self.enabled.store(on, Ordering::Relaxed);
    }

    /// Latest-frame feed; readers always see the most recent sample.
    pub fn frames(&self) -> watch::Receiver<RgbFrame> {
        self.frames.clone()
    }

    pub(crate) fn enabled_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.enabled)
    }

    fn stop(&self) {
        self.cancel.cancel();
    }
}

/// Lightly specified audio counterpart: mute state only.
#[derive(Debug)]
pub struct AudioTrack {
    enabled: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl AudioTrack {
    pub(crate) fn new(enabled: Arc<AtomicBool>, cancel: CancellationToken) -> Self {
        Self { enabled, cancel }
    }

    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, on: bool) {
        self.enabled.store(on, Ordering::Relaxed);
    }

    fn stop(&self) {
        self.cancel.cancel();
    }
}

/// The acquired camera/microphone pair.
#[derive(Debug)]
pub struct CaptureStream {
    pub video: Option<VideoTrack>,
    pub audio: Option<AudioTrack>,
}

impl CaptureStream {
    /// Stop every track. Only the owning manager calls this.
    fn stop(&self) {
        if let Some(video) = &self.video {
            video.stop();
        }
        if let Some(audio) = &self.audio {
            audio.stop();
        }
    }
}

/// Device acquisition backend.
#[async_trait]
pub trait MediaBackend: Send + Sync {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<CaptureStream, CallError>;
    async fn list_devices(&self) -> Vec<DeviceInfo>;
}

/// Exclusive owner of the local capture stream.
pub struct MediaDeviceManager {
    backend: Arc<dyn MediaBackend>,
    constraints: MediaConstraints,
    current: Option<CaptureStream>,
}

impl MediaDeviceManager {
    pub fn new(backend: Arc<dyn MediaBackend>, constraints: MediaConstraints) -> Self {
        Self {
            backend,
            constraints,
            current: None,
        }
    }

    /// Acquire the capture stream, retrying once with relaxed constraints
    /// before surfacing the failure.
    pub async fn acquire(&mut self) -> Result<(), CallError> {
        self.release();
        let stream = match self.backend.acquire(&self.constraints).await {
            Ok(stream) => stream,
            Err(first) => {
                let relaxed = self.constraints.relaxed();
                tracing::warn!(
                    "media acquisition failed ({first}), retrying with relaxed constraints"
                );
                self.backend.acquire(&relaxed).await.map_err(|second| {
                    tracing::error!("relaxed media acquisition also failed: {second}");
                    second
                })?
            }
        };
        self.current = Some(stream);
        Ok(())
    }

    pub fn stream(&self) -> Option<&CaptureStream> {
        self.current.as_ref()
    }

    pub fn video_track(&self) -> Option<&VideoTrack> {
        self.current.as_ref().and_then(|s| s.video.as_ref())
    }

    /// Flip the camera on/off; returns the new state.
    pub fn toggle_video(&self) -> Option<bool> {
        let video = self.video_track()?;
        let next = !video.enabled();
        video.set_enabled(next);
        tracing::info!("camera {}", if next { "enabled" } else { "disabled" });
        Some(next)
    }

    /// Flip the microphone on/off; returns the new state.
    pub fn toggle_audio(&self) -> Option<bool> {
        let audio = self.current.as_ref()?.audio.as_ref()?;
        let next = !audio.enabled();
        audio.set_enabled(next);
        tracing::info!("microphone {}", if next { "enabled" } else { "disabled" });
        Some(next)
    }

    /// Re-acquire with a different camera. The old stream keeps running
    /// until the new one is live, then stops.
    pub async fn switch_device(&mut self, device_id: &str) -> Result<(), CallError> {
        let mut constraints = self.constraints.clone();
        constraints.preferred_device = Some(device_id.to_string());
        let stream = self.backend.acquire(&constraints).await?;
        self.constraints = constraints;
        if let Some(old) = self.current.replace(stream) {
            old.stop();
        }
        Ok(())
    }

    pub async fn list_devices(&self) -> Vec<DeviceInfo> {
        self.backend.list_devices().await
    }

    /// Stop all local media tracks and drop the stream.
    pub fn release(&mut self) {
        if let Some(stream) = self.current.take() {
            stream.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Backend that fails a configurable number of times, recording the
    /// constraints it was asked for.
    struct FlakyBackend {
        failures_left: Mutex<u32>,
        seen: Mutex<Vec<MediaConstraints>>,
        error: fn() -> CallError,
    }

    impl FlakyBackend {
        fn new(failures: u32, error: fn() -> CallError) -> Self {
            Self {
                failures_left: Mutex::new(failures),
                seen: Mutex::new(Vec::new()),
                error,
            }
        }
    }

    #[async_trait]
    impl MediaBackend for FlakyBackend {
        async fn acquire(
            &self,
            constraints: &MediaConstraints,
        ) -> Result<CaptureStream, CallError> {
            self.seen.lock().unwrap().push(constraints.clone());
            let mut left = self.failures_left.lock().unwrap();
            if *left > 0 {
                *left -= 1;
                return Err((self.error)());
            }
            let (_, rx) = watch::channel(RgbFrame::default());
            Ok(CaptureStream {
                video: Some(VideoTrack::new(
                    rx,
                    Arc::new(AtomicBool::new(true)),
                    CancellationToken::new(),
                )),
                audio: None,
            })
        }

        async fn list_devices(&self) -> Vec<DeviceInfo> {
            Vec::new()
        }
    }

    #[tokio::test]
    async fn retries_once_with_relaxed_constraints() {
        let backend = Arc::new(FlakyBackend::new(1, || CallError::MediaDeviceBusy));
        let mut manager = MediaDeviceManager::new(backend.clone(), MediaConstraints {
            preferred_device: Some("cam-7".into()),
            ..MediaConstraints::default()
        });

        manager.acquire().await.unwrap();
        assert!(manager.stream().is_some());

        let seen = backend.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        // First attempt carries the original constraints.
        assert_eq!(seen[0].preferred_device.as_deref(), Some("cam-7"));
        assert!(seen[0].audio);
        // Retry drops the device preference and falls back to video-only.
        assert_eq!(seen[1].preferred_device, None);
        assert!(!seen[1].audio);
        assert!(seen[1].video);
    }

    #[tokio::test]
    async fn surfaces_failure_after_one_retry() {
        let backend = Arc::new(FlakyBackend::new(5, || CallError::MediaPermissionDenied));
        let mut manager = MediaDeviceManager::new(backend.clone(), MediaConstraints::default());

        let err = manager.acquire().await.unwrap_err();
        assert!(matches!(err, CallError::MediaPermissionDenied));
        // Exactly two attempts, never more.
        assert_eq!(backend.seen.lock().unwrap().len(), 2);
        assert!(manager.stream().is_none());
    }

    #[tokio::test]
    async fn toggle_video_flips_track_state() {
        let backend = Arc::new(FlakyBackend::new(0, || CallError::MediaDeviceBusy));
        let mut manager = MediaDeviceManager::new(backend, MediaConstraints::default());
        manager.acquire().await.unwrap();

        assert_eq!(manager.toggle_video(), Some(false));
        assert!(!manager.video_track().unwrap().enabled());
        assert_eq!(manager.toggle_video(), Some(true));
    }

    #[tokio::test(start_paused = true)]
    async fn switch_device_stops_the_replaced_producer() {
        let backend = super::synthetic::SyntheticBackend::new();
        let mut manager = MediaDeviceManager::new(backend, MediaConstraints::default());
        manager.acquire().await.unwrap();
        let mut old_frames = manager.video_track().unwrap().frames();
        old_frames.changed().await.unwrap();
        old_frames.borrow_and_update();

        manager.switch_device("synthetic-0").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_secs(2)).await;

        // The old generator shut down with its stream; a reader of the
        // replaced feed sees no fresh frames.
        old_frames.borrow_and_update();
        assert!(old_frames.changed().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn release_stops_the_producer() {
        let backend = super::synthetic::SyntheticBackend::new();
        let mut manager = MediaDeviceManager::new(backend, MediaConstraints::default());
        manager.acquire().await.unwrap();
        let mut frames = manager.video_track().unwrap().frames();
        frames.changed().await.unwrap();

        manager.release();
        tokio::time::sleep(std::time::Duration::from_secs(2)).await;
        frames.borrow_and_update();
        assert!(frames.changed().await.is_err());
    }

    #[tokio::test]
    async fn switch_device_keeps_old_stream_on_failure() {
        let backend = super::synthetic::SyntheticBackend::new();
        let mut manager = MediaDeviceManager::new(backend, MediaConstraints::default());
        manager.acquire().await.unwrap();

        let err = manager.switch_device("no-such-camera").await.unwrap_err();
        assert!(matches!(err, CallError::MediaDeviceNotFound));
        assert!(manager.stream().is_some());

        manager.switch_device("synthetic-0").await.unwrap();
        assert!(manager.video_track().is_some());
    }

    #[tokio::test]
    async fn release_drops_stream() {
        let backend = Arc::new(FlakyBackend::new(0, || CallError::MediaDeviceBusy));
        let mut manager = MediaDeviceManager::new(backend, MediaConstraints::default());
        manager.acquire().await.unwrap();
        manager.release();
        assert!(manager.stream().is_none());
        assert_eq!(manager.toggle_video(), None);
    }
}
