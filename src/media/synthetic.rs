//! Synthetic capture backend producing a moving test pattern, used by the
//! loopback harness and tests in place of real camera hardware.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::{
    AudioTrack, CaptureStream, DeviceInfo, MediaBackend, MediaConstraints, RgbFrame, VideoTrack,
};
use crate::error::CallError;

const DEVICE_ID: &str = "synthetic-0";

/// Test pattern generator. Frames are a diagonal gradient whose phase
/// advances each tick, so successive frames are visibly distinct.
pub struct SyntheticBackend {
    /// When set, `acquire` fails once per call; used to exercise the
    /// relaxed-constraints retry path.
    deny: AtomicBool,
}

impl SyntheticBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            deny: AtomicBool::new(false),
        })
    }

    pub fn deny_next_acquire(&self) {
        self.deny.store(true, Ordering::Relaxed);
    }

    fn spawn_generator(
        &self,
        constraints: &MediaConstraints,
        enabled: Arc<AtomicBool>,
        cancel: CancellationToken,
    ) -> watch::Receiver<RgbFrame> {
        let (tx, rx) = watch::channel(RgbFrame::default());
        let width = constraints.width;
        let height = constraints.height;
        let period = Duration::from_millis(1000 / constraints.fps.max(1) as u64);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut phase = 0u32;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if !enabled.load(Ordering::Relaxed) {
                    continue;
                }
                phase = phase.wrapping_add(4);
                if tx.send(test_pattern(width, height, phase)).is_err() {
                    break;
                }
            }
            tracing::debug!("synthetic frame generator stopped");
        });
        rx
    }
}

fn test_pattern(width: u32, height: u32, phase: u32) -> RgbFrame {
    let mut data = Vec::with_capacity((width * height * 3) as usize);
    for y in 0..height {
        for x in 0..width {
            let v = (x + y + phase) as u8;
            data.push(v);
            data.push(v.wrapping_add(85));
            data.push(v.wrapping_add(170));
        }
    }
    RgbFrame {
        width,
        height,
        data,
    }
}

#[async_trait]
impl MediaBackend for SyntheticBackend {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<CaptureStream, CallError> {
        if self.deny.swap(false, Ordering::Relaxed) {
            return Err(CallError::MediaPermissionDenied);
        }
        if let Some(id) = &constraints.preferred_device {
            if id != DEVICE_ID {
                return Err(CallError::MediaDeviceNotFound);
            }
        }

        // One root token per stream; the generator listens on a child, the
        // tracks carry the root so stopping any of them stops the producer.
        let cancel = CancellationToken::new();
        let video = if constraints.video {
            let enabled = Arc::new(AtomicBool::new(true));
            let frames =
                self.spawn_generator(constraints, Arc::clone(&enabled), cancel.child_token());
            Some(VideoTrack::new(frames, enabled, cancel.clone()))
        } else {
            None
        };
        let audio = if constraints.audio {
            Some(AudioTrack::new(Arc::new(AtomicBool::new(true)), cancel))
        } else {
            None
        };
        Ok(CaptureStream { video, audio })
    }

    async fn list_devices(&self) -> Vec<DeviceInfo> {
        vec![DeviceInfo {
            id: DEVICE_ID.to_string(),
            label: "Synthetic test pattern".to_string(),
        }]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn generator_produces_distinct_frames() {
        let backend = SyntheticBackend::new();
        let stream = backend
            .acquire(&MediaConstraints {
                width: 16,
                height: 12,
                fps: 10,
                ..MediaConstraints::default()
            })
            .await
            .unwrap();
        let video = stream.video.unwrap();
        let mut frames = video.frames();

        frames.changed().await.unwrap();
        let first = frames.borrow_and_update().clone();
        frames.changed().await.unwrap();
        let second = frames.borrow_and_update().clone();

        assert_eq!(first.width, 16);
        assert_eq!(first.data.len(), 16 * 12 * 3);
        assert_ne!(first.data, second.data);
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_track_stops_publishing() {
        let backend = SyntheticBackend::new();
        let stream = backend.acquire(&MediaConstraints::default()).await.unwrap();
        let video = stream.video.unwrap();
        let mut frames = video.frames();
        frames.changed().await.unwrap();
        frames.borrow_and_update();

        video.set_enabled(false);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!frames.has_changed().unwrap());
    }

    #[tokio::test]
    async fn unknown_device_is_rejected() {
        let backend = SyntheticBackend::new();
        let err = backend
            .acquire(&MediaConstraints {
                preferred_device: Some("cam-9".into()),
                ..MediaConstraints::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::MediaDeviceNotFound));
    }

    #[tokio::test]
    async fn denied_acquire_fails_once() {
        let backend = SyntheticBackend::new();
        backend.deny_next_acquire();
        assert!(backend.acquire(&MediaConstraints::default()).await.is_err());
        assert!(backend.acquire(&MediaConstraints::default()).await.is_ok());
    }
}
