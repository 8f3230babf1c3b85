//! Frame transport: outbound sampler/throttle and the inbound surface.
//!
//! Outbound, [`FrameSender`] samples the local video track on a short
//! interval but publishes at most one frame per `min_send_interval` of
//! wall-clock time, regardless of capture rate. Inbound, [`RemoteSurface`]
//! keeps only the most recent counterpart frame; there is no reordering or
//! buffering, a late frame simply replaces an earlier one.

pub mod codec;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::channel::{Channel, FrameMessage, Role, VIDEO_STREAM_EVENT};
use crate::config::CallConfig;
use crate::media::RgbFrame;

/// Publishes the local video track over the broadcast channel.
///
/// The loop stops when its token is cancelled; dropping the sender cancels
/// it, so a sender can never outlive the call session that created it.
pub struct FrameSender {
    cancel: CancellationToken,
    frames_sent: Arc<AtomicU64>,
}

impl FrameSender {
    pub fn spawn(
        channel: Arc<dyn Channel>,
        frames: watch::Receiver<RgbFrame>,
        enabled: Arc<AtomicBool>,
        connected: watch::Receiver<bool>,
        role: Role,
        config: CallConfig,
    ) -> Self {
        let cancel = CancellationToken::new();
        let frames_sent = Arc::new(AtomicU64::new(0));
        tokio::spawn(send_loop(
            channel,
            frames,
            enabled,
            connected,
            role,
            config,
            cancel.child_token(),
            Arc::clone(&frames_sent),
        ));
        Self {
            cancel,
            frames_sent,
        }
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for FrameSender {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[allow(clippy::too_many_arguments)]
async fn send_loop(
    channel: Arc<dyn Channel>,
    frames: watch::Receiver<RgbFrame>,
    enabled: Arc<AtomicBool>,
    connected: watch::Receiver<bool>,
    role: Role,
    config: CallConfig,
    cancel: CancellationToken,
    frames_sent: Arc<AtomicU64>,
) {
    let mut ticker = tokio::time::interval(config.sample_interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let min_send_interval = config.min_send_interval();
    let badge = role_badge(role);
    let mut last_sent: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if !*connected.borrow() || !enabled.load(Ordering::Relaxed) {
            continue;
        }
        // Wall-clock throttle; the sampler runs faster than we publish.
        if let Some(at) = last_sent {
            if at.elapsed() < min_send_interval {
                continue;
            }
        }
        let frame = frames.borrow().clone();
        if frame.is_empty() {
            continue;
        }
        let encoded = match codec::prepare(&frame, &config, Some(badge)) {
            Ok(encoded) => encoded,
            Err(e) => {
                tracing::warn!("frame encode failed: {e:#}");
                continue;
            }
        };
        let message = FrameMessage {
            sender_role: role,
            encoded_image: encoded,
            captured_at: chrono::Utc::now(),
        };
        let payload = match serde_json::to_value(&message) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!("frame payload serialization failed: {e}");
                continue;
            }
        };
        // One lost frame is harmless; the next tick carries a fresh one.
        if let Err(e) = channel.send(VIDEO_STREAM_EVENT, payload).await {
            tracing::warn!("frame publish failed: {e}");
            continue;
        }
        last_sent = Some(Instant::now());
        frames_sent.fetch_add(1, Ordering::Relaxed);
    }
    tracing::debug!("frame send loop stopped");
}

fn role_badge(role: Role) -> [u8; 3] {
    match role {
        Role::Host => [40, 120, 255],
        Role::Guest => [255, 160, 40],
    }
}

/// Where the counterpart paints. Which frame is painted, not which frame
/// arrived, is [`PaintOutcome`]'s distinction: a frame authored by the local
/// role is dropped before touching the surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaintOutcome {
    /// Echo of a frame we published ourselves; ignored.
    SelfAuthored,
    /// First counterpart frame of the connection.
    First,
    Painted,
}

pub struct RemoteSurface {
    local_role: Role,
    sink: Option<watch::Sender<RgbFrame>>,
    output: Option<watch::Receiver<RgbFrame>>,
}

impl RemoteSurface {
    pub fn new(local_role: Role) -> Self {
        Self {
            local_role,
            sink: None,
            output: None,
        }
    }

    /// Apply an inbound frame message. Allocates the surface on the first
    /// counterpart frame.
    pub fn paint(&mut self, message: &FrameMessage) -> Result<PaintOutcome, crate::error::CallError> {
        if message.sender_role == self.local_role {
            return Ok(PaintOutcome::SelfAuthored);
        }
        let frame = codec::decode(&message.encoded_image)?;
        match &self.sink {
            Some(sink) => {
                // send_replace: repaint even if the attached receiver is
                // gone, so a later borrow still sees the latest frame.
                sink.send_replace(frame);
                Ok(PaintOutcome::Painted)
            }
            None => {
                let (tx, rx) = watch::channel(frame);
                self.sink = Some(tx);
                self.output = Some(rx);
                Ok(PaintOutcome::First)
            }
        }
    }

    /// Hand the render feed to the caller. Yields once per allocation.
    pub fn take_output(&mut self) -> Option<watch::Receiver<RgbFrame>> {
        self.output.take()
    }

    pub fn has_surface(&self) -> bool {
        self.sink.is_some()
    }

    /// Drop the surface so the next counterpart frame allocates afresh.
    pub fn clear(&mut self) {
        self.sink = None;
        self.output = None;
    }
}
