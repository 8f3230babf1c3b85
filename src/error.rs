//! Call error taxonomy.
//!
//! Every failure the subsystem can raise flows through `CallError` so the UI
//! has a single surface to render. Only the link errors gate a call before it
//! starts; everything else degrades in place (dropped frame, stale frame,
//! missing local video).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CallError {
    /// Token is malformed or missing required fields.
    #[error("invalid invitation link: {0}")]
    LinkInvalid(String),

    /// Token decoded but its age exceeds the configured TTL.
    #[error("invitation link expired ({age_secs}s old, limit {ttl_secs}s)")]
    LinkExpired { age_secs: i64, ttl_secs: i64 },

    /// User denied the camera/microphone permission prompt.
    #[error("camera/microphone permission denied")]
    MediaPermissionDenied,

    /// No capture device matched the requested constraints.
    #[error("no capture device found")]
    MediaDeviceNotFound,

    /// The capture device exists but another application holds it.
    #[error("capture device is busy")]
    MediaDeviceBusy,

    /// A channel publish (or join/track) was rejected. Never fatal in-call:
    /// the frame is dropped and the loop continues.
    #[error("channel send failed: {0}")]
    ChannelSendFailure(String),

    /// Inbound frame payload could not be decoded. The frame is ignored and
    /// the last good frame stays on screen.
    #[error("frame decode failed: {0}")]
    FrameDecodeFailure(String),

    /// The call lifecycle does not allow this move, e.g. reconnecting a
    /// call that already ended.
    #[error("call is {from}, cannot move to {to}")]
    InvalidTransition {
        from: &'static str,
        to: &'static str,
    },
}

impl CallError {
    /// Message shown to the participant for this failure.
    pub fn user_message(&self) -> &'static str {
        match self {
            CallError::LinkInvalid(_) => "This call link is not valid.",
            CallError::LinkExpired { .. } => "This call link has expired.",
            CallError::MediaPermissionDenied => {
                "Camera access was denied. Allow camera access and try again."
            }
            CallError::MediaDeviceNotFound => "No camera was found on this device.",
            CallError::MediaDeviceBusy => "The camera is in use by another application.",
            CallError::ChannelSendFailure(_) => "Connection hiccup, retrying automatically.",
            CallError::FrameDecodeFailure(_) => "A video frame could not be displayed.",
            CallError::InvalidTransition { .. } => "This call has already ended.",
        }
    }

    /// True for pre-call failures that stop progress entirely. Everything
    /// else degrades gracefully during the call.
    pub fn is_gating(&self) -> bool {
        matches!(
            self,
            CallError::LinkInvalid(_) | CallError::LinkExpired { .. }
        )
    }
}
