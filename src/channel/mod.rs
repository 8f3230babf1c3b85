//! Publish/subscribe channel layer.
//!
//! Both participants derive the same room from the call id and exchange two
//! kinds of traffic over it: presence (who is in the room) and broadcast
//! messages (the relayed video frames). The service itself is an external
//! collaborator behind the [`Channel`] trait; [`realtime`] talks to the
//! hosted service over WebSocket and [`memory`] is the in-process broker used
//! by tests and the loopback harness.

pub mod memory;
pub mod realtime;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;

use crate::error::CallError;

/// Broadcast event name carrying relayed video frames.
pub const VIDEO_STREAM_EVENT: &str = "video_stream";

/// Deterministic room identifier: both participants derive it from the call
/// id with no central allocation step.
pub fn room_id(call_id: &str) -> String {
    format!("video-call-{call_id}")
}

/// Which side of the session this participant is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Host,
    Guest,
}

impl Role {
    pub fn counterpart(self) -> Role {
        match self {
            Role::Host => Role::Guest,
            Role::Guest => Role::Host,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Host => "host",
            Role::Guest => "guest",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Presence metadata announced on subscribe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub role: Role,
    pub display_name: String,
    /// ISO-8601 join time.
    pub online_at: DateTime<Utc>,
}

/// One relayed video frame, as carried in a `video_stream` broadcast payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameMessage {
    #[serde(rename = "user_type")]
    pub sender_role: Role,
    /// Base64 of the JPEG-compressed downscaled frame.
    #[serde(rename = "video_data")]
    pub encoded_image: String,
    #[serde(rename = "timestamp")]
    pub captured_at: DateTime<Utc>,
}

/// Everything a subscriber can observe on the room.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// Full presence snapshot for the room.
    PresenceSync(Vec<PresenceRecord>),
    PresenceJoin(PresenceRecord),
    PresenceLeave(PresenceRecord),
    /// Application broadcast, delivered in channel order only.
    Broadcast {
        event: String,
        payload: serde_json::Value,
    },
}

/// The pub/sub channel service for one room.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Subscribe to the room. Resolves once the subscription is acknowledged
    /// and yields this subscriber's event stream.
    async fn join(&self) -> Result<mpsc::Receiver<ChannelEvent>, CallError>;

    /// Announce local presence metadata to all subscribers.
    async fn track(&self, presence: &PresenceRecord) -> Result<(), CallError>;

    /// Publish a broadcast message to the other subscribers. Best effort:
    /// no retry, no backlog.
    async fn send(&self, event: &str, payload: serde_json::Value) -> Result<(), CallError>;

    /// Unsubscribe and tear down the room connection.
    async fn leave(&self) -> Result<(), CallError>;
}
