//! In-process channel broker.
//!
//! Implements the [`Channel`] semantics entirely in memory: rooms are keyed
//! by room id, presence fans out as join/sync/leave, broadcasts reach every
//! other member. This is the test-only adapter — the "fake remote video"
//! simulation path lives here and in the loopback harness, never in the
//! production channel client.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use super::{Channel, ChannelEvent, PresenceRecord};
use crate::error::CallError;

const EVENT_QUEUE_DEPTH: usize = 64;

struct Member {
    id: u64,
    tx: mpsc::Sender<ChannelEvent>,
    presence: Option<PresenceRecord>,
}

#[derive(Default)]
struct Room {
    members: Vec<Member>,
}

impl Room {
    fn records(&self) -> Vec<PresenceRecord> {
        self.members
            .iter()
            .filter_map(|m| m.presence.clone())
            .collect()
    }

    /// Best-effort delivery: a member that stopped draining its queue loses
    /// frames, matching the most-recent-wins transport.
    fn deliver(&self, event: ChannelEvent, exclude: Option<u64>) {
        for member in &self.members {
            if Some(member.id) == exclude {
                continue;
            }
            if member.tx.try_send(event.clone()).is_err() {
                tracing::debug!("member {} queue full or closed, event dropped", member.id);
            }
        }
    }
}

/// Shared broker; hand each participant a channel via [`MemoryBroker::channel`].
#[derive(Default)]
pub struct MemoryBroker {
    rooms: Mutex<HashMap<String, Room>>,
    next_member: AtomicU64,
}

impl MemoryBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn channel(self: &Arc<Self>, room: impl Into<String>) -> MemoryChannel {
        MemoryChannel {
            broker: Arc::clone(self),
            room: room.into(),
            member_id: self.next_member.fetch_add(1, Ordering::Relaxed),
        }
    }
}

/// One participant's handle onto a broker room.
pub struct MemoryChannel {
    broker: Arc<MemoryBroker>,
    room: String,
    member_id: u64,
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn join(&self) -> Result<mpsc::Receiver<ChannelEvent>, CallError> {
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let mut rooms = self.broker.rooms.lock().await;
        let room = rooms.entry(self.room.clone()).or_default();
        room.members.retain(|m| m.id != self.member_id);
        // Current presence snapshot goes to the new subscriber right away.
        let snapshot = room.records();
        if !snapshot.is_empty() && tx.try_send(ChannelEvent::PresenceSync(snapshot)).is_err() {
            return Err(CallError::ChannelSendFailure("subscriber queue closed".into()));
        }
        room.members.push(Member {
            id: self.member_id,
            tx,
            presence: None,
        });
        tracing::debug!("member {} joined room {}", self.member_id, self.room);
        Ok(rx)
    }

    async fn track(&self, presence: &PresenceRecord) -> Result<(), CallError> {
        let mut rooms = self.broker.rooms.lock().await;
        let room = rooms
            .get_mut(&self.room)
            .ok_or_else(|| CallError::ChannelSendFailure("room not joined".into()))?;
        let member = room
            .members
            .iter_mut()
            .find(|m| m.id == self.member_id)
            .ok_or_else(|| CallError::ChannelSendFailure("not subscribed".into()))?;
        member.presence = Some(presence.clone());

        room.deliver(
            ChannelEvent::PresenceJoin(presence.clone()),
            Some(self.member_id),
        );
        room.deliver(ChannelEvent::PresenceSync(room.records()), None);
        Ok(())
    }

    async fn send(&self, event: &str, payload: serde_json::Value) -> Result<(), CallError> {
        let rooms = self.broker.rooms.lock().await;
        let room = rooms
            .get(&self.room)
            .ok_or_else(|| CallError::ChannelSendFailure("room not joined".into()))?;
        if !room.members.iter().any(|m| m.id == self.member_id) {
            return Err(CallError::ChannelSendFailure("not subscribed".into()));
        }
        room.deliver(
            ChannelEvent::Broadcast {
                event: event.to_string(),
                payload,
            },
            Some(self.member_id),
        );
        Ok(())
    }

    async fn leave(&self) -> Result<(), CallError> {
        let mut rooms = self.broker.rooms.lock().await;
        let Some(room) = rooms.get_mut(&self.room) else {
            return Ok(());
        };
        let departed = room
            .members
            .iter()
            .position(|m| m.id == self.member_id)
            .map(|idx| room.members.remove(idx));
        if let Some(member) = departed {
            if let Some(presence) = member.presence {
                room.deliver(ChannelEvent::PresenceLeave(presence), None);
                room.deliver(ChannelEvent::PresenceSync(room.records()), None);
            }
        }
        if room.members.is_empty() {
            rooms.remove(&self.room);
        }
        Ok(())
    }
}
