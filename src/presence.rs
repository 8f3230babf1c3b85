//! Presence tracking for the counterpart role.
//!
//! The tracker folds channel presence events into the set of currently
//! tracked records and reports transitions of the counterpart role — online
//! exactly once per offline-to-online edge, offline exactly once per
//! online-to-offline edge. Redundant joins and syncs while already online
//! produce nothing, which is what makes the Connected transition idempotent.
//!
//! The tracker is pure state: the session owns every side effect.

use crate::channel::{ChannelEvent, PresenceRecord, Role};

/// Transition notifications for the counterpart role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceEvent {
    CounterpartOnline(PresenceRecord),
    CounterpartLeft,
}

pub struct PresenceTracker {
    local_role: Role,
    records: Vec<PresenceRecord>,
    counterpart_online: bool,
}

impl PresenceTracker {
    pub fn new(local_role: Role) -> Self {
        Self {
            local_role,
            records: Vec::new(),
            counterpart_online: false,
        }
    }

    pub fn counterpart_online(&self) -> bool {
        self.counterpart_online
    }

    pub fn records(&self) -> &[PresenceRecord] {
        &self.records
    }

    /// Fold one channel event; returns a transition if the counterpart's
    /// online state changed.
    pub fn observe(&mut self, event: &ChannelEvent) -> Option<PresenceEvent> {
        match event {
            ChannelEvent::PresenceSync(records) => {
                self.records = records.clone();
            }
            ChannelEvent::PresenceJoin(record) => {
                // Two-party call: one record per role.
                self.records.retain(|r| r.role != record.role);
                self.records.push(record.clone());
            }
            ChannelEvent::PresenceLeave(record) => {
                self.records.retain(|r| r.role != record.role);
            }
            ChannelEvent::Broadcast { .. } => return None,
        }

        let counterpart = self.local_role.counterpart();
        let online = self.records.iter().find(|r| r.role == counterpart);

        match (online, self.counterpart_online) {
            (Some(record), false) => {
                self.counterpart_online = true;
                tracing::info!("counterpart {} is online: {}", counterpart, record.display_name);
                Some(PresenceEvent::CounterpartOnline(record.clone()))
            }
            (None, true) => {
                self.counterpart_online = false;
                tracing::info!("counterpart {} left", counterpart);
                Some(PresenceEvent::CounterpartLeft)
            }
            _ => None,
        }
    }
}
