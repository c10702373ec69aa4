use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::{
    Member, Metadata, PresenceAction, Relay, RelayError, RelayEvent, RelayResult, RelayStatus,
    Subscription,
};

pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 32 * 1024;

#[derive(Debug)]
struct Slot {
    metadata: Metadata,
    tx: mpsc::UnboundedSender<RelayEvent>,
}

#[derive(Debug, Default)]
struct ChannelState {
    // insertion order is kept so presence snapshots are deterministic
    order: Vec<String>,
    members: HashMap<String, Slot>,
}

impl ChannelState {
    fn broadcast(&self, event: &RelayEvent) {
        for id in &self.order {
            if let Some(slot) = self.members.get(id) {
                let _ = slot.tx.send(event.clone());
            }
        }
    }

    fn remove(&mut self, member_id: &str) -> Option<Slot> {
        self.order.retain(|id| id != member_id);
        self.members.remove(member_id)
    }
}

/// In-memory relay for tests and single-process setups. Supports fault
/// injection (dropped connections, unavailability) so reconnect paths can be
/// exercised without a network.
#[derive(Debug)]
pub struct LocalRelay {
    channels: Mutex<HashMap<String, ChannelState>>,
    max_message_bytes: usize,
    available: AtomicBool,
}

impl Default for LocalRelay {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalRelay {
    pub fn new() -> Self {
        Self::with_max_message_bytes(DEFAULT_MAX_MESSAGE_BYTES)
    }

    pub fn with_max_message_bytes(max_message_bytes: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            max_message_bytes,
            available: AtomicBool::new(true),
        }
    }

    /// While unavailable, `subscribe` and `publish` fail with [`RelayError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Simulates a network drop for one member: its event stream ends and the
    /// remaining members observe a presence timeout.
    pub fn drop_connection(&self, channel: &str, member_id: &str) -> bool {
        let mut channels = self.channels.lock();
        let Some(state) = channels.get_mut(channel) else {
            return false;
        };
        let Some(slot) = state.remove(member_id) else {
            return false;
        };
        let _ = slot.tx.send(RelayEvent::Status(RelayStatus::Disconnected));
        state.broadcast(&RelayEvent::Presence {
            member: member_id.to_string(),
            action: PresenceAction::Timeout,
            metadata: slot.metadata,
        });
        true
    }

    pub fn members(&self, channel: &str) -> Vec<String> {
        self.channels
            .lock()
            .get(channel)
            .map(|state| state.order.clone())
            .unwrap_or_default()
    }

    fn ensure_available(&self) -> RelayResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RelayError::Unavailable("local relay offline".into()))
        }
    }
}

#[async_trait]
impl Relay for LocalRelay {
    fn max_message_bytes(&self) -> usize {
        self.max_message_bytes
    }

    async fn subscribe(&self, channel: &str, member: &Member) -> RelayResult<Subscription> {
        self.ensure_available()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let mut channels = self.channels.lock();
        let state = channels.entry(channel.to_string()).or_default();

        if let Some(previous) = state.remove(&member.id) {
            let _ = previous.tx.send(RelayEvent::Status(RelayStatus::Disconnected));
        }

        let _ = tx.send(RelayEvent::Status(RelayStatus::Connected));
        for id in &state.order {
            if let Some(slot) = state.members.get(id) {
                let _ = tx.send(RelayEvent::Presence {
                    member: id.clone(),
                    action: PresenceAction::Join,
                    metadata: slot.metadata.clone(),
                });
            }
        }

        state.order.push(member.id.clone());
        state.members.insert(
            member.id.clone(),
            Slot {
                metadata: member.metadata.clone(),
                tx,
            },
        );
        state.broadcast(&RelayEvent::Presence {
            member: member.id.clone(),
            action: PresenceAction::Join,
            metadata: member.metadata.clone(),
        });

        Ok(Subscription {
            channel: channel.to_string(),
            member: member.id.clone(),
            events: rx,
        })
    }

    async fn publish(&self, channel: &str, publisher: &str, payload: Bytes) -> RelayResult<()> {
        self.ensure_available()?;
        if payload.len() > self.max_message_bytes {
            return Err(RelayError::MessageTooLarge {
                size: payload.len(),
                limit: self.max_message_bytes,
            });
        }
        let channels = self.channels.lock();
        if let Some(state) = channels.get(channel) {
            state.broadcast(&RelayEvent::Message {
                publisher: publisher.to_string(),
                payload,
            });
        }
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str, member_id: &str) -> RelayResult<()> {
        let mut channels = self.channels.lock();
        let Some(state) = channels.get_mut(channel) else {
            return Ok(());
        };
        if let Some(slot) = state.remove(member_id) {
            state.broadcast(&RelayEvent::Presence {
                member: member_id.to_string(),
                action: PresenceAction::Leave,
                metadata: slot.metadata,
            });
        }
        if state.members.is_empty() {
            channels.remove(channel);
        }
        Ok(())
    }
}
