use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

pub mod local;
pub mod websocket;

pub use local::LocalRelay;
pub use websocket::WsRelay;

pub type Metadata = HashMap<String, String>;

/// Identity a subscriber announces to the relay's presence tracking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: String,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Member {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            metadata: Metadata::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceAction {
    Join,
    Leave,
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayStatus {
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    Message {
        publisher: String,
        payload: Bytes,
    },
    Presence {
        member: String,
        action: PresenceAction,
        metadata: Metadata,
    },
    Status(RelayStatus),
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("relay unavailable: {0}")]
    Unavailable(String),
    #[error("relay subscription closed")]
    Closed,
    #[error("message of {size} bytes exceeds relay limit of {limit} bytes")]
    MessageTooLarge { size: usize, limit: usize },
    #[error("relay protocol error: {0}")]
    Protocol(String),
}

pub type RelayResult<T> = Result<T, RelayError>;

/// Live subscription to one channel. The event stream ends when the relay
/// connection is lost; the subscriber is expected to subscribe again.
#[derive(Debug)]
pub struct Subscription {
    pub channel: String,
    pub member: String,
    pub events: mpsc::UnboundedReceiver<RelayEvent>,
}

impl Subscription {
    pub async fn next_event(&mut self) -> Option<RelayEvent> {
        self.events.recv().await
    }
}

/// A topic based publish/subscribe relay with presence notifications.
#[async_trait]
pub trait Relay: Send + Sync {
    /// Largest payload accepted by a single `publish`.
    fn max_message_bytes(&self) -> usize;

    async fn subscribe(&self, channel: &str, member: &Member) -> RelayResult<Subscription>;

    async fn publish(&self, channel: &str, publisher: &str, payload: Bytes) -> RelayResult<()>;

    async fn unsubscribe(&self, channel: &str, member_id: &str) -> RelayResult<()>;
}
