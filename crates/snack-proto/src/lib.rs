//! Wire types shared by the editor and runtime sides of a live session.
//! Kept in a dependency-light crate so runtimes embedding only the protocol
//! do not pull in the transport engine.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Presence metadata key carrying the runtime's declared capability version.
pub const META_VERSION: &str = "version";
/// Presence metadata key carrying the runtime platform (`ios`, `android`, `web`).
pub const META_PLATFORM: &str = "platform";
/// Presence metadata key carrying a human readable device name.
pub const META_NAME: &str = "name";

/// Payload key a `stop` message uses to name the channel it tears down.
pub const STOP_CHANNEL_KEY: &str = "channel";

pub type Metadata = HashMap<String, String>;

/// Message kind on the wire. Kinds this crate does not know are carried
/// through unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageType {
    Init,
    Code,
    Dependencies,
    Status,
    Stop,
    Other(String),
}

impl MessageType {
    pub fn as_str(&self) -> &str {
        match self {
            MessageType::Init => "init",
            MessageType::Code => "code",
            MessageType::Dependencies => "dependencies",
            MessageType::Status => "status",
            MessageType::Stop => "stop",
            MessageType::Other(kind) => kind,
        }
    }
}

impl From<String> for MessageType {
    fn from(kind: String) -> Self {
        match kind.as_str() {
            "init" => MessageType::Init,
            "code" => MessageType::Code,
            "dependencies" => MessageType::Dependencies,
            "status" => MessageType::Status,
            "stop" => MessageType::Stop,
            _ => MessageType::Other(kind),
        }
    }
}

impl From<MessageType> for String {
    fn from(kind: MessageType) -> Self {
        match kind {
            MessageType::Other(kind) => kind,
            known => known.as_str().to_string(),
        }
    }
}

/// Position of one chunk inside a message that was split for transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkSequence {
    pub index: u32,
    pub total: u32,
    pub message_id: String,
}

impl ChunkSequence {
    pub fn new_message_id() -> String {
        Uuid::new_v4().to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportMessage {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub device_id: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<ChunkSequence>,
    /// Recipient device; absent for messages meant for every peer on the channel.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

impl TransportMessage {
    pub fn new(kind: MessageType, device_id: impl Into<String>, payload: Value) -> Self {
        Self {
            kind,
            device_id: device_id.into(),
            payload,
            sequence: None,
            target: None,
        }
    }

    pub fn stop(device_id: impl Into<String>, channel: &str) -> Self {
        Self::new(
            MessageType::Stop,
            device_id,
            serde_json::json!({ STOP_CHANNEL_KEY: channel }),
        )
    }

    pub fn with_target(mut self, device_id: impl Into<String>) -> Self {
        self.target = Some(device_id.into());
        self
    }

    pub fn is_stop(&self) -> bool {
        self.kind == MessageType::Stop
    }

    pub fn is_chunk(&self) -> bool {
        self.sequence.is_some()
    }

    /// Whether a receiver identified by `device_id` should consume this message.
    pub fn addressed_to(&self, device_id: &str) -> bool {
        self.target.as_deref().map_or(true, |target| target == device_id)
    }

    /// A stop message matches a channel when it names that channel or names none.
    pub fn stops_channel(&self, channel: &str) -> bool {
        if !self.is_stop() {
            return false;
        }
        match self.payload.get(STOP_CHANNEL_KEY).and_then(Value::as_str) {
            Some(named) => named == channel,
            None => true,
        }
    }
}

/// Frames exchanged over a direct (in-process or worker) link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum DirectFrame {
    Hello {
        device_id: String,
        #[serde(default)]
        metadata: Metadata,
    },
    Message {
        message: TransportMessage,
    },
    Close,
}
