use std::collections::HashMap;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message, error::ProtocolError};
use url::Url;

use crate::{
    Member, Metadata, PresenceAction, Relay, RelayError, RelayEvent, RelayResult, RelayStatus,
    Subscription,
};

/// Frames sent from a subscriber to the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Subscribe {
        channel: String,
        member: Member,
    },
    Publish {
        channel: String,
        publisher: String,
        /// base64 encoded payload bytes
        payload: String,
    },
    Unsubscribe {
        channel: String,
        member: String,
    },
}

/// Frames sent from the relay to a subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Subscribed {
        channel: String,
    },
    Message {
        channel: String,
        publisher: String,
        payload: String,
    },
    Presence {
        channel: String,
        member: String,
        action: PresenceAction,
        #[serde(default)]
        metadata: Metadata,
    },
    Error {
        message: String,
    },
}

type ConnectionKey = (String, String);

/// Room left in every text frame for the JSON envelope around the payload.
const FRAME_ENVELOPE_RESERVE: usize = 256;

/// Largest raw payload whose base64 `publish` frame still fits `frame_limit`
/// with a typical envelope.
fn payload_limit(frame_limit: usize) -> usize {
    frame_limit.saturating_sub(FRAME_ENVELOPE_RESERVE) / 4 * 3
}

/// Relay client speaking JSON text frames over a WebSocket, one socket per
/// subscription.
///
/// `frame_limit` bounds whole text frames on the wire; callers see the
/// smaller raw payload limit through [`Relay::max_message_bytes`].
pub struct WsRelay {
    url: Url,
    frame_limit: usize,
    connections: Mutex<HashMap<ConnectionKey, mpsc::UnboundedSender<ClientFrame>>>,
}

impl WsRelay {
    pub fn new(endpoint: &str, frame_limit: usize) -> RelayResult<Self> {
        let url = Url::parse(endpoint)
            .map_err(|err| RelayError::Protocol(format!("invalid relay url {endpoint}: {err}")))?;
        match url.scheme() {
            "ws" | "wss" => {}
            other => {
                return Err(RelayError::Protocol(format!(
                    "unsupported relay scheme {other}"
                )));
            }
        }
        Ok(Self {
            url,
            frame_limit,
            connections: Mutex::new(HashMap::new()),
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    fn sender_for(&self, channel: &str, publisher: &str) -> Option<mpsc::UnboundedSender<ClientFrame>> {
        let connections = self.connections.lock();
        connections
            .get(&(channel.to_string(), publisher.to_string()))
            .or_else(|| {
                connections
                    .iter()
                    .find(|((open_channel, _), _)| open_channel == channel)
                    .map(|(_, sender)| sender)
            })
            .cloned()
    }
}

#[async_trait]
impl Relay for WsRelay {
    fn max_message_bytes(&self) -> usize {
        payload_limit(self.frame_limit)
    }

    async fn subscribe(&self, channel: &str, member: &Member) -> RelayResult<Subscription> {
        let (ws_stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|err| RelayError::Unavailable(format!("websocket connect failed: {err}")))?;
        tracing::debug!(
            target = "snack::relay",
            url = %self.url,
            channel,
            member = %member.id,
            "relay websocket connected"
        );
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let subscribe = ClientFrame::Subscribe {
            channel: channel.to_string(),
            member: member.clone(),
        };
        let text = serde_json::to_string(&subscribe)
            .map_err(|err| RelayError::Protocol(err.to_string()))?;
        ws_write
            .send(Message::Text(text))
            .await
            .map_err(|err| RelayError::Unavailable(format!("subscribe send failed: {err}")))?;

        let (send_tx, mut send_rx) = mpsc::unbounded_channel::<ClientFrame>();
        let (event_tx, event_rx) = mpsc::unbounded_channel::<RelayEvent>();

        tokio::spawn(async move {
            while let Some(frame) = send_rx.recv().await {
                let Ok(text) = serde_json::to_string(&frame) else {
                    continue;
                };
                if ws_write.send(Message::Text(text)).await.is_err() {
                    break;
                }
                if matches!(frame, ClientFrame::Unsubscribe { .. }) {
                    break;
                }
            }
            let _ = ws_write.close().await;
        });

        let reader_channel = channel.to_string();
        tokio::spawn(async move {
            let _ = event_tx.send(RelayEvent::Status(RelayStatus::Connected));
            while let Some(msg) = ws_read.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        if let Some(event) = decode_server_frame(&reader_channel, text.as_bytes()) {
                            if event_tx.send(event).is_err() {
                                return;
                            }
                        }
                    }
                    Ok(Message::Binary(data)) => {
                        if let Some(event) = decode_server_frame(&reader_channel, &data) {
                            if event_tx.send(event).is_err() {
                                return;
                            }
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        match &err {
                            WsError::ConnectionClosed
                            | WsError::AlreadyClosed
                            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                                tracing::debug!(target = "snack::relay", "relay websocket closed: {err}");
                            }
                            _ => {
                                tracing::warn!(target = "snack::relay", "relay websocket error: {err}");
                            }
                        }
                        break;
                    }
                }
            }
            let _ = event_tx.send(RelayEvent::Status(RelayStatus::Disconnected));
        });

        self.connections
            .lock()
            .insert((channel.to_string(), member.id.clone()), send_tx);

        Ok(Subscription {
            channel: channel.to_string(),
            member: member.id.clone(),
            events: event_rx,
        })
    }

    async fn publish(&self, channel: &str, publisher: &str, payload: Bytes) -> RelayResult<()> {
        let frame = ClientFrame::Publish {
            channel: channel.to_string(),
            publisher: publisher.to_string(),
            payload: BASE64.encode(&payload),
        };
        let size = serde_json::to_string(&frame)
            .map_err(|err| RelayError::Protocol(format!("failed to encode frame: {err}")))?
            .len();
        if size > self.frame_limit {
            return Err(RelayError::MessageTooLarge {
                size,
                limit: self.frame_limit,
            });
        }
        let sender = self
            .sender_for(channel, publisher)
            .ok_or_else(|| RelayError::Unavailable(format!("no open connection for {channel}")))?;
        sender.send(frame).map_err(|_| RelayError::Closed)
    }

    async fn unsubscribe(&self, channel: &str, member_id: &str) -> RelayResult<()> {
        let sender = self
            .connections
            .lock()
            .remove(&(channel.to_string(), member_id.to_string()));
        if let Some(sender) = sender {
            let _ = sender.send(ClientFrame::Unsubscribe {
                channel: channel.to_string(),
                member: member_id.to_string(),
            });
        }
        Ok(())
    }
}

fn decode_server_frame(channel: &str, bytes: &[u8]) -> Option<RelayEvent> {
    let frame = match serde_json::from_slice::<ServerFrame>(bytes) {
        Ok(frame) => frame,
        Err(err) => {
            tracing::warn!(target = "snack::relay", error = %err, "undecodable relay frame");
            return None;
        }
    };
    match frame {
        ServerFrame::Message {
            channel: frame_channel,
            publisher,
            payload,
        } if frame_channel == channel => match BASE64.decode(payload.as_bytes()) {
            Ok(bytes) => Some(RelayEvent::Message {
                publisher,
                payload: Bytes::from(bytes),
            }),
            Err(err) => {
                tracing::warn!(target = "snack::relay", error = %err, "relay payload is not base64");
                None
            }
        },
        ServerFrame::Presence {
            channel: frame_channel,
            member,
            action,
            metadata,
        } if frame_channel == channel => Some(RelayEvent::Presence {
            member,
            action,
            metadata,
        }),
        ServerFrame::Subscribed { channel: frame_channel } => {
            tracing::debug!(target = "snack::relay", channel = %frame_channel, "relay acknowledged subscription");
            None
        }
        ServerFrame::Error { message } => {
            tracing::warn!(target = "snack::relay", %message, "relay reported error");
            None
        }
        _ => None,
    }
}
