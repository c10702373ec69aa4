#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use relay_bus::{LocalRelay, Relay};
use snack_link::transport::{
    ConnectionStatus, EventKind, PresenceAction, Transport, TransportConfig, TransportEvent,
    TransportResources, create_transport_with,
};
use snack_proto::{META_PLATFORM, META_VERSION, TransportMessage};
use tokio::sync::mpsc;
use tokio::time::timeout;

pub const ADDRESS: &str = "exp://exp.host/@owner/sdk.40.0.0-abc123";
pub const WAIT: Duration = Duration::from_secs(30);

pub type Events = mpsc::UnboundedReceiver<TransportEvent>;

pub fn recorded(config: TransportConfig, resources: TransportResources) -> (Arc<dyn Transport>, Events) {
    let (tx, rx) = mpsc::unbounded_channel();
    let transport = create_transport_with(config, resources, |transport| {
        for kind in [EventKind::Message, EventKind::Presence, EventKind::Status] {
            let tx = tx.clone();
            transport.add_listener(
                kind,
                Arc::new(move |event: &TransportEvent| {
                    let _ = tx.send(event.clone());
                }),
            );
        }
    })
    .expect("transport");
    (transport, rx)
}

/// A runtime peer announcing `version` on the shared relay.
pub fn runtime(relay: &Arc<LocalRelay>, device_id: &str, version: &str) -> (Arc<dyn Transport>, Events) {
    let config = TransportConfig::new(ADDRESS, device_id)
        .with_metadata(META_VERSION, version)
        .with_metadata(META_PLATFORM, "ios");
    recorded(config, TransportResources::relay(relay.clone() as Arc<dyn Relay>))
}

pub async fn next_event(events: &mut Events) -> TransportEvent {
    timeout(WAIT, events.recv())
        .await
        .expect("timed out waiting for transport event")
        .expect("transport event stream ended")
}

pub async fn next_message(events: &mut Events) -> TransportMessage {
    loop {
        if let TransportEvent::Message { message, .. } = next_event(events).await {
            return message;
        }
    }
}

pub async fn wait_status(events: &mut Events, expected: ConnectionStatus) {
    loop {
        if let TransportEvent::Status { status, .. } = next_event(events).await {
            if status == expected {
                return;
            }
        }
    }
}

pub async fn wait_join(events: &mut Events, peer: &str) {
    loop {
        if let TransportEvent::Presence {
            device_id,
            action: PresenceAction::Join,
            ..
        } = next_event(events).await
        {
            if device_id == peer {
                return;
            }
        }
    }
}

/// Drains whatever is already queued without waiting.
pub fn drain(events: &mut Events) -> Vec<TransportEvent> {
    let mut drained = Vec::new();
    while let Ok(event) = events.try_recv() {
        drained.push(event);
    }
    drained
}
