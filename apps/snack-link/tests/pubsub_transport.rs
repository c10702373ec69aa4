mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use rand::distributions::Alphanumeric;
use rand::{Rng, SeedableRng};
use relay_bus::{LocalRelay, Relay};
use serde_json::json;
use snack_link::transport::chunk::{self, ChunkConfig};
use snack_link::transport::{
    BackendKind, ConnectionStatus, TransportConfig, TransportEvent, TransportResources,
    TransportState,
};
use snack_proto::{MessageType, TransportMessage};

use common::*;

fn editor(relay: &Arc<LocalRelay>) -> (Arc<dyn snack_link::Transport>, Events) {
    recorded(
        TransportConfig::new(ADDRESS, "editor"),
        TransportResources::relay(relay.clone() as Arc<dyn Relay>),
    )
}

#[tokio::test]
async fn resolves_test_transport_from_address() {
    let relay = Arc::new(LocalRelay::new());
    let config = TransportConfig::new(
        "exp://exp.host/@owner/sdk.40.0.0-abc123?testTransport=staging",
        "editor",
    );
    let (transport, _events) = recorded(config, TransportResources::relay(relay as Arc<dyn Relay>));
    assert_eq!(transport.kind(), BackendKind::PubSub);
    assert_eq!(transport.descriptor().channel_id(), "abc123");
    assert_eq!(transport.descriptor().test_transport(), Some("staging"));
}

#[tokio::test]
async fn large_payloads_are_chunked_and_reassembled() {
    let relay = Arc::new(LocalRelay::with_max_message_bytes(1024));
    let (editor, mut editor_events) = editor(&relay);
    let (_runtime, mut runtime_events) = runtime(&relay, "runtime", "40.0.0");
    wait_join(&mut editor_events, "runtime").await;

    let mut rng = rand::rngs::StdRng::seed_from_u64(7);
    let source: String = (0..40_000).map(|_| rng.sample(Alphanumeric) as char).collect();
    let payload = json!({"files": {"App.js": {"type": "CODE", "contents": source}}});
    editor.post_message(TransportMessage::new(MessageType::Code, "editor", payload.clone()));
    editor.post_message(TransportMessage::new(MessageType::Status, "editor", json!("after")));

    let first = next_message(&mut runtime_events).await;
    assert_eq!(first.kind, MessageType::Code);
    assert_eq!(first.payload, payload);
    assert!(first.sequence.is_none());
    // per-sender order holds across chunked and plain messages
    assert_eq!(next_message(&mut runtime_events).await.payload, json!("after"));
}

#[tokio::test(start_paused = true)]
async fn chunk_set_completed_after_timeout_is_dropped() {
    let relay = Arc::new(LocalRelay::with_max_message_bytes(1024));
    let (_runtime, mut runtime_events) = runtime(&relay, "runtime", "40.0.0");
    wait_status(&mut runtime_events, ConnectionStatus::Online).await;

    let config = ChunkConfig {
        max_message_bytes: 1024,
        ..ChunkConfig::default()
    };
    let big = TransportMessage::new(MessageType::Code, "ghost", json!({"contents": "x".repeat(5000)}));
    let frames = chunk::encode_outbound(&big, &config).expect("encode");
    let (last, rest) = frames.split_last().expect("several chunks");
    for frame in rest {
        relay.publish("abc123", "ghost", frame.clone()).await.expect("publish");
    }

    tokio::time::sleep(config.reassembly_timeout + Duration::from_secs(1)).await;
    relay.publish("abc123", "ghost", last.clone()).await.expect("publish last");
    let marker = TransportMessage::new(MessageType::Status, "ghost", json!("marker"));
    let marker = Bytes::from(serde_json::to_vec(&marker).expect("serialize"));
    relay.publish("abc123", "ghost", marker).await.expect("publish marker");

    let received = next_message(&mut runtime_events).await;
    assert_eq!(received.kind, MessageType::Status);
    assert_eq!(received.payload, json!("marker"));
}

#[tokio::test]
async fn stop_is_terminal_and_last() {
    let relay = Arc::new(LocalRelay::new());
    let (editor, mut editor_events) = editor(&relay);
    let (runtime, mut runtime_events) = runtime(&relay, "runtime", "40.0.0");
    wait_join(&mut editor_events, "runtime").await;

    editor.post_message(TransportMessage::stop("editor", "abc123"));
    assert_eq!(editor.state(), TransportState::Stopped);
    editor.post_message(TransportMessage::new(MessageType::Code, "editor", json!(1)));
    editor.post_message(TransportMessage::stop("editor", "abc123"));

    let mut last = None;
    while let Some(event) = tokio::time::timeout(WAIT, editor_events.recv())
        .await
        .expect("editor events")
    {
        last = Some(event);
    }
    assert_eq!(
        last,
        Some(TransportEvent::Status {
            device_id: "editor".into(),
            status: ConnectionStatus::Stopped
        })
    );

    // the runtime tears down on the remote stop exactly once
    let stop = next_message(&mut runtime_events).await;
    assert!(stop.is_stop());
    wait_status(&mut runtime_events, ConnectionStatus::Stopped).await;
    assert_eq!(runtime.state(), TransportState::Stopped);
    assert!(drain(&mut runtime_events).is_empty());
    assert!(relay.members("abc123").is_empty());
}

#[tokio::test]
async fn stop_for_another_channel_is_just_a_message() {
    let relay = Arc::new(LocalRelay::new());
    let (editor, mut editor_events) = editor(&relay);
    let (runtime, mut runtime_events) = runtime(&relay, "runtime", "40.0.0");
    wait_join(&mut editor_events, "runtime").await;

    editor.post_message(TransportMessage::stop("editor", "someone-else"));
    let message = next_message(&mut runtime_events).await;
    assert!(message.is_stop());
    assert_ne!(runtime.state(), TransportState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn reconnect_reports_status_and_skips_missed_messages() {
    let relay = Arc::new(LocalRelay::new());
    let (editor, mut editor_events) = editor(&relay);
    let (runtime, mut runtime_events) = runtime(&relay, "runtime", "40.0.0");
    wait_join(&mut editor_events, "runtime").await;
    wait_join(&mut runtime_events, "editor").await;

    assert!(relay.drop_connection("abc123", "editor"));
    // published while the editor is gone; never replayed
    runtime.post_message(TransportMessage::new(MessageType::Status, "runtime", json!("missed")));

    wait_status(&mut editor_events, ConnectionStatus::Reconnecting).await;
    assert_eq!(editor.state(), TransportState::Reconnecting);
    // queued by the editor until it is subscribed again
    editor.post_message(TransportMessage::new(MessageType::Code, "editor", json!("queued")));

    wait_status(&mut editor_events, ConnectionStatus::Online).await;
    assert_eq!(editor.state(), TransportState::Subscribed);
    assert_eq!(next_message(&mut runtime_events).await.payload, json!("queued"));

    runtime.post_message(TransportMessage::new(MessageType::Status, "runtime", json!("fresh")));
    assert_eq!(next_message(&mut editor_events).await.payload, json!("fresh"));
}

#[tokio::test(start_paused = true)]
async fn unavailable_relay_backs_off_until_it_returns() {
    let relay = Arc::new(LocalRelay::new());
    relay.set_available(false);
    let started = tokio::time::Instant::now();
    let (editor, mut editor_events) = editor(&relay);

    wait_status(&mut editor_events, ConnectionStatus::Offline).await;
    assert_eq!(editor.state(), TransportState::Disconnected);

    tokio::time::sleep(Duration::from_secs(5)).await;
    relay.set_available(true);
    wait_status(&mut editor_events, ConnectionStatus::Online).await;
    // attempts at ~0s, ~1s, ~3s, ~7s: the relay is back before the fourth
    assert!(started.elapsed() >= Duration::from_secs(5));
    assert!(started.elapsed() < Duration::from_secs(12));
}
