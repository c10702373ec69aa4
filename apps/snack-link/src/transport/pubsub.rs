use std::collections::VecDeque;
use std::sync::Arc;

use relay_bus::{Member, Relay, RelayError, RelayEvent, RelayStatus, Subscription};
use snack_proto::TransportMessage;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::Instrument;

use super::chunk::{self, ChunkConfig, ExpiredChunkSet, Reassembler};
use super::{
    Backoff, BackendKind, ConnectionStatus, EventKind, Starter, Transport, TransportConfig,
    TransportCore, TransportEvent, TransportHandler, TransportState,
};
use crate::channel::ChannelDescriptor;
use crate::dispatch::ListenerId;
use crate::telemetry;

/// Transport over a topic based relay. Every peer subscribed to the session
/// channel receives every message; `target` narrows delivery to one device.
pub struct PubSubTransport {
    core: Arc<TransportCore>,
    driver: JoinHandle<()>,
}

impl PubSubTransport {
    pub(crate) fn new(
        config: &TransportConfig,
        descriptor: ChannelDescriptor,
        relay: Arc<dyn Relay>,
    ) -> (Self, Starter) {
        let (core, outbound) =
            TransportCore::new(BackendKind::PubSub, descriptor, config.device_id.clone());
        let (starter, start) = Starter::pair();

        let mut chunk = config.chunk;
        chunk.max_message_bytes = chunk.max_message_bytes.min(relay.max_message_bytes());

        let driver = Driver {
            core: Arc::clone(&core),
            member: Member::new(config.device_id.clone()).with_metadata(config.metadata.clone()),
            relay,
            reassembler: Reassembler::new(chunk),
            chunk,
            backoff: Backoff::new(config.reconnect),
            pending: VecDeque::new(),
            max_pending: config.max_pending_outbound.max(1),
        };
        let span = telemetry::channel_span(core.channel_id(), &config.device_id);
        let driver = tokio::spawn(driver.run(start, outbound).instrument(span));
        (Self { core, driver }, starter)
    }
}

impl Drop for PubSubTransport {
    fn drop(&mut self) {
        // a posted stop still gets flushed; anything else is abandoned
        if self.core.state() != TransportState::Stopped {
            self.driver.abort();
        }
    }
}

impl Transport for PubSubTransport {
    fn kind(&self) -> BackendKind {
        self.core.kind()
    }

    fn descriptor(&self) -> &ChannelDescriptor {
        self.core.descriptor()
    }

    fn device_id(&self) -> &str {
        self.core.device_id()
    }

    fn state(&self) -> TransportState {
        self.core.state()
    }

    fn post_message(&self, message: TransportMessage) {
        self.core.post(message);
    }

    fn add_listener(&self, kind: EventKind, handler: TransportHandler) -> ListenerId {
        self.core.add_listener(kind, handler)
    }

    fn remove_listener(&self, kind: EventKind, id: ListenerId) -> bool {
        self.core.remove_listener(kind, id)
    }
}

enum Flow {
    Continue,
    /// Publishing hit a dead relay; drop the subscription and resubscribe.
    Reconnect,
    Stop,
}

struct Driver {
    core: Arc<TransportCore>,
    relay: Arc<dyn Relay>,
    member: Member,
    chunk: ChunkConfig,
    reassembler: Reassembler,
    backoff: Backoff,
    pending: VecDeque<TransportMessage>,
    max_pending: usize,
}

impl Driver {
    async fn run(
        mut self,
        start: oneshot::Receiver<()>,
        mut outbound: mpsc::UnboundedReceiver<TransportMessage>,
    ) {
        if start.await.is_err() {
            return;
        }
        self.core.emit_status(ConnectionStatus::Connecting);

        let mut subscription: Option<Subscription> = None;
        let mut retry_at = Instant::now();
        let mut sweep = time::interval(self.chunk.sweep_interval());
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                message = outbound.recv() => {
                    let Some(message) = message else {
                        self.teardown(subscription.take()).await;
                        break;
                    };
                    match self.handle_outbound(message, subscription.is_some()).await {
                        Flow::Continue => {}
                        Flow::Reconnect => {
                            // the relay replaces our slot on resubscribe; an explicit
                            // unsubscribe would announce a leave to every peer
                            subscription = None;
                            retry_at = self.connection_lost();
                        }
                        Flow::Stop => {
                            self.teardown(subscription.take()).await;
                            break;
                        }
                    }
                }
                event = next_relay_event(&mut subscription), if subscription.is_some() => {
                    match event {
                        Some(event) => {
                            if let Flow::Stop = self.handle_relay_event(event) {
                                self.teardown(subscription.take()).await;
                                break;
                            }
                        }
                        None => {
                            subscription = None;
                            retry_at = self.connection_lost();
                        }
                    }
                }
                _ = time::sleep_until(retry_at), if subscription.is_none() => {
                    match self.relay.subscribe(self.core.channel_id(), &self.member).await {
                        Ok(sub) => {
                            subscription = Some(sub);
                            if let Flow::Reconnect = self.subscribed().await {
                                subscription = None;
                                retry_at = self.connection_lost();
                            }
                        }
                        Err(err) => retry_at = self.subscribe_failed(err),
                    }
                }
                _ = sweep.tick() => self.sweep(),
            }
        }
    }

    async fn handle_outbound(&mut self, message: TransportMessage, connected: bool) -> Flow {
        if message.is_stop() {
            if connected {
                if let Err(err) = self.publish(&message).await {
                    tracing::warn!(
                        target = "snack::transport::pubsub",
                        channel = self.core.channel_id(),
                        error = %err,
                        "failed to publish stop"
                    );
                }
            }
            return Flow::Stop;
        }
        // a non-empty queue means an earlier flush is unfinished; stay behind it
        if !connected || !self.pending.is_empty() {
            self.enqueue_pending(message);
            return Flow::Continue;
        }
        match self.publish(&message).await {
            Ok(()) => {}
            Err(err @ (RelayError::Unavailable(_) | RelayError::Closed)) => {
                tracing::debug!(
                    target = "snack::transport::pubsub",
                    channel = self.core.channel_id(),
                    kind = message.kind.as_str(),
                    error = %err,
                    "publish failed; queueing until resubscribed"
                );
                self.enqueue_pending(message);
                return Flow::Reconnect;
            }
            Err(err) => {
                tracing::warn!(
                    target = "snack::transport::pubsub",
                    channel = self.core.channel_id(),
                    kind = message.kind.as_str(),
                    error = %err,
                    "relay rejected message; dropping"
                );
            }
        }
        Flow::Continue
    }

    /// Encoding failures are logged and swallowed; only relay failures surface.
    async fn publish(&self, message: &TransportMessage) -> Result<(), RelayError> {
        let frames = match chunk::encode_outbound(message, &self.chunk) {
            Ok(frames) => frames,
            Err(err) => {
                tracing::warn!(
                    target = "snack::transport::pubsub",
                    channel = self.core.channel_id(),
                    kind = message.kind.as_str(),
                    error = %err,
                    "dropping unencodable message"
                );
                return Ok(());
            }
        };
        if frames.len() > 1 {
            tracing::debug!(
                target = "snack::transport::pubsub",
                channel = self.core.channel_id(),
                kind = message.kind.as_str(),
                chunks = frames.len(),
                "publishing chunked message"
            );
        }
        for frame in frames {
            self.relay
                .publish(self.core.channel_id(), self.core.device_id(), frame)
                .await?;
        }
        Ok(())
    }

    fn enqueue_pending(&mut self, message: TransportMessage) {
        if self.pending.len() >= self.max_pending {
            if let Some(dropped) = self.pending.pop_front() {
                tracing::warn!(
                    target = "snack::transport::pubsub",
                    channel = self.core.channel_id(),
                    kind = dropped.kind.as_str(),
                    limit = self.max_pending,
                    "outbound queue full while offline; dropping oldest message"
                );
            }
        }
        self.pending.push_back(message);
    }

    fn handle_relay_event(&mut self, event: RelayEvent) -> Flow {
        match event {
            RelayEvent::Message { publisher, payload } => {
                if publisher == self.core.device_id() {
                    return Flow::Continue;
                }
                let message: TransportMessage = match serde_json::from_slice(&payload) {
                    Ok(message) => message,
                    Err(err) => {
                        tracing::warn!(
                            target = "snack::transport::pubsub",
                            channel = self.core.channel_id(),
                            %publisher,
                            error = %err,
                            "ignoring undecodable relay payload"
                        );
                        return Flow::Continue;
                    }
                };
                if !message.addressed_to(self.core.device_id()) {
                    tracing::trace!(
                        target = "snack::transport::pubsub",
                        channel = self.core.channel_id(),
                        target_device = ?message.target,
                        "ignoring message for another device"
                    );
                    return Flow::Continue;
                }
                self.deliver(message)
            }
            RelayEvent::Presence {
                member,
                action,
                metadata,
            } => {
                if member != self.core.device_id() {
                    self.core.emit(TransportEvent::Presence {
                        device_id: member,
                        action,
                        metadata,
                    });
                }
                Flow::Continue
            }
            RelayEvent::Status(status) => {
                tracing::trace!(
                    target = "snack::transport::pubsub",
                    channel = self.core.channel_id(),
                    ?status,
                    "relay status"
                );
                if status == RelayStatus::Connected {
                    self.backoff.reset();
                }
                Flow::Continue
            }
        }
    }

    fn deliver(&mut self, message: TransportMessage) -> Flow {
        let outcome = match self.reassembler.ingest(message, Instant::now()) {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::warn!(
                    target = "snack::transport::pubsub",
                    channel = self.core.channel_id(),
                    error = %err,
                    "discarding chunk"
                );
                return Flow::Continue;
            }
        };
        for expired in &outcome.evicted {
            self.log_expired(expired);
        }
        let Some(message) = outcome.completed else {
            return Flow::Continue;
        };

        let stop = message.stops_channel(self.core.channel_id());
        if stop {
            // posts issued by observers of the stop itself are already refused
            self.core.set_state(TransportState::Stopped);
        }
        self.core.emit(TransportEvent::Message {
            device_id: message.device_id.clone(),
            message,
        });
        if stop { Flow::Stop } else { Flow::Continue }
    }

    async fn subscribed(&mut self) -> Flow {
        tracing::info!(
            target = "snack::transport::pubsub",
            channel = self.core.channel_id(),
            device = self.core.device_id(),
            pending = self.pending.len(),
            "subscribed to relay channel"
        );
        self.backoff.reset();
        self.core.set_state(TransportState::Subscribed);
        self.core.emit_status(ConnectionStatus::Online);

        while let Some(message) = self.pending.pop_front() {
            match self.publish(&message).await {
                Ok(()) => {}
                Err(err @ (RelayError::Unavailable(_) | RelayError::Closed)) => {
                    tracing::warn!(
                        target = "snack::transport::pubsub",
                        channel = self.core.channel_id(),
                        error = %err,
                        "flush interrupted; keeping queued messages"
                    );
                    // kept at the head so later posts queue behind it
                    self.pending.push_front(message);
                    return Flow::Reconnect;
                }
                Err(err) => {
                    tracing::warn!(
                        target = "snack::transport::pubsub",
                        channel = self.core.channel_id(),
                        kind = message.kind.as_str(),
                        error = %err,
                        "relay rejected queued message; dropping"
                    );
                }
            }
        }
        Flow::Continue
    }

    fn connection_lost(&mut self) -> Instant {
        let delay = self.backoff.next_delay();
        tracing::warn!(
            target = "snack::transport::pubsub",
            channel = self.core.channel_id(),
            retry_in_ms = delay.as_millis() as u64,
            "relay connection lost; reconnecting"
        );
        self.core.set_state(TransportState::Reconnecting);
        self.core.emit_status(ConnectionStatus::Reconnecting);
        Instant::now() + delay
    }

    fn subscribe_failed(&mut self, err: RelayError) -> Instant {
        let delay = self.backoff.next_delay();
        tracing::warn!(
            target = "snack::transport::pubsub",
            channel = self.core.channel_id(),
            error = %err,
            retry_in_ms = delay.as_millis() as u64,
            "TransportUnavailable: relay subscribe failed"
        );
        self.core.set_state(TransportState::Disconnected);
        self.core.emit_status(ConnectionStatus::Offline);
        Instant::now() + delay
    }

    fn sweep(&mut self) {
        for expired in self.reassembler.expire(Instant::now()) {
            self.log_expired(&expired);
        }
    }

    fn log_expired(&self, expired: &ExpiredChunkSet) {
        tracing::warn!(
            target = "snack::transport::pubsub",
            channel = self.core.channel_id(),
            message_id = %expired.message_id,
            sender = %expired.sender,
            received = expired.received,
            total = expired.total,
            reason = ?expired.reason,
            "ChunkReassemblyTimeout: dropping incomplete message"
        );
    }

    async fn teardown(&mut self, subscription: Option<Subscription>) {
        if let Some(subscription) = subscription {
            if let Err(err) = self
                .relay
                .unsubscribe(&subscription.channel, &subscription.member)
                .await
            {
                tracing::debug!(
                    target = "snack::transport::pubsub",
                    channel = self.core.channel_id(),
                    error = %err,
                    "unsubscribe failed during teardown"
                );
            }
        }
        if !self.pending.is_empty() {
            tracing::debug!(
                target = "snack::transport::pubsub",
                channel = self.core.channel_id(),
                discarded = self.pending.len(),
                "discarding queued messages on stop"
            );
            self.pending.clear();
        }
        tracing::info!(
            target = "snack::transport::pubsub",
            channel = self.core.channel_id(),
            "transport stopped"
        );
        self.core.finish();
    }
}

async fn next_relay_event(subscription: &mut Option<Subscription>) -> Option<RelayEvent> {
    match subscription {
        Some(subscription) => subscription.next_event().await,
        None => std::future::pending().await,
    }
}
