use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use relay_bus::{Relay, RelayError, WsRelay};
use serde::{Deserialize, Serialize};
use snack_proto::{Metadata, TransportMessage};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::channel::{ChannelDescriptor, ChannelError, resolve_channel};
use crate::config::RelayEndpoints;
use crate::dispatch::{Dispatcher, Event, Handler, ListenerId};

pub mod chunk;
pub mod direct;
pub mod pubsub;

pub use chunk::ChunkConfig;
pub use direct::{DirectLink, DirectTransport};
pub use pubsub::PubSubTransport;
pub use relay_bus::PresenceAction;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[serde(rename = "pubsub")]
    PubSub,
    Direct,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::PubSub => f.write_str("pubsub"),
            BackendKind::Direct => f.write_str("direct"),
        }
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pubsub" => Ok(BackendKind::PubSub),
            "direct" => Ok(BackendKind::Direct),
            other => Err(format!("unknown transport backend `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Message,
    Presence,
    Status,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connecting,
    Online,
    Reconnecting,
    Offline,
    Stopped,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Message {
        device_id: String,
        message: TransportMessage,
    },
    Presence {
        device_id: String,
        action: PresenceAction,
        metadata: Metadata,
    },
    Status {
        device_id: String,
        status: ConnectionStatus,
    },
}

impl TransportEvent {
    pub fn device_id(&self) -> &str {
        match self {
            TransportEvent::Message { device_id, .. }
            | TransportEvent::Presence { device_id, .. }
            | TransportEvent::Status { device_id, .. } => device_id,
        }
    }
}

impl Event for TransportEvent {
    type Kind = EventKind;

    fn kind(&self) -> EventKind {
        match self {
            TransportEvent::Message { .. } => EventKind::Message,
            TransportEvent::Presence { .. } => EventKind::Presence,
            TransportEvent::Status { .. } => EventKind::Status,
        }
    }
}

pub type TransportHandler = Handler<TransportEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Connecting,
    Subscribed,
    Reconnecting,
    Disconnected,
    Stopped,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("unknown test transport `{0}`")]
    UnknownTestTransport(String),
    #[error("{0} backend requires resources that were not supplied")]
    MissingBackend(BackendKind),
    #[error("relay endpoint rejected: {0}")]
    Endpoint(#[from] RelayError),
    #[error("transports must be created inside a tokio runtime")]
    NoRuntime,
}

/// Contract shared by every backend. All methods return immediately; I/O
/// completions surface through registered listeners.
pub trait Transport: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn descriptor(&self) -> &ChannelDescriptor;

    /// Identity this side announces to its peers.
    fn device_id(&self) -> &str;

    fn state(&self) -> TransportState;

    /// Queues `message` for delivery. After the transport stopped this only
    /// logs a warning.
    fn post_message(&self, message: TransportMessage);

    fn add_listener(&self, kind: EventKind, handler: TransportHandler) -> ListenerId;

    fn remove_listener(&self, kind: EventKind, id: ListenerId) -> bool;

    fn is_stopped(&self) -> bool {
        self.state() == TransportState::Stopped
    }
}

/// Exponential reconnect schedule for relay subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub jitter: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
            jitter: true,
        }
    }
}

#[derive(Debug)]
pub(crate) struct Backoff {
    policy: ReconnectPolicy,
    current: Duration,
}

impl Backoff {
    pub(crate) fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            current: policy.initial,
        }
    }

    pub(crate) fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = std::cmp::min(self.current * 2, self.policy.max);
        if !self.policy.jitter || base.is_zero() {
            return base;
        }
        let spread = base.as_millis() as u64 / 4;
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=spread));
        std::cmp::min(base + jitter, self.policy.max)
    }

    pub(crate) fn reset(&mut self) {
        self.current = self.policy.initial;
    }
}

/// Construction bag for a transport.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub experience_address: String,
    pub transport_backend: Option<BackendKind>,
    pub experimental_endpoint_override: bool,
    /// Overrides the `testTransport` query parameter of the address.
    pub test_transport: Option<String>,
    pub device_id: String,
    pub metadata: Metadata,
    pub relay: RelayEndpoints,
    pub chunk: ChunkConfig,
    pub reconnect: ReconnectPolicy,
    /// Outbound messages buffered while the relay is unreachable.
    pub max_pending_outbound: usize,
}

impl TransportConfig {
    pub fn new(experience_address: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            experience_address: experience_address.into(),
            transport_backend: None,
            experimental_endpoint_override: false,
            test_transport: None,
            device_id: device_id.into(),
            metadata: Metadata::new(),
            relay: RelayEndpoints::default(),
            chunk: ChunkConfig::default(),
            reconnect: ReconnectPolicy::default(),
            max_pending_outbound: 256,
        }
    }

    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.transport_backend = Some(backend);
        self
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<String>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// Backend resources supplied by the caller; the pub/sub backend falls back
/// to a WebSocket relay at the configured endpoint.
#[derive(Default)]
pub struct TransportResources {
    pub relay: Option<Arc<dyn Relay>>,
    pub direct_link: Option<DirectLink>,
}

impl TransportResources {
    pub fn relay(relay: Arc<dyn Relay>) -> Self {
        Self {
            relay: Some(relay),
            direct_link: None,
        }
    }

    pub fn direct(link: DirectLink) -> Self {
        Self {
            relay: None,
            direct_link: Some(link),
        }
    }
}

/// Creates a transport and starts it immediately.
pub fn create_transport(
    config: TransportConfig,
    resources: TransportResources,
) -> Result<Arc<dyn Transport>, TransportError> {
    create_transport_with(config, resources, |_| {})
}

/// Creates a transport, runs `setup` (typically registering listeners), then
/// starts the backend, so no event is emitted before `setup` returns.
pub fn create_transport_with<F>(
    config: TransportConfig,
    resources: TransportResources,
    setup: F,
) -> Result<Arc<dyn Transport>, TransportError>
where
    F: FnOnce(&Arc<dyn Transport>),
{
    if tokio::runtime::Handle::try_current().is_err() {
        return Err(TransportError::NoRuntime);
    }
    let descriptor = resolve_channel(&config.experience_address)?;
    let backend = config.transport_backend.unwrap_or(BackendKind::PubSub);

    let (transport, starter): (Arc<dyn Transport>, Starter) = match backend {
        BackendKind::PubSub => {
            let test_transport = config
                .test_transport
                .as_deref()
                .or_else(|| descriptor.test_transport());
            let endpoint = config
                .relay
                .select(test_transport, config.experimental_endpoint_override)?
                .to_string();
            let relay = match resources.relay {
                Some(relay) => relay,
                None => Arc::new(WsRelay::new(&endpoint, config.chunk.max_message_bytes)?),
            };
            tracing::debug!(
                target = "snack::transport",
                channel = descriptor.channel_id(),
                %endpoint,
                "creating pub/sub transport"
            );
            let (transport, starter) = PubSubTransport::new(&config, descriptor, relay);
            (Arc::new(transport) as Arc<dyn Transport>, starter)
        }
        BackendKind::Direct => {
            let link = resources
                .direct_link
                .ok_or(TransportError::MissingBackend(BackendKind::Direct))?;
            tracing::debug!(
                target = "snack::transport",
                channel = descriptor.channel_id(),
                "creating direct transport"
            );
            let (transport, starter) = DirectTransport::new(&config, descriptor, link);
            (Arc::new(transport) as Arc<dyn Transport>, starter)
        }
    };

    setup(&transport);
    starter.start();
    Ok(transport)
}

/// Releases a backend driver that was spawned parked.
pub(crate) struct Starter(oneshot::Sender<()>);

impl Starter {
    pub(crate) fn pair() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self(tx), rx)
    }

    pub(crate) fn start(self) {
        let _ = self.0.send(());
    }
}

/// State shared between a backend handle and its driver task.
pub(crate) struct TransportCore {
    kind: BackendKind,
    descriptor: ChannelDescriptor,
    device_id: String,
    state: Mutex<TransportState>,
    last_status: Mutex<Option<ConnectionStatus>>,
    dispatcher: Dispatcher<TransportEvent>,
    outbound: mpsc::UnboundedSender<TransportMessage>,
}

impl TransportCore {
    pub(crate) fn new(
        kind: BackendKind,
        descriptor: ChannelDescriptor,
        device_id: String,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<TransportMessage>) {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let core = Arc::new(Self {
            kind,
            descriptor,
            device_id,
            state: Mutex::new(TransportState::Connecting),
            last_status: Mutex::new(None),
            dispatcher: Dispatcher::new(),
            outbound,
        });
        (core, outbound_rx)
    }

    pub(crate) fn kind(&self) -> BackendKind {
        self.kind
    }

    pub(crate) fn descriptor(&self) -> &ChannelDescriptor {
        &self.descriptor
    }

    pub(crate) fn channel_id(&self) -> &str {
        self.descriptor.channel_id()
    }

    pub(crate) fn device_id(&self) -> &str {
        &self.device_id
    }

    pub(crate) fn state(&self) -> TransportState {
        *self.state.lock()
    }

    /// Never leaves `Stopped`.
    pub(crate) fn set_state(&self, next: TransportState) {
        let mut state = self.state.lock();
        if *state != TransportState::Stopped {
            *state = next;
        }
    }

    pub(crate) fn post(&self, message: TransportMessage) {
        {
            let mut state = self.state.lock();
            if *state == TransportState::Stopped {
                tracing::warn!(
                    target = "snack::transport",
                    channel = self.channel_id(),
                    kind = message.kind.as_str(),
                    "SendAfterStop: message posted after transport stopped; dropping"
                );
                return;
            }
            if message.is_stop() {
                *state = TransportState::Stopped;
            }
        }
        if self.outbound.send(message).is_err() {
            tracing::warn!(
                target = "snack::transport",
                channel = self.channel_id(),
                "transport driver gone; dropping message"
            );
        }
    }

    pub(crate) fn add_listener(&self, kind: EventKind, handler: TransportHandler) -> ListenerId {
        self.dispatcher.add_handler(kind, handler)
    }

    pub(crate) fn remove_listener(&self, kind: EventKind, id: ListenerId) -> bool {
        self.dispatcher.remove_listener(kind, id)
    }

    pub(crate) fn emit(&self, event: TransportEvent) {
        self.dispatcher.emit(&event);
    }

    /// Emits a local status change, suppressing repeats of the last status.
    pub(crate) fn emit_status(&self, status: ConnectionStatus) {
        {
            let mut last = self.last_status.lock();
            if *last == Some(status) {
                return;
            }
            *last = Some(status);
        }
        tracing::debug!(
            target = "snack::transport",
            channel = self.channel_id(),
            backend = %self.kind,
            ?status,
            "transport status"
        );
        self.emit(TransportEvent::Status {
            device_id: self.device_id.clone(),
            status,
        });
    }

    /// Terminal transition: `Status(stopped)` is the last event observers see.
    pub(crate) fn finish(&self) {
        *self.state.lock() = TransportState::Stopped;
        self.emit_status(ConnectionStatus::Stopped);
        self.dispatcher.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_until_capped() {
        let mut backoff = Backoff::new(ReconnectPolicy {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(5),
            jitter: false,
        });
        let delays: Vec<u64> = (0..5).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 5, 5]);
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn jitter_never_exceeds_cap() {
        let policy = ReconnectPolicy {
            initial: Duration::from_millis(800),
            max: Duration::from_secs(1),
            jitter: true,
        };
        let mut backoff = Backoff::new(policy);
        for _ in 0..20 {
            assert!(backoff.next_delay() <= policy.max);
        }
    }

    #[test]
    fn backend_kind_parses_case_insensitively() {
        assert_eq!("PubSub".parse::<BackendKind>(), Ok(BackendKind::PubSub));
        assert_eq!("direct".parse::<BackendKind>(), Ok(BackendKind::Direct));
        assert!("carrier-pigeon".parse::<BackendKind>().is_err());
    }

    #[test]
    fn construction_outside_runtime_fails_synchronously() {
        let config = TransportConfig::new("exp://exp.host/@owner/sdk.40.0.0-abc123", "editor");
        let err = create_transport(config, TransportResources::default())
            .err()
            .expect("no runtime");
        assert!(matches!(err, TransportError::NoRuntime));
    }

    #[tokio::test]
    async fn malformed_address_fails_construction() {
        let config = TransportConfig::new("exp://exp.host/@owner/abc123", "editor");
        let err = create_transport(config, TransportResources::default())
            .err()
            .expect("malformed");
        assert!(matches!(
            err,
            TransportError::Channel(ChannelError::MalformedAddress { .. })
        ));
    }

    #[tokio::test]
    async fn unknown_test_transport_fails_construction() {
        let config =
            TransportConfig::new("exp://exp.host/@owner/sdk.40.0.0-abc123?testTransport=nope", "editor");
        let err = create_transport(config, TransportResources::default())
            .err()
            .expect("unknown test transport");
        assert!(matches!(err, TransportError::UnknownTestTransport(name) if name == "nope"));
    }

    #[tokio::test]
    async fn direct_backend_requires_a_link() {
        let config = TransportConfig::new("exp://exp.host/@owner/sdk.40.0.0-abc123", "editor")
            .with_backend(BackendKind::Direct);
        let err = create_transport(config, TransportResources::default())
            .err()
            .expect("missing link");
        assert!(matches!(err, TransportError::MissingBackend(BackendKind::Direct)));
    }
}
