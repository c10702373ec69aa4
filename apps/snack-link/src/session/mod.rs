//! Editor side of a live session: keeps the latest project state, follows
//! the devices attached to the channel and gates every payload on what each
//! device's runtime supports.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{Map, Value, json};
use snack_proto::{MessageType, TransportMessage};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::capability::{CapabilityTable, features};
use crate::collaborators::{
    AnalyticsSink, ModuleResolver, PackageSpec, Platform, TracingAnalytics,
};
use crate::config::DEFAULT_PRESENCE_GRACE;
use crate::dispatch::{Dispatcher, Event, Handler, ListenerId};
use crate::registry::{Device, DeviceRegistry, DeviceSnapshot, RegistryEvent, RegistryEventKind};
use crate::telemetry;
use crate::transport::{
    ConnectionStatus, EventKind, Transport, TransportConfig, TransportError, TransportEvent,
    TransportResources, create_transport_with,
};

pub mod payload;

use payload::{CodeFiles, ResolvedDependency};

/// Services a session consults while delivering payloads.
#[derive(Clone)]
pub struct Collaborators {
    pub resolver: Arc<dyn ModuleResolver>,
    pub analytics: Arc<dyn AnalyticsSink>,
    pub capabilities: CapabilityTable,
}

impl Collaborators {
    pub fn new(resolver: Arc<dyn ModuleResolver>) -> Self {
        Self {
            resolver,
            analytics: Arc::new(TracingAnalytics),
            capabilities: CapabilityTable::builtin(),
        }
    }

    pub fn with_analytics(mut self, analytics: Arc<dyn AnalyticsSink>) -> Self {
        self.analytics = analytics;
        self
    }

    pub fn with_capabilities(mut self, capabilities: CapabilityTable) -> Self {
        self.capabilities = capabilities;
        self
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub transport: TransportConfig,
    pub presence_grace: Duration,
}

impl SessionConfig {
    pub fn new(transport: TransportConfig) -> Self {
        Self {
            transport,
            presence_grace: DEFAULT_PRESENCE_GRACE,
        }
    }

    pub fn with_presence_grace(mut self, grace: Duration) -> Self {
        self.presence_grace = grace;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionDiagnostic {
    /// A payload was withheld (or downgraded) because the device's runtime
    /// lacks `feature`.
    UnsupportedFeature {
        device_id: String,
        feature: String,
        version: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionEventKind {
    DevicesChanged,
    Message,
    Status,
    Diagnostic,
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    DevicesChanged(DeviceSnapshot),
    Message {
        device_id: String,
        message: TransportMessage,
    },
    Status(ConnectionStatus),
    Diagnostic(SessionDiagnostic),
}

impl Event for SessionEvent {
    type Kind = SessionEventKind;

    fn kind(&self) -> SessionEventKind {
        match self {
            SessionEvent::DevicesChanged(_) => SessionEventKind::DevicesChanged,
            SessionEvent::Message { .. } => SessionEventKind::Message,
            SessionEvent::Status(_) => SessionEventKind::Status,
            SessionEvent::Diagnostic(_) => SessionEventKind::Diagnostic,
        }
    }
}

/// Which online devices a gated message reached.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GatedDelivery {
    pub delivered: Vec<String>,
    pub withheld: Vec<String>,
}

#[derive(Debug, Default)]
struct LatestState {
    init: Option<Value>,
    code: Option<CodeFiles>,
    dependencies: Option<BTreeMap<String, String>>,
    /// Bumped on every `send_dependencies`; resolutions started under an older
    /// generation are not posted.
    dependencies_generation: u64,
}

enum SessionInput {
    Transport(TransportEvent),
    DeviceOnline(Device),
    DevicesChanged(DeviceSnapshot),
}

struct SessionInner {
    transport: Arc<dyn Transport>,
    registry: DeviceRegistry,
    collaborators: Collaborators,
    latest: Mutex<LatestState>,
    events: Dispatcher<SessionEvent>,
    first_code_recorded: AtomicBool,
}

pub struct Session {
    inner: Arc<SessionInner>,
    worker: JoinHandle<()>,
}

impl Session {
    /// Creates the transport for `config`, attaches a device registry to it
    /// and starts following the channel.
    pub fn open(
        config: SessionConfig,
        resources: TransportResources,
        collaborators: Collaborators,
    ) -> Result<Self, TransportError> {
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(TransportError::NoRuntime);
        }
        let (input_tx, input_rx) = mpsc::unbounded_channel();

        let registry = DeviceRegistry::spawn(config.presence_grace);
        let registry_tx = input_tx.clone();
        let registry_handler: Handler<RegistryEvent> = Arc::new(move |event: &RegistryEvent| {
            let input = match event {
                RegistryEvent::DeviceOnline(device) => SessionInput::DeviceOnline(device.clone()),
                RegistryEvent::DevicesChanged(snapshot) => {
                    SessionInput::DevicesChanged(Arc::clone(snapshot))
                }
                RegistryEvent::DeviceRemoved(_) => return,
            };
            let _ = registry_tx.send(input);
        });
        registry.add_listener(RegistryEventKind::DeviceOnline, Arc::clone(&registry_handler));
        registry.add_listener(RegistryEventKind::DevicesChanged, registry_handler);

        let transport = create_transport_with(config.transport, resources, |transport| {
            registry.attach(transport.as_ref());
            for kind in [EventKind::Message, EventKind::Status] {
                let tx = input_tx.clone();
                transport.add_listener(
                    kind,
                    Arc::new(move |event: &TransportEvent| {
                        let _ = tx.send(SessionInput::Transport(event.clone()));
                    }),
                );
            }
        })?;
        drop(input_tx);

        tracing::info!(
            target = "snack::session",
            channel = transport.descriptor().channel_id(),
            backend = %transport.kind(),
            "session opened"
        );

        let inner = Arc::new(SessionInner {
            transport,
            registry,
            collaborators,
            latest: Mutex::new(LatestState::default()),
            events: Dispatcher::new(),
            first_code_recorded: AtomicBool::new(false),
        });
        let span = telemetry::channel_span(
            inner.transport.descriptor().channel_id(),
            inner.transport.device_id(),
        );
        let worker = tokio::spawn(run(Arc::clone(&inner), input_rx).instrument(span));
        Ok(Self { inner, worker })
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.inner.registry
    }

    pub fn channel_id(&self) -> &str {
        self.inner.transport.descriptor().channel_id()
    }

    pub fn devices(&self) -> DeviceSnapshot {
        self.inner.registry.snapshot()
    }

    pub fn add_listener(&self, kind: SessionEventKind, handler: Handler<SessionEvent>) -> ListenerId {
        self.inner.events.add_handler(kind, handler)
    }

    pub fn remove_listener(&self, kind: SessionEventKind, id: ListenerId) -> bool {
        self.inner.events.remove_listener(kind, id)
    }

    pub fn send_init(&self, payload: Value) {
        self.inner.latest.lock().init = Some(payload.clone());
        self.inner.post(MessageType::Init, payload, None);
    }

    /// Broadcasts project files. Runtimes without binary payload support get
    /// the source files only.
    pub fn send_code(&self, files: CodeFiles) {
        self.inner.latest.lock().code = Some(files.clone());
        self.inner.record_first_code(&files);
        self.inner.deliver_code(&files, None);
    }

    /// Resolves `dependencies` for every online device and sends each one the
    /// shape its runtime understands.
    pub async fn send_dependencies(&self, dependencies: BTreeMap<String, String>) {
        let generation = {
            let mut latest = self.inner.latest.lock();
            latest.dependencies = Some(dependencies.clone());
            latest.dependencies_generation += 1;
            latest.dependencies_generation
        };
        for device in self.inner.registry.online() {
            self.inner
                .deliver_dependencies(&dependencies, generation, &device)
                .await;
        }
    }

    pub fn send_status(&self, payload: Value) {
        self.inner.post(MessageType::Status, payload, None);
    }

    /// Sends `message` to each online device whose runtime supports
    /// `feature`; the others get an `UnsupportedFeature` diagnostic.
    pub fn post_gated(&self, feature: &str, message: TransportMessage) -> GatedDelivery {
        let mut delivery = GatedDelivery::default();
        for device in self.inner.registry.online() {
            if self.inner.supports(&device, feature) {
                self.inner
                    .transport
                    .post_message(message.clone().with_target(device.id.clone()));
                delivery.delivered.push(device.id);
            } else {
                self.inner.unsupported(&device, feature);
                delivery.withheld.push(device.id);
            }
        }
        delivery
    }

    /// Tears the session down; every attached runtime is told to stop.
    pub fn stop(&self) {
        let transport = &self.inner.transport;
        transport.post_message(TransportMessage::stop(
            transport.device_id(),
            transport.descriptor().channel_id(),
        ));
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

impl SessionInner {
    fn post(&self, kind: MessageType, payload: Value, target: Option<&str>) {
        let mut message = TransportMessage::new(kind, self.transport.device_id(), payload);
        if let Some(target) = target {
            message = message.with_target(target);
        }
        self.transport.post_message(message);
    }

    fn supports(&self, device: &Device, feature: &str) -> bool {
        device
            .version
            .as_deref()
            .is_some_and(|version| self.collaborators.capabilities.is_feature_supported(version, feature))
    }

    fn unsupported(&self, device: &Device, feature: &str) {
        tracing::info!(
            target = "snack::session",
            device = %device.id,
            version = ?device.version,
            feature,
            "UnsupportedFeature: payload withheld"
        );
        self.events.emit(&SessionEvent::Diagnostic(
            SessionDiagnostic::UnsupportedFeature {
                device_id: device.id.clone(),
                feature: feature.to_string(),
                version: device.version.clone(),
            },
        ));
    }

    /// `only` limits delivery to one device; otherwise every online device.
    fn deliver_code(&self, files: &CodeFiles, only: Option<&Device>) {
        let full = payload::code(files);
        if !payload::has_assets(files) {
            self.post(MessageType::Code, full, only.map(|device| device.id.as_str()));
            return;
        }

        let devices = match only {
            Some(device) => vec![device.clone()],
            None => self.registry.online(),
        };
        let legacy: Vec<&Device> = devices
            .iter()
            .filter(|device| !self.supports(device, features::BINARY_CODE_PAYLOAD))
            .collect();
        if only.is_none() && legacy.is_empty() {
            self.post(MessageType::Code, full, None);
            return;
        }

        let source_only = payload::code(&payload::source_only(files));
        for device in &devices {
            if self.supports(device, features::BINARY_CODE_PAYLOAD) {
                self.post(MessageType::Code, full.clone(), Some(&device.id));
            } else {
                self.unsupported(device, features::BINARY_CODE_PAYLOAD);
                self.post(MessageType::Code, source_only.clone(), Some(&device.id));
            }
        }
    }

    async fn deliver_dependencies(
        &self,
        declared: &BTreeMap<String, String>,
        generation: u64,
        device: &Device,
    ) {
        let version = match device.version.as_deref() {
            Some(version) if self.supports(device, features::PROJECT_DEPENDENCIES) => version,
            _ => {
                if self.dependencies_superseded(generation, device) {
                    return;
                }
                self.unsupported(device, features::PROJECT_DEPENDENCIES);
                self.post(
                    MessageType::Dependencies,
                    payload::legacy_dependencies(declared),
                    Some(&device.id),
                );
                return;
            }
        };
        let platform = device
            .platform
            .as_deref()
            .and_then(|platform| platform.parse::<Platform>().ok());

        let mut resolved = BTreeMap::new();
        for (name, range) in declared {
            let package = PackageSpec::new(name.clone(), range.clone());
            let result = self
                .collaborators
                .resolver
                .resolve_module_url(&package, version, platform)
                .await;
            if let Err(err) = &result {
                tracing::warn!(
                    target = "snack::session",
                    device = %device.id,
                    error = %err,
                    "dependency unresolved"
                );
            }
            resolved.insert(name.clone(), ResolvedDependency::from_result(range, result));
        }
        if self.dependencies_superseded(generation, device) {
            return;
        }
        self.post(
            MessageType::Dependencies,
            payload::dependencies(&resolved),
            Some(&device.id),
        );
    }

    fn dependencies_superseded(&self, generation: u64, device: &Device) -> bool {
        let current = self.latest.lock().dependencies_generation;
        if current == generation {
            return false;
        }
        tracing::debug!(
            target = "snack::session",
            device = %device.id,
            generation,
            current,
            "dropping superseded dependency resolution"
        );
        true
    }

    /// Sends the latest project state to `device`, or to every online device.
    async fn replay(&self, only: Option<&Device>) {
        let (init, code, dependencies, generation) = {
            let latest = self.latest.lock();
            (
                latest.init.clone(),
                latest.code.clone(),
                latest.dependencies.clone(),
                latest.dependencies_generation,
            )
        };
        if let Some(init) = init {
            self.post(MessageType::Init, init, only.map(|device| device.id.as_str()));
        }
        if let Some(files) = code {
            self.deliver_code(&files, only);
        }
        if let Some(declared) = dependencies {
            let devices = match only {
                Some(device) => vec![device.clone()],
                None => self.registry.online(),
            };
            for device in &devices {
                self.deliver_dependencies(&declared, generation, device).await;
            }
        }
    }

    fn record_first_code(&self, files: &CodeFiles) {
        if self.first_code_recorded.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut properties = Map::new();
        properties.insert(
            "channel".into(),
            json!(self.transport.descriptor().channel_id()),
        );
        properties.insert("files".into(), json!(files.len()));
        self.record("session_first_code", properties);
    }

    fn record(&self, event: &str, properties: Map<String, Value>) {
        if let Err(err) = self.collaborators.analytics.record(event, &properties) {
            tracing::warn!(
                target = "snack::session",
                event,
                error = %err,
                "analytics sink failed"
            );
        }
    }
}

async fn run(inner: Arc<SessionInner>, mut input: mpsc::UnboundedReceiver<SessionInput>) {
    let mut was_online = false;
    let mut awaiting_resync = false;
    while let Some(input) = input.recv().await {
        match input {
            SessionInput::Transport(TransportEvent::Message { device_id, message }) => {
                inner
                    .events
                    .emit(&SessionEvent::Message { device_id, message });
            }
            SessionInput::Transport(TransportEvent::Status { status, .. }) => {
                inner.events.emit(&SessionEvent::Status(status));
                match status {
                    ConnectionStatus::Reconnecting | ConnectionStatus::Offline => {
                        awaiting_resync = was_online;
                    }
                    ConnectionStatus::Online => {
                        was_online = true;
                        if awaiting_resync {
                            awaiting_resync = false;
                            tracing::info!(
                                target = "snack::session",
                                channel = inner.transport.descriptor().channel_id(),
                                "transport back online; resending latest state"
                            );
                            inner.replay(None).await;
                        }
                    }
                    ConnectionStatus::Stopped => {
                        tracing::info!(
                            target = "snack::session",
                            channel = inner.transport.descriptor().channel_id(),
                            "session stopped"
                        );
                        break;
                    }
                    _ => {}
                }
            }
            SessionInput::Transport(TransportEvent::Presence { .. }) => {}
            SessionInput::DeviceOnline(device) => {
                let mut properties = Map::new();
                properties.insert("device".into(), json!(device.id));
                properties.insert("version".into(), json!(device.version));
                properties.insert("platform".into(), json!(device.platform));
                inner.record("device_online", properties);
                inner.replay(Some(&device)).await;
            }
            SessionInput::DevicesChanged(snapshot) => {
                inner.events.emit(&SessionEvent::DevicesChanged(snapshot));
            }
        }
    }
}
