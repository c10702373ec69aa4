//! Tracks which runtimes are connected to a session.
//!
//! All mutations go through one worker task; readers get immutable snapshots
//! from a `watch` channel or typed [`RegistryEvent`]s.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::Serialize;
use snack_proto::{META_NAME, META_PLATFORM, META_VERSION, MessageType, Metadata};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

use crate::dispatch::{Dispatcher, Event, Handler, ListenerId};
use crate::transport::{
    ConnectionStatus, EventKind, PresenceAction, Transport, TransportEvent,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Connecting,
    Online,
    Offline,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub id: String,
    pub version: Option<String>,
    pub platform: Option<String>,
    pub name: Option<String>,
    pub status: DeviceStatus,
    pub last_seen: SystemTime,
}

impl Device {
    fn new(id: String) -> Self {
        Self {
            id,
            version: None,
            platform: None,
            name: None,
            status: DeviceStatus::Connecting,
            last_seen: SystemTime::now(),
        }
    }

    fn merge_metadata(&mut self, metadata: &Metadata) {
        if let Some(version) = metadata.get(META_VERSION) {
            self.version = Some(version.clone());
        }
        if let Some(platform) = metadata.get(META_PLATFORM) {
            self.platform = Some(platform.clone());
        }
        if let Some(name) = metadata.get(META_NAME) {
            self.name = Some(name.clone());
        }
    }

    pub fn is_online(&self) -> bool {
        self.status == DeviceStatus::Online
    }
}

pub type DeviceSnapshot = Arc<BTreeMap<String, Device>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegistryEventKind {
    DevicesChanged,
    DeviceOnline,
    DeviceRemoved,
}

#[derive(Debug, Clone)]
pub enum RegistryEvent {
    DevicesChanged(DeviceSnapshot),
    /// A device became online, either newly joined or back from offline.
    DeviceOnline(Device),
    DeviceRemoved(String),
}

impl Event for RegistryEvent {
    type Kind = RegistryEventKind;

    fn kind(&self) -> RegistryEventKind {
        match self {
            RegistryEvent::DevicesChanged(_) => RegistryEventKind::DevicesChanged,
            RegistryEvent::DeviceOnline(_) => RegistryEventKind::DeviceOnline,
            RegistryEvent::DeviceRemoved(_) => RegistryEventKind::DeviceRemoved,
        }
    }
}

#[derive(Debug)]
enum Command {
    Presence {
        device_id: String,
        action: PresenceAction,
        metadata: Metadata,
    },
    Status {
        device_id: String,
        status: ConnectionStatus,
    },
    /// A `status` message from a runtime: proof of life.
    Seen { device_id: String },
}

pub struct DeviceRegistry {
    commands: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<DeviceSnapshot>,
    events: Arc<Dispatcher<RegistryEvent>>,
    worker: JoinHandle<()>,
}

impl DeviceRegistry {
    /// Starts the registry worker on the current tokio runtime.
    pub fn spawn(grace: Duration) -> Self {
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot) = watch::channel(DeviceSnapshot::default());
        let events = Arc::new(Dispatcher::new());
        let worker = Worker {
            devices: BTreeMap::new(),
            deadlines: HashMap::new(),
            grace,
            snapshot: snapshot_tx,
            events: Arc::clone(&events),
        };
        let worker = tokio::spawn(worker.run(commands_rx));
        Self {
            commands,
            snapshot,
            events,
            worker,
        }
    }

    /// Feeds presence and status events of `transport` into this registry.
    /// Status events about the transport's own device are ignored.
    pub fn attach(&self, transport: &dyn Transport) -> Vec<(EventKind, ListenerId)> {
        let local = transport.device_id().to_string();
        let commands = self.commands.clone();
        let handler: Handler<TransportEvent> = Arc::new(move |event: &TransportEvent| {
            let command = match event {
                TransportEvent::Presence {
                    device_id,
                    action,
                    metadata,
                } => Command::Presence {
                    device_id: device_id.clone(),
                    action: *action,
                    metadata: metadata.clone(),
                },
                TransportEvent::Status { device_id, status } if *device_id != local => {
                    Command::Status {
                        device_id: device_id.clone(),
                        status: *status,
                    }
                }
                TransportEvent::Message { device_id, message }
                    if message.kind == MessageType::Status && *device_id != local =>
                {
                    Command::Seen {
                        device_id: device_id.clone(),
                    }
                }
                _ => return,
            };
            let _ = commands.send(command);
        });
        vec![
            (
                EventKind::Presence,
                transport.add_listener(EventKind::Presence, Arc::clone(&handler)),
            ),
            (
                EventKind::Status,
                transport.add_listener(EventKind::Status, Arc::clone(&handler)),
            ),
            (
                EventKind::Message,
                transport.add_listener(EventKind::Message, handler),
            ),
        ]
    }

    pub fn record_presence(&self, device_id: &str, action: PresenceAction, metadata: Metadata) {
        let _ = self.commands.send(Command::Presence {
            device_id: device_id.to_string(),
            action,
            metadata,
        });
    }

    pub fn record_status(&self, device_id: &str, status: ConnectionStatus) {
        let _ = self.commands.send(Command::Status {
            device_id: device_id.to_string(),
            status,
        });
    }

    pub fn snapshot(&self) -> DeviceSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn get(&self, device_id: &str) -> Option<Device> {
        self.snapshot.borrow().get(device_id).cloned()
    }

    pub fn online(&self) -> Vec<Device> {
        self.snapshot
            .borrow()
            .values()
            .filter(|device| device.is_online())
            .cloned()
            .collect()
    }

    /// Resolves with the first snapshot satisfying `predicate`, or `None`
    /// once the registry shut down.
    pub async fn wait_for<F>(&self, mut predicate: F) -> Option<DeviceSnapshot>
    where
        F: FnMut(&BTreeMap<String, Device>) -> bool,
    {
        let mut rx = self.snapshot.clone();
        rx.wait_for(|snapshot| predicate(snapshot))
            .await
            .ok()
            .map(|snapshot| snapshot.clone())
    }

    pub fn subscribe(&self) -> watch::Receiver<DeviceSnapshot> {
        self.snapshot.clone()
    }

    pub fn add_listener(
        &self,
        kind: RegistryEventKind,
        handler: Handler<RegistryEvent>,
    ) -> ListenerId {
        self.events.add_handler(kind, handler)
    }

    pub fn remove_listener(&self, kind: RegistryEventKind, id: ListenerId) -> bool {
        self.events.remove_listener(kind, id)
    }
}

impl Drop for DeviceRegistry {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

struct Worker {
    devices: BTreeMap<String, Device>,
    /// Removal deadlines of offline devices.
    deadlines: HashMap<String, Instant>,
    grace: Duration,
    snapshot: watch::Sender<DeviceSnapshot>,
    events: Arc<Dispatcher<RegistryEvent>>,
}

impl Worker {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            let next_deadline = self.deadlines.values().min().copied();
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else { break };
                    self.apply(command);
                }
                _ = sleep_until(next_deadline), if next_deadline.is_some() => {
                    self.remove_expired(Instant::now());
                }
            }
        }
    }

    fn apply(&mut self, command: Command) {
        match command {
            Command::Presence {
                device_id,
                action: PresenceAction::Join,
                metadata,
            } => {
                let device = self
                    .devices
                    .entry(device_id.clone())
                    .or_insert_with(|| Device::new(device_id.clone()));
                device.merge_metadata(&metadata);
                device.last_seen = SystemTime::now();
                let came_online = device.status != DeviceStatus::Online;
                device.status = DeviceStatus::Online;
                let device = device.clone();
                self.deadlines.remove(&device_id);
                tracing::debug!(
                    target = "snack::registry",
                    device = %device_id,
                    version = ?device.version,
                    "device joined"
                );
                self.publish();
                if came_online {
                    self.events.emit(&RegistryEvent::DeviceOnline(device));
                }
            }
            Command::Presence {
                device_id, action, ..
            } => {
                if self.mark_offline(&device_id) {
                    tracing::debug!(
                        target = "snack::registry",
                        device = %device_id,
                        ?action,
                        grace_ms = self.grace.as_millis() as u64,
                        "device left; retaining for grace period"
                    );
                    self.publish();
                }
            }
            Command::Status { device_id, status } => {
                let Some(device) = self.devices.get_mut(&device_id) else {
                    tracing::trace!(
                        target = "snack::registry",
                        device = %device_id,
                        "status for unknown device"
                    );
                    return;
                };
                device.last_seen = SystemTime::now();
                match status {
                    ConnectionStatus::Online => self.mark_online(&device_id),
                    ConnectionStatus::Connecting | ConnectionStatus::Reconnecting => {
                        device.status = DeviceStatus::Connecting;
                        self.publish();
                    }
                    ConnectionStatus::Offline | ConnectionStatus::Stopped => {
                        self.mark_offline(&device_id);
                        self.publish();
                    }
                }
            }
            Command::Seen { device_id } => {
                let Some(device) = self.devices.get_mut(&device_id) else {
                    return;
                };
                device.last_seen = SystemTime::now();
                // a runtime that is talking is connected, whatever presence said last
                self.mark_online(&device_id);
            }
        }
    }

    fn mark_online(&mut self, device_id: &str) {
        let Some(device) = self.devices.get_mut(device_id) else {
            return;
        };
        let came_online = device.status != DeviceStatus::Online;
        device.status = DeviceStatus::Online;
        let device = device.clone();
        self.deadlines.remove(device_id);
        self.publish();
        if came_online {
            self.events.emit(&RegistryEvent::DeviceOnline(device));
        }
    }

    /// Returns whether the device was known.
    fn mark_offline(&mut self, device_id: &str) -> bool {
        let Some(device) = self.devices.get_mut(device_id) else {
            return false;
        };
        device.status = DeviceStatus::Offline;
        device.last_seen = SystemTime::now();
        self.deadlines
            .entry(device_id.to_string())
            .or_insert_with(|| Instant::now() + self.grace);
        true
    }

    fn remove_expired(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        if expired.is_empty() {
            return;
        }
        for id in &expired {
            self.deadlines.remove(id);
            self.devices.remove(id);
            tracing::debug!(
                target = "snack::registry",
                device = %id,
                "device removed after grace period"
            );
        }
        self.publish();
        for id in expired {
            self.events.emit(&RegistryEvent::DeviceRemoved(id));
        }
    }

    fn publish(&self) {
        let snapshot: DeviceSnapshot = Arc::new(self.devices.clone());
        self.snapshot.send_replace(Arc::clone(&snapshot));
        self.events.emit(&RegistryEvent::DevicesChanged(snapshot));
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;

    fn runtime_meta(version: &str) -> Metadata {
        Metadata::from([
            (META_VERSION.to_string(), version.to_string()),
            (META_PLATFORM.to_string(), "ios".to_string()),
        ])
    }

    #[tokio::test(start_paused = true)]
    async fn join_then_leave_removes_after_grace() {
        let registry = DeviceRegistry::spawn(Duration::from_secs(10));
        registry.record_presence("phone", PresenceAction::Join, runtime_meta("40.0.0"));
        let snapshot = registry
            .wait_for(|devices| devices.get("phone").is_some_and(Device::is_online))
            .await
            .expect("online");
        assert_eq!(snapshot["phone"].version.as_deref(), Some("40.0.0"));
        assert_eq!(snapshot["phone"].platform.as_deref(), Some("ios"));

        registry.record_presence("phone", PresenceAction::Leave, Metadata::new());
        registry
            .wait_for(|devices| {
                devices
                    .get("phone")
                    .is_some_and(|device| device.status == DeviceStatus::Offline)
            })
            .await
            .expect("offline");

        time::sleep(Duration::from_secs(9)).await;
        assert!(registry.get("phone").is_some(), "retained during grace");

        registry.wait_for(|devices| devices.is_empty()).await.expect("removed");
        assert!(registry.online().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn rejoin_within_grace_keeps_the_device() {
        let registry = DeviceRegistry::spawn(Duration::from_secs(10));
        registry.record_presence("phone", PresenceAction::Join, runtime_meta("40.0.0"));
        registry.record_presence("phone", PresenceAction::Timeout, Metadata::new());
        time::sleep(Duration::from_secs(5)).await;
        registry.record_presence("phone", PresenceAction::Join, Metadata::new());
        time::sleep(Duration::from_secs(30)).await;

        let device = registry.get("phone").expect("still registered");
        assert!(device.is_online());
        assert_eq!(device.version.as_deref(), Some("40.0.0"));
    }

    #[tokio::test(start_paused = true)]
    async fn events_report_online_and_removal() {
        let registry = DeviceRegistry::spawn(Duration::from_millis(100));
        let seen = Arc::new(Mutex::new(Vec::new()));
        for kind in [RegistryEventKind::DeviceOnline, RegistryEventKind::DeviceRemoved] {
            let seen = Arc::clone(&seen);
            registry.add_listener(
                kind,
                Arc::new(move |event: &RegistryEvent| match event {
                    RegistryEvent::DeviceOnline(device) => {
                        seen.lock().push(format!("online:{}", device.id))
                    }
                    RegistryEvent::DeviceRemoved(id) => seen.lock().push(format!("removed:{id}")),
                    RegistryEvent::DevicesChanged(_) => {}
                }),
            );
        }

        registry.record_presence("a", PresenceAction::Join, Metadata::new());
        registry.record_presence("a", PresenceAction::Join, Metadata::new());
        registry.record_presence("a", PresenceAction::Leave, Metadata::new());
        registry.wait_for(|devices| !devices.is_empty()).await;
        time::sleep(Duration::from_secs(1)).await;

        assert_eq!(*seen.lock(), vec!["online:a", "removed:a"]);
    }

    #[tokio::test]
    async fn unknown_devices_ignore_leave_and_status() {
        let registry = DeviceRegistry::spawn(Duration::from_secs(10));
        registry.record_presence("ghost", PresenceAction::Leave, Metadata::new());
        registry.record_status("ghost", ConnectionStatus::Offline);
        registry.record_presence("real", PresenceAction::Join, Metadata::new());
        let snapshot = registry
            .wait_for(|devices| devices.contains_key("real"))
            .await
            .expect("snapshot");
        assert_eq!(snapshot.len(), 1);
    }

    #[tokio::test]
    async fn remote_status_updates_known_devices() {
        let registry = DeviceRegistry::spawn(Duration::from_secs(10));
        registry.record_presence("tablet", PresenceAction::Join, Metadata::new());
        registry.record_status("tablet", ConnectionStatus::Reconnecting);
        let snapshot = registry
            .wait_for(|devices| {
                devices
                    .get("tablet")
                    .is_some_and(|device| device.status == DeviceStatus::Connecting)
            })
            .await
            .expect("connecting");
        assert!(!snapshot["tablet"].is_online());
    }
}
