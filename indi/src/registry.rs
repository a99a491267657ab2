//! Device registry and message dispatcher
//!
//! Routes every decoded message to the device it names. Devices are created
//! on their first definition; until the classifier settles on a kind, their
//! messages are buffered in arrival order and replayed on attach.
//!
//! Dispatch never writes to the wire or publishes events itself. It returns
//! a [`DispatchOutput`] that the session reader publishes and sends, so an
//! event consumer that issues commands cannot deadlock the dispatch path.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;

use crate::classify::{Classification, DeviceClassifier};
use crate::config::IndiConfig;
use crate::device::{Device, DeviceKind};
use crate::event::{DeviceEvent, DeviceRef, DomainEvent, EventBus};
use crate::message::Message;
use crate::property::{PropertyTable, Update};

/// Events to publish and commands to send, in order, after one dispatch
#[derive(Debug, Default)]
pub struct DispatchOutput {
    pub events: Vec<DomainEvent>,
    /// Events from updates that changed nothing; only pending waits see them
    pub replies: Vec<DomainEvent>,
    pub follow_ups: Vec<Message>,
}

impl DispatchOutput {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && self.replies.is_empty() && self.follow_ups.is_empty()
    }
}

#[derive(Default)]
struct PendingDevice {
    messages: Vec<Message>,
    table: PropertyTable,
}

/// Devices of one session
pub struct Registry {
    devices: RwLock<HashMap<String, DeviceRef>>,
    pending: Mutex<HashMap<String, PendingDevice>>,
    server_version: RwLock<Option<String>>,
    classifier: Arc<dyn DeviceClassifier>,
    outbox: mpsc::Sender<Message>,
    bus: Arc<EventBus>,
    config: Arc<IndiConfig>,
}

impl Registry {
    pub fn new(
        classifier: Arc<dyn DeviceClassifier>,
        outbox: mpsc::Sender<Message>,
        bus: Arc<EventBus>,
        config: Arc<IndiConfig>,
    ) -> Self {
        Self {
            devices: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            server_version: RwLock::new(None),
            classifier,
            outbox,
            bus,
            config,
        }
    }

    pub fn device(&self, name: &str) -> Option<DeviceRef> {
        self.devices.read().get(name).cloned()
    }

    /// Attached devices sorted by name
    pub fn devices(&self) -> Vec<DeviceRef> {
        let mut devices: Vec<DeviceRef> = self.devices.read().values().cloned().collect();
        devices.sort_by(|a, b| a.name().cmp(b.name()));
        devices
    }

    /// Devices seen but not yet classified
    pub fn pending_devices(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pending.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Protocol version the server announced, if any
    pub fn server_version(&self) -> Option<String> {
        self.server_version.read().clone()
    }

    /// Route one incoming message
    pub fn dispatch(&self, message: Message) -> DispatchOutput {
        let mut out = DispatchOutput::default();
        tracing::debug!("Dispatching {} for '{}'", message.tag(), message.device());

        match message {
            Message::GetProperties(get) => {
                if let Some(version) = get.version {
                    tracing::info!("INDI server speaks protocol {}", version);
                    *self.server_version.write() = Some(version);
                }
            }
            Message::Notice(notice) => {
                let device = notice.device.clone().unwrap_or_default();
                if let Some(dev) = self.device(&device) {
                    dev.log_message(notice.timestamp, notice.message, &mut out);
                } else if !self.buffer(&device, Message::Notice(notice.clone()), &mut out) {
                    tracing::info!("INDI server: {}", notice.message);
                    out.events.push(DomainEvent::ServerNotice(notice.message));
                }
            }
            Message::DefVector(def) => {
                if let Some(device) = self.device(&def.device) {
                    device.apply(Update::Define(&def), &mut out);
                } else {
                    let name = def.device.clone();
                    self.pending.lock().entry(name.clone()).or_default();
                    self.buffer(&name, Message::DefVector(def), &mut out);
                }
            }
            Message::SetVector(set) => {
                if let Some(device) = self.device(&set.device) {
                    device.apply(Update::Set(&set), &mut out);
                } else {
                    let name = set.device.clone();
                    if !self.buffer(&name, Message::SetVector(set), &mut out) {
                        tracing::warn!("Ignoring update for unknown device '{}'", name);
                    }
                }
            }
            Message::DelProperty(del) => match del.name.as_deref() {
                None => self.detach(&del.device, &mut out),
                Some(property) => {
                    if let Some(device) = self.device(&del.device) {
                        device.delete_property(property, &mut out);
                    } else {
                        let name = del.device.clone();
                        if !self.buffer(&name, Message::DelProperty(del.clone()), &mut out) {
                            tracing::debug!("delProperty for unknown device '{}'", name);
                        }
                    }
                }
            },
            other => {
                tracing::debug!("Ignoring client-side {} from server", other.tag());
            }
        }
        out
    }

    /// Buffer a message for a pending device and try to classify it.
    /// Returns false when `device` is not pending.
    fn buffer(&self, device: &str, message: Message, out: &mut DispatchOutput) -> bool {
        let kind = {
            let mut pending = self.pending.lock();
            let Some(entry) = pending.get_mut(device) else {
                return false;
            };
            match &message {
                Message::DefVector(def) => {
                    entry.table.apply(Update::Define(def));
                }
                Message::SetVector(set) => {
                    entry.table.apply(Update::Set(set));
                }
                Message::DelProperty(del) => {
                    if let Some(property) = &del.name {
                        entry.table.remove(property);
                    }
                }
                _ => {}
            }
            entry.messages.push(message);

            match self.classifier.classify(device, &entry.table) {
                Classification::Kind(kind) => Some(kind),
                Classification::Generic => Some(DeviceKind::Generic),
                Classification::Undecided
                    if entry.messages.len() >= self.config.pending_message_limit =>
                {
                    tracing::warn!(
                        "Device '{}' still unclassified after {} messages, attaching as generic",
                        device,
                        entry.messages.len()
                    );
                    Some(DeviceKind::Generic)
                }
                Classification::Undecided => None,
            }
        };

        if let Some(kind) = kind {
            let messages = self
                .pending
                .lock()
                .remove(device)
                .map(|p| p.messages)
                .unwrap_or_default();
            self.attach(device, kind, messages, out);
        }
        true
    }

    fn attach(&self, name: &str, kind: DeviceKind, replay: Vec<Message>, out: &mut DispatchOutput) {
        let device = Arc::new(Device::new(
            name.to_string(),
            kind,
            self.outbox.clone(),
            self.bus.clone(),
            self.config.clone(),
        ));
        self.devices.write().insert(name.to_string(), device.clone());
        tracing::info!("Device '{}' attached as {}", name, kind);
        out.events
            .push(DomainEvent::Device(device.clone(), DeviceEvent::Attached));

        for message in replay {
            match message {
                Message::DefVector(def) => device.apply(Update::Define(&def), out),
                Message::SetVector(set) => device.apply(Update::Set(&set), out),
                Message::Notice(notice) => device.log_message(notice.timestamp, notice.message, out),
                Message::DelProperty(del) => {
                    if let Some(property) = del.name {
                        device.delete_property(&property, out);
                    }
                }
                _ => {}
            }
        }
    }

    fn detach(&self, name: &str, out: &mut DispatchOutput) {
        if self.pending.lock().remove(name).is_some() {
            tracing::debug!("Dropped unclassified device '{}'", name);
        }
        let Some(device) = self.devices.write().remove(name) else {
            return;
        };
        device.mark_detached();
        tracing::info!("Device '{}' detached", name);
        out.events
            .push(DomainEvent::Device(device, DeviceEvent::Detached));
    }

    /// Detach every device, sorted by name; used when the session ends
    pub fn detach_all(&self) -> DispatchOutput {
        let mut out = DispatchOutput::default();
        self.pending.lock().clear();
        let mut devices: Vec<DeviceRef> = self.devices.write().drain().map(|(_, d)| d).collect();
        devices.sort_by(|a, b| a.name().cmp(b.name()));
        for device in devices {
            device.mark_detached();
            tracing::info!("Device '{}' detached", device.name());
            out.events
                .push(DomainEvent::Device(device, DeviceEvent::Detached));
        }
        out
    }
}
