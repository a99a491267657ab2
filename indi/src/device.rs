//! INDI device object
//!
//! A [`Device`] owns the property vectors the server defined for it, the
//! typed state of its kind handler and a handle to the session's outgoing
//! queue. Typed state is atomics so callers can read it from any thread
//! while the reader task updates it.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;

use crate::camera::{self, CameraState};
use crate::config::IndiConfig;
use crate::error::{IndiError, IndiResult};
use crate::event::{DeviceEvent, DeviceSubscription, DomainEvent, EventBus};
use crate::filterwheel::{self, FilterWheelState};
use crate::focuser::{self, FocuserState};
use crate::message::{BlobMode, EnableBlob, GetProperties, IndiPropertyState, Message, NewVector};
use crate::mount::{self, MountState};
use crate::property::{PropertyTable, PropertyVector, Update};
use crate::protocol::standard_properties::{CONNECT, CONNECTION, DISCONNECT};
use crate::registry::DispatchOutput;
use crate::sync::{CancellationToken, FailureReason, Verdict, WaitOutcome, Waiter};

/// Entries kept in a device's message log
pub const MESSAGE_LOG_CAPACITY: usize = 100;

/// Device category, decides which handler interprets its properties
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    /// Property model only
    Generic,
    Mount,
    Focuser,
    FilterWheel,
    Camera,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceKind::Generic => "generic",
            DeviceKind::Mount => "mount",
            DeviceKind::Focuser => "focuser",
            DeviceKind::FilterWheel => "filter wheel",
            DeviceKind::Camera => "camera",
        };
        f.write_str(s)
    }
}

/// Typed state of the kind handler
#[derive(Debug)]
pub(crate) enum KindState {
    Generic,
    Mount(Arc<MountState>),
    Focuser(Arc<FocuserState>),
    FilterWheel(Arc<FilterWheelState>),
    Camera(Arc<CameraState>),
}

impl KindState {
    fn new(kind: DeviceKind) -> Self {
        match kind {
            DeviceKind::Generic => KindState::Generic,
            DeviceKind::Mount => KindState::Mount(Arc::default()),
            DeviceKind::Focuser => KindState::Focuser(Arc::default()),
            DeviceKind::FilterWheel => KindState::FilterWheel(Arc::default()),
            DeviceKind::Camera => KindState::Camera(Arc::default()),
        }
    }
}

/// `f64` stored in an `AtomicU64`
#[derive(Debug, Default)]
pub(crate) struct AtomicF64(AtomicU64);

impl AtomicF64 {
    pub fn load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Acquire))
    }

    /// Store `value`, returning whether it differs from the old value
    pub fn update(&self, value: f64) -> bool {
        self.0.swap(value.to_bits(), Ordering::AcqRel) != value.to_bits()
    }
}

/// Store `value`, returning whether it differs from the old value
pub(crate) fn update_flag(flag: &AtomicBool, value: bool) -> bool {
    flag.swap(value, Ordering::AcqRel) != value
}

/// Store `value` behind a lock, returning whether it changed
pub(crate) fn update_locked<T: PartialEq>(cell: &RwLock<T>, value: T) -> bool {
    let mut guard = cell.write();
    if *guard == value {
        false
    } else {
        *guard = value;
        true
    }
}

/// Whether this update reports Alert on an already known vector. Every such
/// report counts, so a command rejected twice fails twice.
pub(crate) fn alert_reported(vector: &PropertyVector, previous: Option<&PropertyVector>) -> bool {
    vector.state == IndiPropertyState::Alert && previous.is_some()
}

/// One entry of the device message log
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceMessage {
    pub timestamp: Option<String>,
    pub text: String,
}

/// A device announced by the server
pub struct Device {
    name: String,
    kind: DeviceKind,
    properties: RwLock<PropertyTable>,
    connected: AtomicBool,
    attached: AtomicBool,
    messages: Mutex<VecDeque<DeviceMessage>>,
    outbox: mpsc::Sender<Message>,
    bus: Arc<EventBus>,
    config: Arc<IndiConfig>,
    state: KindState,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Devices are identified by name within a session
impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Device {
    pub(crate) fn new(
        name: String,
        kind: DeviceKind,
        outbox: mpsc::Sender<Message>,
        bus: Arc<EventBus>,
        config: Arc<IndiConfig>,
    ) -> Self {
        Self {
            name,
            kind,
            properties: RwLock::new(PropertyTable::new()),
            connected: AtomicBool::new(false),
            attached: AtomicBool::new(true),
            messages: Mutex::new(VecDeque::new()),
            outbox,
            bus,
            config,
            state: KindState::new(kind),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    /// CONNECTION reports the device as connected
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Still known to the server; false after detach or session close
    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }

    pub(crate) fn kind_state(&self) -> &KindState {
        &self.state
    }

    pub fn config(&self) -> &IndiConfig {
        &self.config
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Telemetry for this device only
    pub fn subscribe(&self) -> DeviceSubscription {
        self.bus.subscribe_device(&self.name)
    }

    /// Snapshot of one property vector
    pub fn property(&self, name: &str) -> Option<PropertyVector> {
        self.properties.read().get(name).cloned()
    }

    pub fn has_property(&self, name: &str) -> bool {
        self.properties.read().contains(name)
    }

    pub fn property_names(&self) -> Vec<String> {
        self.properties.read().names()
    }

    pub fn property_state(&self, property: &str) -> Option<IndiPropertyState> {
        self.properties.read().get(property).map(|v| v.state)
    }

    pub fn number(&self, property: &str, element: &str) -> Option<f64> {
        self.properties.read().get(property)?.number(element)
    }

    pub fn switch(&self, property: &str, element: &str) -> Option<bool> {
        self.properties.read().get(property)?.switch(element)
    }

    pub fn text(&self, property: &str, element: &str) -> Option<String> {
        self.properties
            .read()
            .get(property)?
            .text(element)
            .map(str::to_string)
    }

    /// Recent messages from the driver, oldest first
    pub fn messages(&self) -> Vec<DeviceMessage> {
        self.messages.lock().iter().cloned().collect()
    }

    /// `Unsupported` unless the device advertised the capability
    pub(crate) fn require(&self, supported: bool, operation: &str) -> IndiResult<()> {
        if supported {
            Ok(())
        } else {
            Err(IndiError::Unsupported {
                device: self.name.clone(),
                operation: operation.to_string(),
            })
        }
    }

    fn ensure_attached(&self) -> IndiResult<()> {
        if self.is_attached() {
            Ok(())
        } else {
            Err(IndiError::Detached(self.name.clone()))
        }
    }

    /// Send one property update after checking it against the definition
    pub async fn send(&self, command: NewVector) -> IndiResult<()> {
        self.send_all(vec![command]).await
    }

    /// Send updates in order. All are checked before the first is written,
    /// so a rejected command writes nothing.
    pub async fn send_all(&self, commands: Vec<NewVector>) -> IndiResult<()> {
        self.ensure_attached()?;
        {
            let table = self.properties.read();
            for command in &commands {
                let vector = table
                    .get(&command.name)
                    .ok_or_else(|| IndiError::PropertyNotFound {
                        device: self.name.clone(),
                        property: command.name.clone(),
                    })?;
                vector.check_command(&command.elements)?;
            }
        }
        for command in commands {
            tracing::debug!("Sending new{}Vector {}.{}", command.elements.kind().tag(), self.name, command.name);
            self.outbox
                .send(Message::NewVector(command))
                .await
                .map_err(|_| IndiError::NotConnected)?;
        }
        Ok(())
    }

    /// Set a switch property with permission check
    pub async fn set_switch(&self, property: &str, element: &str, on: bool) -> IndiResult<()> {
        self.send(NewVector::switch(&self.name, property, element, on))
            .await
    }

    /// Set a number property with permission and limits check
    pub async fn set_number(&self, property: &str, element: &str, value: f64) -> IndiResult<()> {
        self.send(NewVector::number(&self.name, property, element, value))
            .await
    }

    /// Set multiple number elements at once with validation
    pub async fn set_numbers(&self, property: &str, values: &[(&str, f64)]) -> IndiResult<()> {
        self.send(NewVector::numbers(&self.name, property, values))
            .await
    }

    /// Set a text property with permission check
    pub async fn set_text(&self, property: &str, element: &str, value: &str) -> IndiResult<()> {
        self.send(NewVector::texts(&self.name, property, &[(element, value)]))
            .await
    }

    /// Connect the driver to its hardware (turn on CONNECTION switch)
    pub async fn connect(&self) -> IndiResult<()> {
        self.set_switch(CONNECTION, CONNECT, true).await
    }

    pub async fn disconnect(&self) -> IndiResult<()> {
        self.set_switch(CONNECTION, DISCONNECT, true).await
    }

    /// Connect and wait for CONNECTION to confirm
    pub async fn connect_and_wait(
        &self,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> IndiResult<WaitOutcome> {
        if self.is_connected() {
            return Ok(WaitOutcome::Success);
        }
        self.execute_and_wait(
            vec![NewVector::switch(&self.name, CONNECTION, CONNECT, true)],
            |event| match event {
                DomainEvent::Device(_, DeviceEvent::Connected) => Verdict::Success,
                DomainEvent::Device(_, DeviceEvent::ConnectionFailed(reason)) => {
                    Verdict::Failure(FailureReason::Alert(reason.clone()))
                }
                _ => Verdict::Pending,
            },
            timeout,
            cancel,
        )
        .await
    }

    /// Ask the server to send (or stop sending) BLOBs of this device
    pub async fn enable_blob(&self, mode: BlobMode) -> IndiResult<()> {
        self.ensure_attached()?;
        self.outbox
            .send(Message::EnableBlob(EnableBlob {
                device: self.name.clone(),
                name: None,
                mode,
            }))
            .await
            .map_err(|_| IndiError::NotConnected)
    }

    /// Ask the server to re-send all definitions of this device
    pub async fn request_properties(&self) -> IndiResult<()> {
        self.outbox
            .send(Message::GetProperties(GetProperties {
                version: Some(self.config.protocol_version.clone()),
                device: Some(self.name.clone()),
                name: None,
            }))
            .await
            .map_err(|_| IndiError::NotConnected)
    }

    /// Register a waiter, send `commands`, then wait for `matcher` to decide.
    /// Errors are command errors; everything after the write is a `WaitOutcome`.
    pub async fn execute_and_wait<F>(
        &self,
        commands: Vec<NewVector>,
        matcher: F,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> IndiResult<WaitOutcome>
    where
        F: FnMut(&DomainEvent) -> Verdict,
    {
        let waiter = Waiter::register(&self.bus, &self.name);
        self.send_all(commands).await?;
        Ok(waiter.wait(matcher, timeout, cancel).await)
    }

    /// Apply a definition or update, then interpret it. Runs on the reader task.
    pub(crate) fn apply(self: &Arc<Self>, update: Update<'_>, out: &mut DispatchOutput) {
        let (timestamp, text) = match update {
            Update::Define(def) => (def.timestamp.clone(), def.message.clone()),
            Update::Set(set) => (set.timestamp.clone(), set.message.clone()),
        };
        if let Some(text) = text {
            self.log_message(timestamp, text, out);
        }

        let (vector, previous, changed) = {
            let mut table = self.properties.write();
            let Some(applied) = table.apply(update) else {
                return;
            };
            if !applied.changed && matches!(update, Update::Define(_)) {
                return;
            }
            match table.get(update.name()) {
                Some(vector) => (vector.clone(), applied.previous, applied.changed),
                None => return,
            }
        };

        let event = match update {
            Update::Define(_) => DeviceEvent::PropertyDefined(vector.name.clone()),
            Update::Set(_) => DeviceEvent::PropertyChanged {
                name: vector.name.clone(),
                state: vector.state,
            },
        };

        if changed {
            out.events.push(DomainEvent::Device(self.clone(), event));
            self.interpret(&vector, previous.as_ref(), out);
        } else {
            // The server repeated what we hold. Telemetry has seen it already,
            // but a pending wait may be for exactly this reply.
            let mut reply = DispatchOutput::default();
            reply.events.push(DomainEvent::Device(self.clone(), event));
            self.interpret(&vector, previous.as_ref(), &mut reply);
            out.replies.extend(reply.events);
            out.follow_ups.extend(reply.follow_ups);
        }
    }

    fn interpret(
        self: &Arc<Self>,
        vector: &PropertyVector,
        previous: Option<&PropertyVector>,
        out: &mut DispatchOutput,
    ) {
        if vector.name == CONNECTION {
            self.interpret_connection(vector, previous, out);
        }

        match &self.state {
            KindState::Generic => {}
            KindState::Mount(state) => mount::interpret(self, state, vector, previous, &mut out.events),
            KindState::Focuser(state) => {
                focuser::interpret(self, state, vector, previous, &mut out.events)
            }
            KindState::FilterWheel(state) => {
                filterwheel::interpret(self, state, vector, previous, &mut out.events)
            }
            KindState::Camera(state) => camera::interpret(self, state, vector, previous, &mut out.events),
        }
    }

    fn interpret_connection(
        self: &Arc<Self>,
        vector: &PropertyVector,
        previous: Option<&PropertyVector>,
        out: &mut DispatchOutput,
    ) {
        let connected = vector.switch(CONNECT).unwrap_or(false)
            && matches!(vector.state, IndiPropertyState::Ok | IndiPropertyState::Idle);

        if update_flag(&self.connected, connected) {
            if connected {
                tracing::info!("Device {} connected", self.name);
                out.events
                    .push(DomainEvent::Device(self.clone(), DeviceEvent::Connected));
                out.follow_ups.push(Message::GetProperties(GetProperties {
                    version: Some(self.config.protocol_version.clone()),
                    device: Some(self.name.clone()),
                    name: None,
                }));
            } else {
                tracing::info!("Device {} disconnected", self.name);
                out.events
                    .push(DomainEvent::Device(self.clone(), DeviceEvent::Disconnected));
            }
        }

        if !connected && alert_reported(vector, previous) {
            tracing::warn!(
                "Device {} failed to connect: {}",
                self.name,
                vector.message.as_deref().unwrap_or("no reason given")
            );
            out.events.push(DomainEvent::Device(
                self.clone(),
                DeviceEvent::ConnectionFailed(vector.message.clone()),
            ));
        }
    }

    /// Remove one property vector
    pub(crate) fn delete_property(self: &Arc<Self>, name: &str, out: &mut DispatchOutput) {
        let removed = self.properties.write().remove(name);
        if removed.is_none() {
            tracing::debug!("delProperty for unknown {}.{}", self.name, name);
            return;
        }

        if name == CONNECTION && update_flag(&self.connected, false) {
            out.events
                .push(DomainEvent::Device(self.clone(), DeviceEvent::Disconnected));
        }
        match &self.state {
            KindState::Generic => {}
            KindState::Mount(state) => mount::forget(state, name),
            KindState::Focuser(state) => focuser::forget(state, name),
            KindState::FilterWheel(state) => filterwheel::forget(state, name),
            KindState::Camera(state) => camera::forget(state, name),
        }
        out.events.push(DomainEvent::Device(
            self.clone(),
            DeviceEvent::PropertyDeleted(name.to_string()),
        ));
    }

    /// Append to the message log and announce the message
    pub(crate) fn log_message(
        self: &Arc<Self>,
        timestamp: Option<String>,
        text: String,
        out: &mut DispatchOutput,
    ) {
        tracing::debug!("[{}] {}", self.name, text);
        {
            let mut log = self.messages.lock();
            if log.len() == MESSAGE_LOG_CAPACITY {
                log.pop_front();
            }
            log.push_back(DeviceMessage {
                timestamp,
                text: text.clone(),
            });
        }
        out.events.push(DomainEvent::Device(
            self.clone(),
            DeviceEvent::MessageReceived(text),
        ));
    }

    /// The device is gone: commands are refused from now on
    pub(crate) fn mark_detached(&self) {
        self.attached.store(false, Ordering::Release);
        self.connected.store(false, Ordering::Release);
    }

    #[cfg(test)]
    pub(crate) fn new_for_test(name: &str, kind: DeviceKind, bus: &Arc<EventBus>) -> Arc<Self> {
        let (tx, _rx) = mpsc::channel(1);
        Arc::new(Self::new(
            name.to_string(),
            kind,
            tx,
            Arc::clone(bus),
            Arc::new(IndiConfig::default()),
        ))
    }
}

/// A device wired to a fresh bus, with the receiving end of its outbox
#[cfg(test)]
pub(crate) fn test_device(
    name: &str,
    kind: DeviceKind,
) -> (Arc<Device>, mpsc::Receiver<Message>, Arc<EventBus>) {
    let bus = Arc::new(EventBus::default());
    let (tx, rx) = mpsc::channel(64);
    let device = Arc::new(Device::new(
        name.to_string(),
        kind,
        tx,
        Arc::clone(&bus),
        Arc::new(IndiConfig::default()),
    ));
    (device, rx, bus)
}

/// Feed wire XML to a device as the dispatcher would, returning its output
#[cfg(test)]
pub(crate) fn feed(device: &Arc<Device>, xml: &str) -> DispatchOutput {
    let mut out = DispatchOutput::default();
    match crate::codec::decode_message(xml).unwrap() {
        Message::DefVector(def) => device.apply(Update::Define(&def), &mut out),
        Message::SetVector(set) => device.apply(Update::Set(&set), &mut out),
        Message::DelProperty(del) => match del.name {
            Some(name) => device.delete_property(&name, &mut out),
            None => device.mark_detached(),
        },
        Message::Notice(notice) => device.log_message(notice.timestamp, notice.message, &mut out),
        other => panic!("not a device message: {:?}", other),
    }
    out
}

/// Feed XML and publish the resulting events on the device's bus
#[cfg(test)]
pub(crate) fn feed_and_publish(device: &Arc<Device>, xml: &str) -> DispatchOutput {
    let out = feed(device, xml);
    for event in &out.events {
        device.bus().publish(event.clone());
    }
    for event in &out.replies {
        device.bus().notify_waiters(event.clone());
    }
    out
}
