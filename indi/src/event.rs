//! Domain events and the session event bus
//!
//! Two delivery paths share one publish call:
//!
//! - **Telemetry**: a broadcast channel for UI/API subscribers. A subscriber
//!   that falls behind by more than the buffer size loses the oldest events
//!   and gets a `Lagged` notice.
//! - **Waiters**: one unbounded channel per pending command wait, fed only
//!   with events of the awaited device. Nothing on this path is dropped.
//!
//! Events are published from the session reader task in wire order, so every
//! receiver observes a device's events in the order the server sent them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc;

use crate::camera::CameraEvent;
use crate::device::Device;
use crate::filterwheel::FilterWheelEvent;
use crate::focuser::FocuserEvent;
use crate::message::IndiPropertyState;
use crate::mount::MountEvent;

/// Default telemetry buffer size
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 1024;

/// Shared handle to a live device
pub type DeviceRef = Arc<Device>;

/// Lifecycle and raw-property events common to every device kind
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    Attached,
    Detached,
    Connected,
    Disconnected,
    /// CONNECTION went to Alert before the device came up
    ConnectionFailed(Option<String>),
    PropertyDefined(String),
    PropertyChanged {
        name: String,
        state: IndiPropertyState,
    },
    PropertyDeleted(String),
    MessageReceived(String),
}

/// An observable change on a device, or a server-wide notice
#[derive(Debug, Clone, PartialEq)]
pub enum DomainEvent {
    Device(DeviceRef, DeviceEvent),
    Mount(DeviceRef, MountEvent),
    Focuser(DeviceRef, FocuserEvent),
    FilterWheel(DeviceRef, FilterWheelEvent),
    Camera(DeviceRef, CameraEvent),
    ServerNotice(String),
}

impl DomainEvent {
    pub fn device(&self) -> Option<&DeviceRef> {
        match self {
            DomainEvent::Device(d, _)
            | DomainEvent::Mount(d, _)
            | DomainEvent::Focuser(d, _)
            | DomainEvent::FilterWheel(d, _)
            | DomainEvent::Camera(d, _) => Some(d),
            DomainEvent::ServerNotice(_) => None,
        }
    }

    pub fn device_name(&self) -> Option<&str> {
        self.device().map(|d| d.name())
    }

    /// Whether this is the detach of `device`
    pub fn is_detach_of(&self, device: &str) -> bool {
        matches!(self, DomainEvent::Device(d, DeviceEvent::Detached) if d.name() == device)
    }
}

/// Statistics about the event bus
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventBusStats {
    /// Total events published
    pub events_published: u64,
    /// Current number of telemetry subscribers
    pub subscriber_count: usize,
    /// Current number of pending waits
    pub waiter_count: usize,
}

struct WaiterSlot {
    device: String,
    tx: mpsc::UnboundedSender<DomainEvent>,
}

struct Waiters {
    slots: HashMap<u64, WaiterSlot>,
    closed: bool,
}

/// Per-session event bus
pub struct EventBus {
    sender: Mutex<Option<broadcast::Sender<DomainEvent>>>,
    waiters: Mutex<Waiters>,
    next_waiter: AtomicU64,
    events_published: AtomicU64,
    capacity: usize,
}

impl EventBus {
    /// Create a new event bus with the specified telemetry capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Mutex::new(Some(sender)),
            waiters: Mutex::new(Waiters {
                slots: HashMap::new(),
                closed: false,
            }),
            next_waiter: AtomicU64::new(1),
            events_published: AtomicU64::new(0),
            capacity: capacity.max(1),
        }
    }

    /// Publish an event to waiters of its device and to all subscribers
    pub fn publish(&self, event: DomainEvent) {
        self.events_published.fetch_add(1, Ordering::Relaxed);
        self.notify_waiters(event.clone());

        if let Some(sender) = self.sender.lock().as_ref() {
            // no subscribers is fine
            let _ = sender.send(event);
        }
    }

    /// Deliver an event to the pending waits on its device only
    pub(crate) fn notify_waiters(&self, event: DomainEvent) {
        let Some(name) = event.device_name() else {
            return;
        };
        let waiters = self.waiters.lock();
        for slot in waiters.slots.values().filter(|s| s.device == name) {
            let _ = slot.tx.send(event.clone());
        }
    }

    /// Subscribe to every event of the session
    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        match self.sender.lock().as_ref() {
            Some(sender) => sender.subscribe(),
            None => {
                let (_, rx) = broadcast::channel(1);
                rx
            }
        }
    }

    /// Subscribe to the events of one device; drop the subscription to unsubscribe
    pub fn subscribe_device(&self, device: &str) -> DeviceSubscription {
        DeviceSubscription {
            device: device.to_string(),
            rx: self.subscribe(),
        }
    }

    /// Register a lossless event feed for a pending wait on `device`
    pub(crate) fn register_waiter(self: &Arc<Self>, device: &str) -> WaiterRegistration {
        let id = self.next_waiter.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let mut waiters = self.waiters.lock();
        if !waiters.closed {
            waiters.slots.insert(
                id,
                WaiterSlot {
                    device: device.to_string(),
                    tx,
                },
            );
        }
        // on a closed bus tx is dropped here and the wait sees the session closed
        WaiterRegistration {
            id,
            bus: Arc::clone(self),
            rx,
        }
    }

    fn unregister_waiter(&self, id: u64) {
        self.waiters.lock().slots.remove(&id);
    }

    /// Stop delivery: subscribers see `Closed`, pending waits see the session closed
    pub(crate) fn close(&self) {
        self.sender.lock().take();
        let mut waiters = self.waiters.lock();
        waiters.closed = true;
        waiters.slots.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.waiters.lock().closed
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender
            .lock()
            .as_ref()
            .map(|s| s.receiver_count())
            .unwrap_or(0)
    }

    pub fn waiter_count(&self) -> usize {
        self.waiters.lock().slots.len()
    }

    /// Get statistics about the event bus
    pub fn stats(&self) -> EventBusStats {
        EventBusStats {
            events_published: self.events_published.load(Ordering::Relaxed),
            subscriber_count: self.subscriber_count(),
            waiter_count: self.waiter_count(),
        }
    }

    /// Get the configured capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER_SIZE)
    }
}

/// Telemetry feed filtered to one device
pub struct DeviceSubscription {
    device: String,
    rx: broadcast::Receiver<DomainEvent>,
}

impl DeviceSubscription {
    pub fn device(&self) -> &str {
        &self.device
    }

    /// Next event of the device, `None` once the session is closed
    pub async fn recv(&mut self) -> Option<DomainEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.device_name() == Some(self.device.as_str()) => {
                    return Some(event)
                }
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        "Event subscriber for {} lagged, {} events dropped",
                        self.device,
                        skipped
                    );
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

/// Lossless event feed of one pending wait, unregistered on drop
pub(crate) struct WaiterRegistration {
    id: u64,
    bus: Arc<EventBus>,
    rx: mpsc::UnboundedReceiver<DomainEvent>,
}

impl WaiterRegistration {
    pub async fn recv(&mut self) -> Option<DomainEvent> {
        self.rx.recv().await
    }
}

impl Drop for WaiterRegistration {
    fn drop(&mut self) {
        self.bus.unregister_waiter(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{test_device, DeviceKind};

    #[tokio::test]
    async fn test_subscribers_see_events_in_order() {
        let (device, _outbox, bus) = test_device("Focuser", DeviceKind::Focuser);
        let mut first = bus.subscribe();
        let mut second = bus.subscribe_device("Focuser");

        for position in [100.0, 200.0, 300.0] {
            bus.publish(DomainEvent::Focuser(
                device.clone(),
                FocuserEvent::PositionChanged(position),
            ));
        }

        for expected in [100.0, 200.0, 300.0] {
            let event = first.recv().await.unwrap();
            assert_eq!(
                event,
                DomainEvent::Focuser(device.clone(), FocuserEvent::PositionChanged(expected))
            );
            let event = second.recv().await.unwrap();
            assert_eq!(
                event,
                DomainEvent::Focuser(device.clone(), FocuserEvent::PositionChanged(expected))
            );
        }
        assert_eq!(bus.stats().events_published, 3);
    }

    #[tokio::test]
    async fn test_device_subscription_filters_other_devices() {
        let (focuser, _a, bus) = test_device("Focuser", DeviceKind::Focuser);
        let other = Device::new_for_test("Wheel", DeviceKind::FilterWheel, &bus);
        let mut sub = bus.subscribe_device("Focuser");

        bus.publish(DomainEvent::Device(other, DeviceEvent::Attached));
        bus.publish(DomainEvent::ServerNotice("hello".to_string()));
        bus.publish(DomainEvent::Device(focuser.clone(), DeviceEvent::Connected));

        assert_eq!(
            sub.recv().await,
            Some(DomainEvent::Device(focuser, DeviceEvent::Connected))
        );
    }

    #[tokio::test]
    async fn test_waiters_are_never_lagged() {
        let (device, _outbox, _) = test_device("Focuser", DeviceKind::Focuser);
        let bus = Arc::new(EventBus::new(2));
        let mut telemetry = bus.subscribe();
        let mut waiter = bus.register_waiter("Focuser");

        for i in 0..10 {
            bus.publish(DomainEvent::Focuser(
                device.clone(),
                FocuserEvent::PositionChanged(i as f64),
            ));
        }

        for i in 0..10 {
            assert_eq!(
                waiter.recv().await,
                Some(DomainEvent::Focuser(
                    device.clone(),
                    FocuserEvent::PositionChanged(i as f64)
                ))
            );
        }
        assert!(matches!(telemetry.recv().await, Err(RecvError::Lagged(_))));
    }

    #[tokio::test]
    async fn test_close_releases_waiters_and_subscribers() {
        let bus = Arc::new(EventBus::default());
        let mut waiter = bus.register_waiter("Mount");
        let mut sub = bus.subscribe_device("Mount");
        assert_eq!(bus.waiter_count(), 1);

        bus.close();
        assert!(bus.is_closed());
        assert_eq!(waiter.recv().await, None);
        assert_eq!(sub.recv().await, None);

        let mut late = bus.register_waiter("Mount");
        assert_eq!(late.recv().await, None);
    }

    #[test]
    fn test_dropped_waiter_unregisters() {
        let bus = Arc::new(EventBus::default());
        let waiter = bus.register_waiter("Mount");
        assert_eq!(bus.waiter_count(), 1);
        drop(waiter);
        assert_eq!(bus.waiter_count(), 0);
    }
}
