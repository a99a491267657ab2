//! INDI Filter Wheel
//!
//! Slots are 1-based, matching FILTER_SLOT on the wire.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::device::{alert_reported, update_flag, update_locked, KindState};
use crate::error::{IndiError, IndiResult};
use crate::event::{DeviceEvent, DeviceRef, DomainEvent};
use crate::message::{IndiPropertyState, NewVector, OneElements, OneText};
use crate::property::PropertyVector;
use crate::protocol::standard_properties::*;
use crate::sync::{CancellationToken, FailureReason, Verdict, WaitOutcome};

/// Filter wheel telemetry
#[derive(Debug, Clone, PartialEq)]
pub enum FilterWheelEvent {
    MovingChanged(bool),
    SlotChanged(usize),
    CountChanged(usize),
    NamesChanged(Vec<String>),
    /// A slot change ended in Alert
    MoveFailed(Option<String>),
}

#[derive(Debug, Default)]
pub(crate) struct FilterWheelState {
    slot: AtomicUsize,
    count: AtomicUsize,
    moving: AtomicBool,
    names: RwLock<Vec<String>>,
}

fn update_count(state: &FilterWheelState, count: usize) -> bool {
    state.count.swap(count, Ordering::AcqRel) != count
}

pub(crate) fn interpret(
    device: &DeviceRef,
    state: &FilterWheelState,
    vector: &PropertyVector,
    previous: Option<&PropertyVector>,
    events: &mut Vec<DomainEvent>,
) {
    let mut emit = |event| events.push(DomainEvent::FilterWheel(device.clone(), event));

    match vector.name.as_str() {
        FILTER_SLOT => {
            if let Some(number) = vector.number_value(FILTER_SLOT_VALUE) {
                let count = if number.max >= 1.0 { number.max as usize } else { 0 };
                if count > 0 && update_count(state, count) {
                    emit(FilterWheelEvent::CountChanged(count));
                }
                let slot = number.value.max(0.0).round() as usize;
                if state.slot.swap(slot, Ordering::AcqRel) != slot {
                    emit(FilterWheelEvent::SlotChanged(slot));
                }
            }
            if update_flag(&state.moving, vector.is_busy()) {
                emit(FilterWheelEvent::MovingChanged(vector.is_busy()));
            }
            if alert_reported(vector, previous) {
                tracing::warn!("Filter wheel {} failed to change slot", device.name());
                emit(FilterWheelEvent::MoveFailed(vector.message.clone()));
            }
        }
        FILTER_NAME => {
            let names: Vec<String> = vector
                .elements()
                .iter()
                .filter_map(|e| vector.text(&e.name).map(str::to_string))
                .collect();
            // wheels without slot limits are sized by their name list
            if state.count.load(Ordering::Acquire) == 0 && update_count(state, names.len()) {
                emit(FilterWheelEvent::CountChanged(names.len()));
            }
            if update_locked(&state.names, names.clone()) {
                emit(FilterWheelEvent::NamesChanged(names));
            }
        }
        _ => {}
    }
}

pub(crate) fn forget(state: &FilterWheelState, property: &str) {
    match property {
        FILTER_SLOT => state.moving.store(false, Ordering::Release),
        FILTER_NAME => state.names.write().clear(),
        _ => {}
    }
}

/// Filter wheel operations and their wire form
#[derive(Debug, Clone, PartialEq)]
pub enum FilterWheelCommand {
    /// Select a 1-based slot
    MoveTo(usize),
    /// Rename slots: element names paired with new labels
    SetNames(Vec<(String, String)>),
}

impl FilterWheelCommand {
    pub fn encode(&self, device: &str) -> Vec<NewVector> {
        match self {
            FilterWheelCommand::MoveTo(slot) => vec![NewVector::number(
                device,
                FILTER_SLOT,
                FILTER_SLOT_VALUE,
                *slot as f64,
            )],
            FilterWheelCommand::SetNames(names) => vec![NewVector::new(
                device,
                FILTER_NAME,
                OneElements::Text(
                    names
                        .iter()
                        .map(|(element, value)| OneText {
                            name: element.clone(),
                            value: value.clone(),
                        })
                        .collect(),
                ),
            )],
        }
    }
}

/// INDI Filter Wheel device wrapper
#[derive(Debug, Clone)]
pub struct IndiFilterWheel {
    device: DeviceRef,
    state: Arc<FilterWheelState>,
}

impl IndiFilterWheel {
    /// `None` unless the device was classified as a filter wheel
    pub fn from_device(device: &DeviceRef) -> Option<Self> {
        match device.kind_state() {
            KindState::FilterWheel(state) => Some(Self {
                device: device.clone(),
                state: state.clone(),
            }),
            _ => None,
        }
    }

    pub fn device(&self) -> &DeviceRef {
        &self.device
    }

    pub fn name(&self) -> &str {
        self.device.name()
    }

    /// Current slot (1-based), 0 before the wheel reported one
    pub fn slot(&self) -> usize {
        self.state.slot.load(Ordering::Acquire)
    }

    pub fn slot_count(&self) -> usize {
        self.state.count.load(Ordering::Acquire)
    }

    pub fn is_moving(&self) -> bool {
        self.state.moving.load(Ordering::Acquire)
    }

    pub fn filter_names(&self) -> Vec<String> {
        self.state.names.read().clone()
    }

    /// Name of the filter in the current slot
    pub fn current_filter(&self) -> Option<String> {
        let slot = self.slot();
        slot.checked_sub(1)
            .and_then(|i| self.state.names.read().get(i).cloned())
    }

    fn check_slot(&self, slot: usize) -> IndiResult<()> {
        let count = self.slot_count();
        if slot == 0 || (count > 0 && slot > count) {
            return Err(IndiError::ValueOutOfRange {
                device: self.name().to_string(),
                property: FILTER_SLOT.to_string(),
                element: FILTER_SLOT_VALUE.to_string(),
                value: slot as f64,
                min: 1.0,
                max: count as f64,
            });
        }
        Ok(())
    }

    /// Set filter slot (1-based)
    pub async fn set_slot(&self, slot: usize) -> IndiResult<()> {
        self.check_slot(slot)?;
        self.device
            .send_all(FilterWheelCommand::MoveTo(slot).encode(self.name()))
            .await
    }

    /// Set filter slot and wait for the wheel to settle there
    pub async fn set_slot_and_wait(
        &self,
        slot: usize,
        cancel: &CancellationToken,
    ) -> IndiResult<WaitOutcome> {
        self.check_slot(slot)?;
        let state = self.state.clone();
        let settled = move || {
            !state.moving.load(Ordering::Acquire) && state.slot.load(Ordering::Acquire) == slot
        };
        self.device
            .execute_and_wait(
                FilterWheelCommand::MoveTo(slot).encode(self.name()),
                move |event| match event {
                    DomainEvent::FilterWheel(_, FilterWheelEvent::MoveFailed(reason)) => {
                        Verdict::Failure(FailureReason::Alert(reason.clone()))
                    }
                    DomainEvent::FilterWheel(
                        _,
                        FilterWheelEvent::SlotChanged(_) | FilterWheelEvent::MovingChanged(_),
                    ) if settled() => Verdict::Success,
                    // the slot was already selected
                    DomainEvent::Device(
                        _,
                        DeviceEvent::PropertyChanged {
                            name,
                            state: IndiPropertyState::Ok,
                        },
                    ) if name.as_str() == FILTER_SLOT && settled() => Verdict::Success,
                    _ => Verdict::Pending,
                },
                Some(self.device.config().filter_change_timeout()),
                cancel,
            )
            .await
    }

    /// Rename filters in slot order; extra names beyond the slot count are an error
    pub async fn set_filter_names(&self, names: &[&str]) -> IndiResult<()> {
        let vector = self
            .device
            .property(FILTER_NAME)
            .ok_or_else(|| IndiError::PropertyNotFound {
                device: self.name().to_string(),
                property: FILTER_NAME.to_string(),
            })?;
        let elements: Vec<&str> = vector.elements().iter().map(|e| e.name.as_str()).collect();
        if names.len() > elements.len() {
            return Err(IndiError::ElementNotFound {
                device: self.name().to_string(),
                property: FILTER_NAME.to_string(),
                element: format!("{}{}", FILTER_SLOT_NAME_PREFIX, elements.len() + 1),
            });
        }
        let pairs = elements
            .iter()
            .zip(names)
            .map(|(element, name)| (element.to_string(), name.to_string()))
            .collect();
        self.device
            .send_all(FilterWheelCommand::SetNames(pairs).encode(self.name()))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{feed, feed_and_publish, test_device, DeviceKind};
    use crate::message::Message;

    const SLOT_DEF: &str = r#"<defNumberVector device="Filter Simulator" name="FILTER_SLOT" state="Idle" perm="rw">
        <defNumber name="FILTER_SLOT_VALUE" format="%3.0f" min="1" max="5" step="1">1</defNumber>
    </defNumberVector>"#;

    const NAME_DEF: &str = r#"<defTextVector device="Filter Simulator" name="FILTER_NAME" state="Idle" perm="rw">
        <defText name="FILTER_SLOT_NAME_1">Red</defText>
        <defText name="FILTER_SLOT_NAME_2">Green</defText>
        <defText name="FILTER_SLOT_NAME_3">Blue</defText>
        <defText name="FILTER_SLOT_NAME_4">Luminance</defText>
        <defText name="FILTER_SLOT_NAME_5">H-Alpha</defText>
    </defTextVector>"#;

    fn wheel() -> (IndiFilterWheel, tokio::sync::mpsc::Receiver<Message>) {
        let (device, outbox, _bus) = test_device("Filter Simulator", DeviceKind::FilterWheel);
        feed(&device, SLOT_DEF);
        feed(&device, NAME_DEF);
        (IndiFilterWheel::from_device(&device).unwrap(), outbox)
    }

    #[test]
    fn test_slots_and_names() {
        let (wheel, _outbox) = wheel();
        assert_eq!(wheel.slot(), 1);
        assert_eq!(wheel.slot_count(), 5);
        assert_eq!(wheel.filter_names().len(), 5);
        assert_eq!(wheel.current_filter(), Some("Red".to_string()));
    }

    #[tokio::test]
    async fn test_slot_out_of_range() {
        let (wheel, mut outbox) = wheel();
        assert!(matches!(
            wheel.set_slot(6).await,
            Err(IndiError::ValueOutOfRange { .. })
        ));
        assert!(matches!(
            wheel.set_slot(0).await,
            Err(IndiError::ValueOutOfRange { .. })
        ));
        assert!(outbox.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_set_slot_and_wait() {
        let (wheel, mut outbox) = wheel();
        let device = wheel.device().clone();
        let task = {
            let wheel = wheel.clone();
            tokio::spawn(async move { wheel.set_slot_and_wait(3, &CancellationToken::new()).await })
        };
        assert_eq!(
            outbox.recv().await,
            Some(Message::NewVector(NewVector::number(
                "Filter Simulator",
                FILTER_SLOT,
                FILTER_SLOT_VALUE,
                3.0
            )))
        );
        feed_and_publish(
            &device,
            r#"<setNumberVector device="Filter Simulator" name="FILTER_SLOT" state="Busy"/>"#,
        );
        feed_and_publish(
            &device,
            r#"<setNumberVector device="Filter Simulator" name="FILTER_SLOT" state="Ok">
                <oneNumber name="FILTER_SLOT_VALUE">3</oneNumber></setNumberVector>"#,
        );
        assert_eq!(task.await.unwrap().unwrap(), WaitOutcome::Success);
        assert_eq!(wheel.current_filter(), Some("Blue".to_string()));
    }

    #[tokio::test]
    async fn test_select_current_slot_completes() {
        let (wheel, mut outbox) = wheel();
        let device = wheel.device().clone();
        let settled = r#"<setNumberVector device="Filter Simulator" name="FILTER_SLOT" state="Ok">
            <oneNumber name="FILTER_SLOT_VALUE">1</oneNumber></setNumberVector>"#;
        feed(&device, settled);

        let task = {
            let wheel = wheel.clone();
            tokio::spawn(async move { wheel.set_slot_and_wait(1, &CancellationToken::new()).await })
        };
        outbox.recv().await.unwrap();
        let out = feed_and_publish(&device, settled);
        assert!(out.events.is_empty());
        assert_eq!(task.await.unwrap().unwrap(), WaitOutcome::Success);
        assert_eq!(wheel.current_filter(), Some("Red".to_string()));
    }

    #[tokio::test]
    async fn test_set_filter_names_uses_defined_elements() {
        let (wheel, mut outbox) = wheel();
        wheel.set_filter_names(&["L", "R"]).await.unwrap();
        let Some(Message::NewVector(sent)) = outbox.recv().await else {
            panic!("expected newTextVector");
        };
        assert_eq!(
            sent.elements,
            OneElements::Text(vec![
                OneText {
                    name: "FILTER_SLOT_NAME_1".to_string(),
                    value: "L".to_string()
                },
                OneText {
                    name: "FILTER_SLOT_NAME_2".to_string(),
                    value: "R".to_string()
                },
            ])
        );
        assert!(wheel
            .set_filter_names(&["1", "2", "3", "4", "5", "6"])
            .await
            .is_err());
    }
}
