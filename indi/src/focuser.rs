//! INDI Focuser
//!
//! Derives position, motion and capabilities from the standard focuser
//! properties and provides high-level focuser control.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::device::{alert_reported, update_flag, update_locked, AtomicF64, KindState};
use crate::error::IndiResult;
use crate::event::{DeviceEvent, DeviceRef, DomainEvent};
use crate::message::{IndiPropertyState, NewVector};
use crate::property::PropertyVector;
use crate::protocol::standard_properties::*;
use crate::sync::{CancellationToken, FailureReason, Verdict, WaitOutcome};

/// Focuser telemetry
#[derive(Debug, Clone, PartialEq)]
pub enum FocuserEvent {
    MovingChanged(bool),
    PositionChanged(f64),
    MaxPositionChanged(f64),
    ReversedChanged(bool),
    TemperatureChanged(f64),
    /// A move ended in Alert
    MoveFailed(Option<String>),
}

#[derive(Debug, Default)]
pub(crate) struct FocuserState {
    position: AtomicF64,
    max_position: AtomicF64,
    absolute_busy: AtomicBool,
    relative_busy: AtomicBool,
    moving: AtomicBool,
    reversed: AtomicBool,
    temperature: RwLock<Option<f64>>,
    can_absolute_move: AtomicBool,
    can_relative_move: AtomicBool,
    can_abort: AtomicBool,
    can_reverse: AtomicBool,
    can_sync: AtomicBool,
}

impl FocuserState {
    fn refresh_moving(&self) -> bool {
        let moving = self.absolute_busy.load(Ordering::Acquire)
            || self.relative_busy.load(Ordering::Acquire);
        update_flag(&self.moving, moving)
    }
}

pub(crate) fn interpret(
    device: &DeviceRef,
    state: &FocuserState,
    vector: &PropertyVector,
    previous: Option<&PropertyVector>,
    events: &mut Vec<DomainEvent>,
) {
    let mut emit = |event| events.push(DomainEvent::Focuser(device.clone(), event));

    match vector.name.as_str() {
        ABS_FOCUS_POSITION => {
            state
                .can_absolute_move
                .store(vector.perm.is_writable(), Ordering::Release);
            if let Some(number) = vector.number_value(FOCUS_ABSOLUTE_POSITION) {
                if state.max_position.update(number.max) {
                    emit(FocuserEvent::MaxPositionChanged(number.max));
                }
                if state.position.update(number.value) {
                    emit(FocuserEvent::PositionChanged(number.value));
                }
            }
            state.absolute_busy.store(vector.is_busy(), Ordering::Release);
            if state.refresh_moving() {
                emit(FocuserEvent::MovingChanged(state.moving.load(Ordering::Acquire)));
            }
            if alert_reported(vector, previous) {
                tracing::warn!("Focuser {} move failed", device.name());
                emit(FocuserEvent::MoveFailed(vector.message.clone()));
            }
        }
        REL_FOCUS_POSITION => {
            state
                .can_relative_move
                .store(vector.perm.is_writable(), Ordering::Release);
            state.relative_busy.store(vector.is_busy(), Ordering::Release);
            if state.refresh_moving() {
                emit(FocuserEvent::MovingChanged(state.moving.load(Ordering::Acquire)));
            }
            if alert_reported(vector, previous) {
                tracing::warn!("Focuser {} relative move failed", device.name());
                emit(FocuserEvent::MoveFailed(vector.message.clone()));
            }
        }
        FOCUS_ABORT_MOTION => {
            state.can_abort.store(vector.perm.is_writable(), Ordering::Release);
        }
        FOCUS_REVERSE_MOTION => {
            state.can_reverse.store(vector.perm.is_writable(), Ordering::Release);
            let reversed = vector.switch(INDI_ENABLED).unwrap_or(false);
            if update_flag(&state.reversed, reversed) {
                emit(FocuserEvent::ReversedChanged(reversed));
            }
        }
        FOCUS_SYNC => {
            state.can_sync.store(vector.perm.is_writable(), Ordering::Release);
        }
        FOCUS_TEMPERATURE => {
            if let Some(t) = vector.number(TEMPERATURE) {
                if update_locked(&state.temperature, Some(t)) {
                    emit(FocuserEvent::TemperatureChanged(t));
                }
            }
        }
        _ => {}
    }
}

/// Drop capabilities backed by a deleted property
pub(crate) fn forget(state: &FocuserState, property: &str) {
    match property {
        ABS_FOCUS_POSITION => {
            state.can_absolute_move.store(false, Ordering::Release);
            state.absolute_busy.store(false, Ordering::Release);
            state.refresh_moving();
        }
        REL_FOCUS_POSITION => {
            state.can_relative_move.store(false, Ordering::Release);
            state.relative_busy.store(false, Ordering::Release);
            state.refresh_moving();
        }
        FOCUS_ABORT_MOTION => state.can_abort.store(false, Ordering::Release),
        FOCUS_REVERSE_MOTION => state.can_reverse.store(false, Ordering::Release),
        FOCUS_SYNC => state.can_sync.store(false, Ordering::Release),
        FOCUS_TEMPERATURE => *state.temperature.write() = None,
        _ => {}
    }
}

/// Focuser operations and their wire form
#[derive(Debug, Clone, PartialEq)]
pub enum FocuserCommand {
    MoveTo(f64),
    MoveIn(f64),
    MoveOut(f64),
    Abort,
    SetReversed(bool),
    SyncTo(f64),
}

impl FocuserCommand {
    pub fn encode(&self, device: &str) -> Vec<NewVector> {
        match self {
            FocuserCommand::MoveTo(position) => vec![NewVector::number(
                device,
                ABS_FOCUS_POSITION,
                FOCUS_ABSOLUTE_POSITION,
                *position,
            )],
            FocuserCommand::MoveIn(steps) => vec![
                NewVector::switch(device, FOCUS_MOTION, FOCUS_INWARD, true),
                NewVector::number(device, REL_FOCUS_POSITION, FOCUS_RELATIVE_POSITION, *steps),
            ],
            FocuserCommand::MoveOut(steps) => vec![
                NewVector::switch(device, FOCUS_MOTION, FOCUS_OUTWARD, true),
                NewVector::number(device, REL_FOCUS_POSITION, FOCUS_RELATIVE_POSITION, *steps),
            ],
            FocuserCommand::Abort => vec![NewVector::switch(device, FOCUS_ABORT_MOTION, ABORT, true)],
            FocuserCommand::SetReversed(reversed) => {
                let element = if *reversed { INDI_ENABLED } else { INDI_DISABLED };
                vec![NewVector::switch(device, FOCUS_REVERSE_MOTION, element, true)]
            }
            FocuserCommand::SyncTo(position) => vec![NewVector::number(
                device,
                FOCUS_SYNC,
                FOCUS_SYNC_VALUE,
                *position,
            )],
        }
    }
}

/// INDI Focuser device wrapper
#[derive(Debug, Clone)]
pub struct IndiFocuser {
    device: DeviceRef,
    state: Arc<FocuserState>,
}

impl IndiFocuser {
    /// `None` unless the device was classified as a focuser
    pub fn from_device(device: &DeviceRef) -> Option<Self> {
        match device.kind_state() {
            KindState::Focuser(state) => Some(Self {
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

    /// Get current position
    pub fn position(&self) -> f64 {
        self.state.position.load()
    }

    pub fn max_position(&self) -> f64 {
        self.state.max_position.load()
    }

    /// Check if moving
    pub fn is_moving(&self) -> bool {
        self.state.moving.load(Ordering::Acquire)
    }

    pub fn is_reversed(&self) -> bool {
        self.state.reversed.load(Ordering::Acquire)
    }

    /// Focuser temperature, if it has a sensor
    pub fn temperature(&self) -> Option<f64> {
        *self.state.temperature.read()
    }

    pub fn has_thermometer(&self) -> bool {
        self.temperature().is_some()
    }

    pub fn can_absolute_move(&self) -> bool {
        self.state.can_absolute_move.load(Ordering::Acquire)
    }

    pub fn can_relative_move(&self) -> bool {
        self.state.can_relative_move.load(Ordering::Acquire)
    }

    pub fn can_abort(&self) -> bool {
        self.state.can_abort.load(Ordering::Acquire)
    }

    pub fn can_reverse(&self) -> bool {
        self.state.can_reverse.load(Ordering::Acquire)
    }

    pub fn can_sync(&self) -> bool {
        self.state.can_sync.load(Ordering::Acquire)
    }

    async fn execute(&self, command: FocuserCommand) -> IndiResult<()> {
        self.device.send_all(command.encode(self.name())).await
    }

    /// Move to absolute position
    pub async fn move_to(&self, position: f64) -> IndiResult<()> {
        self.device.require(self.can_absolute_move(), "absolute moves")?;
        self.execute(FocuserCommand::MoveTo(position)).await
    }

    /// Move to absolute position and wait until the focuser rests there
    pub async fn move_to_and_wait(
        &self,
        position: f64,
        cancel: &CancellationToken,
    ) -> IndiResult<WaitOutcome> {
        self.device.require(self.can_absolute_move(), "absolute moves")?;
        let state = self.state.clone();
        let settled =
            move || !state.moving.load(Ordering::Acquire) && state.position.load() == position;
        self.device
            .execute_and_wait(
                FocuserCommand::MoveTo(position).encode(self.name()),
                move |event| match event {
                    DomainEvent::Focuser(_, FocuserEvent::MoveFailed(reason)) => {
                        Verdict::Failure(FailureReason::Alert(reason.clone()))
                    }
                    DomainEvent::Focuser(
                        _,
                        FocuserEvent::PositionChanged(_) | FocuserEvent::MovingChanged(_),
                    ) if settled() => Verdict::Success,
                    // already at the target: the Ok reply changes nothing
                    DomainEvent::Device(
                        _,
                        DeviceEvent::PropertyChanged {
                            name,
                            state: IndiPropertyState::Ok,
                        },
                    ) if name.as_str() == ABS_FOCUS_POSITION && settled() => Verdict::Success,
                    _ => Verdict::Pending,
                },
                Some(self.device.config().focuser_move_timeout()),
                cancel,
            )
            .await
    }

    pub async fn move_in(&self, steps: f64) -> IndiResult<()> {
        self.device.require(self.can_relative_move(), "relative moves")?;
        self.execute(FocuserCommand::MoveIn(steps)).await
    }

    pub async fn move_out(&self, steps: f64) -> IndiResult<()> {
        self.device.require(self.can_relative_move(), "relative moves")?;
        self.execute(FocuserCommand::MoveOut(steps)).await
    }

    /// Move relative (negative is inward) and wait for the motion to end
    pub async fn move_relative_and_wait(
        &self,
        steps: f64,
        cancel: &CancellationToken,
    ) -> IndiResult<WaitOutcome> {
        self.device.require(self.can_relative_move(), "relative moves")?;
        let command = if steps < 0.0 {
            FocuserCommand::MoveIn(-steps)
        } else {
            FocuserCommand::MoveOut(steps)
        };
        let state = self.state.clone();
        self.device
            .execute_and_wait(
                command.encode(self.name()),
                move |event| match event {
                    DomainEvent::Focuser(_, FocuserEvent::MoveFailed(reason)) => {
                        Verdict::Failure(FailureReason::Alert(reason.clone()))
                    }
                    DomainEvent::Focuser(_, FocuserEvent::MovingChanged(false)) => Verdict::Success,
                    DomainEvent::Device(
                        _,
                        DeviceEvent::PropertyChanged {
                            name,
                            state: IndiPropertyState::Ok,
                        },
                    ) if name.as_str() == REL_FOCUS_POSITION
                        && !state.moving.load(Ordering::Acquire) =>
                    {
                        Verdict::Success
                    }
                    _ => Verdict::Pending,
                },
                Some(self.device.config().focuser_move_timeout()),
                cancel,
            )
            .await
    }

    /// Abort motion
    pub async fn abort(&self) -> IndiResult<()> {
        self.device.require(self.can_abort(), "abort")?;
        self.execute(FocuserCommand::Abort).await
    }

    pub async fn set_reversed(&self, reversed: bool) -> IndiResult<()> {
        self.device.require(self.can_reverse(), "reverse motion")?;
        self.execute(FocuserCommand::SetReversed(reversed)).await
    }

    /// Redefine the current position without moving
    pub async fn sync_to(&self, position: f64) -> IndiResult<()> {
        self.device.require(self.can_sync(), "position sync")?;
        self.execute(FocuserCommand::SyncTo(position)).await
    }
}
