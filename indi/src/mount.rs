//! INDI Mount
//!
//! Tracks slew, tracking, park and position state of a telescope mount and
//! provides high-level mount control. Coordinates are JNow (EOD): RA in
//! hours, Dec in degrees.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::device::{alert_reported, update_flag, update_locked, AtomicF64, KindState};
use crate::error::IndiResult;
use crate::event::{DeviceEvent, DeviceRef, DomainEvent};
use crate::message::{IndiPropertyState, NewVector};
use crate::property::PropertyVector;
use crate::protocol::coord_elements::{DEC, RA};
use crate::protocol::standard_properties::*;
use crate::sync::{CancellationToken, FailureReason, Verdict, WaitOutcome};

/// Side of the pier the optical tube is on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PierSide {
    East,
    West,
    #[default]
    Unknown,
}

impl PierSide {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => PierSide::East,
            2 => PierSide::West,
            _ => PierSide::Unknown,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            PierSide::Unknown => 0,
            PierSide::East => 1,
            PierSide::West => 2,
        }
    }
}

/// Manual motion axis direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionDirection {
    North,
    South,
    East,
    West,
}

impl MotionDirection {
    fn property_and_element(self) -> (&'static str, &'static str) {
        match self {
            MotionDirection::North => (TELESCOPE_MOTION_NS, MOTION_NORTH),
            MotionDirection::South => (TELESCOPE_MOTION_NS, MOTION_SOUTH),
            MotionDirection::East => (TELESCOPE_MOTION_WE, MOTION_EAST),
            MotionDirection::West => (TELESCOPE_MOTION_WE, MOTION_WEST),
        }
    }
}

/// Mount telemetry
#[derive(Debug, Clone, PartialEq)]
pub enum MountEvent {
    SlewingChanged(bool),
    TrackingChanged(bool),
    ParkingChanged(bool),
    ParkedChanged(bool),
    PositionChanged { ra: f64, dec: f64 },
    PierSideChanged(PierSide),
    SlewRateChanged(Option<String>),
    TrackModeChanged(Option<String>),
    SiteChanged {
        latitude: f64,
        longitude: f64,
        elevation: f64,
    },
    /// Coordinate vector went to Alert
    SlewFailed(Option<String>),
    /// Park vector went to Alert
    ParkFailed(Option<String>),
}

/// How close the reported coordinates must be to count as on target
const RA_TOLERANCE_HOURS: f64 = 1e-3;
const DEC_TOLERANCE_DEGREES: f64 = 1e-2;

#[derive(Debug, Default)]
pub(crate) struct MountState {
    ra: AtomicF64,
    dec: AtomicF64,
    latitude: AtomicF64,
    longitude: AtomicF64,
    elevation: AtomicF64,
    slewing: AtomicBool,
    tracking: AtomicBool,
    parking: AtomicBool,
    parked: AtomicBool,
    pier_side: AtomicU8,
    slew_rates: RwLock<Vec<String>>,
    slew_rate: RwLock<Option<String>>,
    track_modes: RwLock<Vec<String>>,
    track_mode: RwLock<Option<String>>,
    can_goto: AtomicBool,
    can_sync: AtomicBool,
    can_park: AtomicBool,
    can_abort: AtomicBool,
    can_track: AtomicBool,
    can_move: AtomicBool,
}

fn switch_names(vector: &PropertyVector) -> Vec<String> {
    vector.elements().iter().map(|e| e.name.clone()).collect()
}

pub(crate) fn interpret(
    device: &DeviceRef,
    state: &MountState,
    vector: &PropertyVector,
    previous: Option<&PropertyVector>,
    events: &mut Vec<DomainEvent>,
) {
    let mut emit = |event| events.push(DomainEvent::Mount(device.clone(), event));
    let writable = vector.perm.is_writable();

    match vector.name.as_str() {
        EQUATORIAL_EOD_COORD => {
            let ra = vector.number(RA).unwrap_or_else(|| state.ra.load());
            let dec = vector.number(DEC).unwrap_or_else(|| state.dec.load());
            let ra_changed = state.ra.update(ra);
            if state.dec.update(dec) || ra_changed {
                emit(MountEvent::PositionChanged { ra, dec });
            }
            if update_flag(&state.slewing, vector.is_busy()) {
                emit(MountEvent::SlewingChanged(vector.is_busy()));
            }
            if alert_reported(vector, previous) {
                tracing::warn!("Mount {} slew failed", device.name());
                emit(MountEvent::SlewFailed(vector.message.clone()));
            }
        }
        ON_COORD_SET => {
            state.can_sync.store(vector.element(SYNC).is_some(), Ordering::Release);
            let goto = vector.element(TRACK).is_some() || vector.element(SLEW).is_some();
            state.can_goto.store(goto, Ordering::Release);
        }
        TELESCOPE_TRACK_STATE => {
            state.can_track.store(writable, Ordering::Release);
            let tracking = vector.switch(TRACK_ON).unwrap_or(false);
            if update_flag(&state.tracking, tracking) {
                emit(MountEvent::TrackingChanged(tracking));
            }
        }
        TELESCOPE_TRACK_MODE => {
            *state.track_modes.write() = switch_names(vector);
            let mode = vector.first_on_switch().map(str::to_string);
            if update_locked(&state.track_mode, mode.clone()) {
                emit(MountEvent::TrackModeChanged(mode));
            }
        }
        TELESCOPE_SLEW_RATE => {
            *state.slew_rates.write() = switch_names(vector);
            let rate = vector.first_on_switch().map(str::to_string);
            if update_locked(&state.slew_rate, rate.clone()) {
                emit(MountEvent::SlewRateChanged(rate));
            }
        }
        TELESCOPE_PARK => {
            state.can_park.store(writable, Ordering::Release);
            if update_flag(&state.parking, vector.is_busy()) {
                emit(MountEvent::ParkingChanged(vector.is_busy()));
            }
            let parked = vector.first_on_switch() == Some(PARK)
                && matches!(vector.state, IndiPropertyState::Ok | IndiPropertyState::Idle);
            if update_flag(&state.parked, parked) {
                tracing::info!("Mount {} {}", device.name(), if parked { "parked" } else { "unparked" });
                emit(MountEvent::ParkedChanged(parked));
            }
            if alert_reported(vector, previous) {
                tracing::warn!("Mount {} park failed", device.name());
                emit(MountEvent::ParkFailed(vector.message.clone()));
            }
        }
        TELESCOPE_ABORT_MOTION => state.can_abort.store(writable, Ordering::Release),
        TELESCOPE_MOTION_NS | TELESCOPE_MOTION_WE => state.can_move.store(writable, Ordering::Release),
        TELESCOPE_PIER_SIDE => {
            let side = match vector.first_on_switch() {
                Some(PIER_EAST) => PierSide::East,
                Some(PIER_WEST) => PierSide::West,
                _ => PierSide::Unknown,
            };
            if state.pier_side.swap(side.as_u8(), Ordering::AcqRel) != side.as_u8() {
                emit(MountEvent::PierSideChanged(side));
            }
        }
        GEOGRAPHIC_COORD => {
            let latitude = vector.number(LAT).unwrap_or_default();
            let longitude = vector.number(LONG).unwrap_or_default();
            let elevation = vector.number(ELEV).unwrap_or_default();
            let a = state.latitude.update(latitude);
            let b = state.longitude.update(longitude);
            let c = state.elevation.update(elevation);
            if a || b || c {
                emit(MountEvent::SiteChanged {
                    latitude,
                    longitude,
                    elevation,
                });
            }
        }
        _ => {}
    }
}

/// Drop capabilities backed by a deleted property
pub(crate) fn forget(state: &MountState, property: &str) {
    match property {
        ON_COORD_SET => {
            state.can_goto.store(false, Ordering::Release);
            state.can_sync.store(false, Ordering::Release);
        }
        TELESCOPE_PARK => state.can_park.store(false, Ordering::Release),
        TELESCOPE_ABORT_MOTION => state.can_abort.store(false, Ordering::Release),
        TELESCOPE_TRACK_STATE => state.can_track.store(false, Ordering::Release),
        TELESCOPE_MOTION_NS | TELESCOPE_MOTION_WE => state.can_move.store(false, Ordering::Release),
        TELESCOPE_SLEW_RATE => state.slew_rates.write().clear(),
        TELESCOPE_TRACK_MODE => state.track_modes.write().clear(),
        _ => {}
    }
}

/// Mount operations and their wire form
#[derive(Debug, Clone, PartialEq)]
pub enum MountCommand {
    /// Slew, then track the target
    GoTo { ra: f64, dec: f64 },
    /// Slew and stop
    SlewTo { ra: f64, dec: f64 },
    Sync { ra: f64, dec: f64 },
    Park,
    Unpark,
    Abort,
    SetTracking(bool),
    SetTrackMode(String),
    SetSlewRate(String),
    Move { direction: MotionDirection, active: bool },
    SetSite {
        latitude: f64,
        longitude: f64,
        elevation: f64,
    },
}

impl MountCommand {
    pub fn encode(&self, device: &str) -> Vec<NewVector> {
        let coords = |action: &str, ra: f64, dec: f64| {
            vec![
                NewVector::switch(device, ON_COORD_SET, action, true),
                NewVector::numbers(device, EQUATORIAL_EOD_COORD, &[(RA, ra), (DEC, dec)]),
            ]
        };
        match self {
            MountCommand::GoTo { ra, dec } => coords(TRACK, *ra, *dec),
            MountCommand::SlewTo { ra, dec } => coords(SLEW, *ra, *dec),
            MountCommand::Sync { ra, dec } => coords(SYNC, *ra, *dec),
            MountCommand::Park => vec![NewVector::switch(device, TELESCOPE_PARK, PARK, true)],
            MountCommand::Unpark => vec![NewVector::switch(device, TELESCOPE_PARK, UNPARK, true)],
            MountCommand::Abort => vec![NewVector::switch(device, TELESCOPE_ABORT_MOTION, ABORT, true)],
            MountCommand::SetTracking(on) => {
                let element = if *on { TRACK_ON } else { TRACK_OFF };
                vec![NewVector::switch(device, TELESCOPE_TRACK_STATE, element, true)]
            }
            MountCommand::SetTrackMode(mode) => {
                vec![NewVector::switch(device, TELESCOPE_TRACK_MODE, mode, true)]
            }
            MountCommand::SetSlewRate(rate) => {
                vec![NewVector::switch(device, TELESCOPE_SLEW_RATE, rate, true)]
            }
            MountCommand::Move { direction, active } => {
                let (property, element) = direction.property_and_element();
                vec![NewVector::switch(device, property, element, *active)]
            }
            MountCommand::SetSite {
                latitude,
                longitude,
                elevation,
            } => vec![NewVector::numbers(
                device,
                GEOGRAPHIC_COORD,
                &[(LAT, *latitude), (LONG, *longitude), (ELEV, *elevation)],
            )],
        }
    }
}

/// INDI Mount device wrapper
#[derive(Debug, Clone)]
pub struct IndiMount {
    device: DeviceRef,
    state: Arc<MountState>,
}

impl IndiMount {
    /// `None` unless the device was classified as a mount
    pub fn from_device(device: &DeviceRef) -> Option<Self> {
        match device.kind_state() {
            KindState::Mount(state) => Some(Self {
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

    /// Current coordinates (RA in hours, Dec in degrees)
    pub fn coordinates(&self) -> (f64, f64) {
        (self.state.ra.load(), self.state.dec.load())
    }

    /// Site latitude, longitude and elevation
    pub fn site(&self) -> (f64, f64, f64) {
        (
            self.state.latitude.load(),
            self.state.longitude.load(),
            self.state.elevation.load(),
        )
    }

    pub fn is_slewing(&self) -> bool {
        self.state.slewing.load(Ordering::Acquire)
    }

    pub fn is_tracking(&self) -> bool {
        self.state.tracking.load(Ordering::Acquire)
    }

    pub fn is_parking(&self) -> bool {
        self.state.parking.load(Ordering::Acquire)
    }

    pub fn is_parked(&self) -> bool {
        self.state.parked.load(Ordering::Acquire)
    }

    pub fn pier_side(&self) -> PierSide {
        PierSide::from_u8(self.state.pier_side.load(Ordering::Acquire))
    }

    pub fn slew_rates(&self) -> Vec<String> {
        self.state.slew_rates.read().clone()
    }

    pub fn slew_rate(&self) -> Option<String> {
        self.state.slew_rate.read().clone()
    }

    pub fn track_modes(&self) -> Vec<String> {
        self.state.track_modes.read().clone()
    }

    pub fn track_mode(&self) -> Option<String> {
        self.state.track_mode.read().clone()
    }

    pub fn can_goto(&self) -> bool {
        self.state.can_goto.load(Ordering::Acquire)
    }

    pub fn can_sync(&self) -> bool {
        self.state.can_sync.load(Ordering::Acquire)
    }

    pub fn can_park(&self) -> bool {
        self.state.can_park.load(Ordering::Acquire)
    }

    pub fn can_abort(&self) -> bool {
        self.state.can_abort.load(Ordering::Acquire)
    }

    pub fn can_set_tracking(&self) -> bool {
        self.state.can_track.load(Ordering::Acquire)
    }

    pub fn can_move(&self) -> bool {
        self.state.can_move.load(Ordering::Acquire)
    }

    async fn execute(&self, command: MountCommand) -> IndiResult<()> {
        self.device.send_all(command.encode(self.name())).await
    }

    /// Slew to coordinates and track
    pub async fn go_to(&self, ra: f64, dec: f64) -> IndiResult<()> {
        self.device.require(self.can_goto(), "goto")?;
        self.execute(MountCommand::GoTo { ra, dec }).await
    }

    /// Slew to coordinates without tracking
    pub async fn slew_to(&self, ra: f64, dec: f64) -> IndiResult<()> {
        self.device.require(self.can_goto(), "goto")?;
        self.execute(MountCommand::SlewTo { ra, dec }).await
    }

    /// Slew to coordinates, track, and wait for the slew to finish
    pub async fn go_to_and_wait(
        &self,
        ra: f64,
        dec: f64,
        cancel: &CancellationToken,
    ) -> IndiResult<WaitOutcome> {
        self.slew_and_wait(MountCommand::GoTo { ra, dec }, (ra, dec), cancel)
            .await
    }

    pub async fn slew_to_and_wait(
        &self,
        ra: f64,
        dec: f64,
        cancel: &CancellationToken,
    ) -> IndiResult<WaitOutcome> {
        self.slew_and_wait(MountCommand::SlewTo { ra, dec }, (ra, dec), cancel)
            .await
    }

    async fn slew_and_wait(
        &self,
        command: MountCommand,
        (ra, dec): (f64, f64),
        cancel: &CancellationToken,
    ) -> IndiResult<WaitOutcome> {
        self.device.require(self.can_goto(), "goto")?;
        let state = self.state.clone();
        let arrived = move || {
            !state.slewing.load(Ordering::Acquire)
                && (state.ra.load() - ra).abs() <= RA_TOLERANCE_HOURS
                && (state.dec.load() - dec).abs() <= DEC_TOLERANCE_DEGREES
        };
        self.device
            .execute_and_wait(
                command.encode(self.name()),
                move |event| match event {
                    DomainEvent::Mount(_, MountEvent::SlewFailed(reason)) => {
                        Verdict::Failure(FailureReason::Alert(reason.clone()))
                    }
                    DomainEvent::Mount(_, MountEvent::SlewingChanged(false)) => Verdict::Success,
                    // already pointing at the target: the Ok reply changes nothing
                    DomainEvent::Device(
                        _,
                        DeviceEvent::PropertyChanged {
                            name,
                            state: IndiPropertyState::Ok,
                        },
                    ) if name.as_str() == EQUATORIAL_EOD_COORD && arrived() => Verdict::Success,
                    _ => Verdict::Pending,
                },
                Some(self.device.config().mount_slew_timeout()),
                cancel,
            )
            .await
    }

    /// Sync the mount model to coordinates
    pub async fn sync(&self, ra: f64, dec: f64) -> IndiResult<()> {
        self.device.require(self.can_sync(), "sync")?;
        self.execute(MountCommand::Sync { ra, dec }).await
    }

    pub async fn park(&self) -> IndiResult<()> {
        self.device.require(self.can_park(), "park")?;
        self.execute(MountCommand::Park).await
    }

    /// Park and wait until the mount reports parked
    pub async fn park_and_wait(&self, cancel: &CancellationToken) -> IndiResult<WaitOutcome> {
        self.device.require(self.can_park(), "park")?;
        if self.is_parked() {
            return Ok(WaitOutcome::Success);
        }
        self.device
            .execute_and_wait(
                MountCommand::Park.encode(self.name()),
                |event| match event {
                    DomainEvent::Mount(_, MountEvent::ParkFailed(reason)) => {
                        Verdict::Failure(FailureReason::Alert(reason.clone()))
                    }
                    DomainEvent::Mount(_, MountEvent::ParkedChanged(true)) => Verdict::Success,
                    _ => Verdict::Pending,
                },
                Some(self.device.config().mount_park_timeout()),
                cancel,
            )
            .await
    }

    pub async fn unpark(&self) -> IndiResult<()> {
        self.device.require(self.can_park(), "park")?;
        self.execute(MountCommand::Unpark).await
    }

    /// Abort any motion
    pub async fn abort(&self) -> IndiResult<()> {
        self.device.require(self.can_abort(), "abort")?;
        self.execute(MountCommand::Abort).await
    }

    pub async fn set_tracking(&self, enabled: bool) -> IndiResult<()> {
        self.device.require(self.can_set_tracking(), "tracking control")?;
        self.execute(MountCommand::SetTracking(enabled)).await
    }

    /// Select one of [`track_modes`](Self::track_modes)
    pub async fn set_track_mode(&self, mode: &str) -> IndiResult<()> {
        self.execute(MountCommand::SetTrackMode(mode.to_string())).await
    }

    /// Select one of [`slew_rates`](Self::slew_rates)
    pub async fn set_slew_rate(&self, rate: &str) -> IndiResult<()> {
        self.execute(MountCommand::SetSlewRate(rate.to_string())).await
    }

    /// Start (`active`) or stop manual motion in one direction
    pub async fn move_axis(&self, direction: MotionDirection, active: bool) -> IndiResult<()> {
        self.device.require(self.can_move(), "manual motion")?;
        self.execute(MountCommand::Move { direction, active }).await
    }

    pub async fn set_site(&self, latitude: f64, longitude: f64, elevation: f64) -> IndiResult<()> {
        self.execute(MountCommand::SetSite {
            latitude,
            longitude,
            elevation,
        })
        .await
    }
}
