//! INDI Camera
//!
//! Exposure, cooling and readout settings of a CCD/CMOS camera. Image data
//! arrives as a BLOB on `CCD1`, so [`IndiCamera::enable_blob`] must be called
//! before frames are delivered.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::device::{alert_reported, update_flag, update_locked, AtomicF64, KindState};
use crate::error::IndiResult;
use crate::event::{DeviceRef, DomainEvent};
use crate::message::{BlobMode, NewVector};
use crate::property::{ElementValue, PropertyVector};
use crate::protocol::standard_properties::*;
use crate::protocol::CcdFrameType;
use crate::sync::{CancellationToken, FailureReason, Verdict, WaitOutcome};

const CCD_MAX_X: &str = "CCD_MAX_X";
const CCD_MAX_Y: &str = "CCD_MAX_Y";
const CCD_PIXEL_SIZE_X: &str = "CCD_PIXEL_SIZE_X";
const CCD_PIXEL_SIZE_Y: &str = "CCD_PIXEL_SIZE_Y";
const CCD_BITSPERPIXEL: &str = "CCD_BITSPERPIXEL";

/// Sensor geometry from CCD_INFO
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SensorInfo {
    pub width: u32,
    pub height: u32,
    /// Microns
    pub pixel_size_x: f64,
    pub pixel_size_y: f64,
    pub bits_per_pixel: u32,
}

/// An image delivered over a BLOB vector
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedFrame {
    /// BLOB element, `CCD1` for the main chip
    pub element: String,
    /// File suffix such as `.fits`
    pub format: String,
    pub data: Arc<[u8]>,
}

/// Camera telemetry
#[derive(Debug, Clone, PartialEq)]
pub enum CameraEvent {
    ExposingChanged(bool),
    ExposureRemainingChanged(f64),
    CoolerChanged(bool),
    TemperatureChanged(f64),
    BinningChanged { x: u32, y: u32 },
    GainChanged(f64),
    OffsetChanged(f64),
    FrameTypeChanged(CcdFrameType),
    SensorInfoChanged(SensorInfo),
    FrameCaptured(CapturedFrame),
    /// The exposure vector went to Alert
    ExposureFailed(Option<String>),
}

#[derive(Debug, Default)]
pub(crate) struct CameraState {
    exposing: AtomicBool,
    exposure_remaining: AtomicF64,
    cooler_on: AtomicBool,
    temperature: RwLock<Option<f64>>,
    binning: RwLock<(u32, u32)>,
    gain: RwLock<Option<f64>>,
    offset: RwLock<Option<f64>>,
    frame_type: RwLock<Option<CcdFrameType>>,
    sensor: RwLock<Option<SensorInfo>>,
    last_frame: RwLock<Option<CapturedFrame>>,
    can_abort: AtomicBool,
    has_cooler: AtomicBool,
    can_set_temperature: AtomicBool,
    can_bin: AtomicBool,
}

pub(crate) fn interpret(
    device: &DeviceRef,
    state: &CameraState,
    vector: &PropertyVector,
    previous: Option<&PropertyVector>,
    events: &mut Vec<DomainEvent>,
) {
    let mut emit = |event| events.push(DomainEvent::Camera(device.clone(), event));
    let writable = vector.perm.is_writable();

    match vector.name.as_str() {
        CCD_EXPOSURE => {
            if let Some(remaining) = vector.number(CCD_EXPOSURE_VALUE) {
                if state.exposure_remaining.update(remaining) {
                    emit(CameraEvent::ExposureRemainingChanged(remaining));
                }
            }
            if update_flag(&state.exposing, vector.is_busy()) {
                emit(CameraEvent::ExposingChanged(vector.is_busy()));
            }
            if alert_reported(vector, previous) {
                tracing::warn!("Camera {} exposure failed", device.name());
                emit(CameraEvent::ExposureFailed(vector.message.clone()));
            }
        }
        CCD_ABORT_EXPOSURE => state.can_abort.store(writable, Ordering::Release),
        CCD_COOLER => {
            state.has_cooler.store(writable, Ordering::Release);
            let on = vector.switch(COOLER_ON).unwrap_or(false);
            if update_flag(&state.cooler_on, on) {
                emit(CameraEvent::CoolerChanged(on));
            }
        }
        CCD_TEMPERATURE => {
            state.can_set_temperature.store(writable, Ordering::Release);
            if let Some(t) = vector.number(CCD_TEMPERATURE_VALUE) {
                if update_locked(&state.temperature, Some(t)) {
                    emit(CameraEvent::TemperatureChanged(t));
                }
            }
        }
        CCD_BINNING => {
            state.can_bin.store(writable, Ordering::Release);
            let x = vector.number(HOR_BIN).unwrap_or(1.0).max(1.0) as u32;
            let y = vector.number(VER_BIN).unwrap_or(1.0).max(1.0) as u32;
            if update_locked(&state.binning, (x, y)) {
                emit(CameraEvent::BinningChanged { x, y });
            }
        }
        CCD_GAIN => {
            if let Some(gain) = vector.number(GAIN) {
                if update_locked(&state.gain, Some(gain)) {
                    emit(CameraEvent::GainChanged(gain));
                }
            }
        }
        CCD_OFFSET => {
            if let Some(offset) = vector.number(OFFSET) {
                if update_locked(&state.offset, Some(offset)) {
                    emit(CameraEvent::OffsetChanged(offset));
                }
            }
        }
        CCD_FRAME_TYPE => {
            if let Some(frame_type) = vector.first_on_switch().and_then(CcdFrameType::from_element) {
                if update_locked(&state.frame_type, Some(frame_type)) {
                    emit(CameraEvent::FrameTypeChanged(frame_type));
                }
            }
        }
        CCD_INFO => {
            let number = |name| vector.number(name).unwrap_or_default();
            let info = SensorInfo {
                width: number(CCD_MAX_X) as u32,
                height: number(CCD_MAX_Y) as u32,
                pixel_size_x: number(CCD_PIXEL_SIZE_X),
                pixel_size_y: number(CCD_PIXEL_SIZE_Y),
                bits_per_pixel: number(CCD_BITSPERPIXEL) as u32,
            };
            if update_locked(&state.sensor, Some(info)) {
                emit(CameraEvent::SensorInfoChanged(info));
            }
        }
        CCD1 => {
            // a definition carries no payload
            let frame = vector.elements().iter().find_map(|e| match &e.value {
                ElementValue::Blob(blob) if !blob.data.is_empty() => Some(CapturedFrame {
                    element: e.name.clone(),
                    format: blob.format.clone(),
                    data: blob.data.clone(),
                }),
                _ => None,
            });
            if let Some(frame) = frame {
                tracing::info!(
                    "Camera {} delivered {} bytes ({})",
                    device.name(),
                    frame.data.len(),
                    frame.format
                );
                *state.last_frame.write() = Some(frame.clone());
                emit(CameraEvent::FrameCaptured(frame));
            }
        }
        _ => {}
    }
}

pub(crate) fn forget(state: &CameraState, property: &str) {
    match property {
        CCD_ABORT_EXPOSURE => state.can_abort.store(false, Ordering::Release),
        CCD_COOLER => state.has_cooler.store(false, Ordering::Release),
        CCD_TEMPERATURE => {
            state.can_set_temperature.store(false, Ordering::Release);
            *state.temperature.write() = None;
        }
        CCD_BINNING => state.can_bin.store(false, Ordering::Release),
        CCD_EXPOSURE => state.exposing.store(false, Ordering::Release),
        _ => {}
    }
}

/// Camera operations and their wire form
#[derive(Debug, Clone, PartialEq)]
pub enum CameraCommand {
    StartExposure(f64),
    AbortExposure,
    SetCooler(bool),
    SetTemperature(f64),
    SetBinning { x: u32, y: u32 },
    SetGain(f64),
    SetOffset(f64),
    SetFrameType(CcdFrameType),
}

impl CameraCommand {
    pub fn encode(&self, device: &str) -> Vec<NewVector> {
        let command = match self {
            CameraCommand::StartExposure(secs) => {
                NewVector::number(device, CCD_EXPOSURE, CCD_EXPOSURE_VALUE, *secs)
            }
            CameraCommand::AbortExposure => NewVector::switch(device, CCD_ABORT_EXPOSURE, ABORT, true),
            CameraCommand::SetCooler(on) => {
                NewVector::switch(device, CCD_COOLER, if *on { COOLER_ON } else { COOLER_OFF }, true)
            }
            CameraCommand::SetTemperature(t) => {
                NewVector::number(device, CCD_TEMPERATURE, CCD_TEMPERATURE_VALUE, *t)
            }
            CameraCommand::SetBinning { x, y } => {
                NewVector::numbers(device, CCD_BINNING, &[(HOR_BIN, *x as f64), (VER_BIN, *y as f64)])
            }
            CameraCommand::SetGain(gain) => NewVector::number(device, CCD_GAIN, GAIN, *gain),
            CameraCommand::SetOffset(offset) => NewVector::number(device, CCD_OFFSET, OFFSET, *offset),
            CameraCommand::SetFrameType(frame_type) => {
                NewVector::switch(device, CCD_FRAME_TYPE, frame_type.element(), true)
            }
        };
        vec![command]
    }
}

/// INDI Camera device wrapper
#[derive(Debug, Clone)]
pub struct IndiCamera {
    device: DeviceRef,
    state: Arc<CameraState>,
}

impl IndiCamera {
    /// `None` unless the device was classified as a camera
    pub fn from_device(device: &DeviceRef) -> Option<Self> {
        match device.kind_state() {
            KindState::Camera(state) => Some(Self {
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

    /// Check if camera is currently exposing
    pub fn is_exposing(&self) -> bool {
        self.state.exposing.load(Ordering::Acquire)
    }

    /// Remaining exposure time in seconds
    pub fn exposure_remaining(&self) -> f64 {
        self.state.exposure_remaining.load()
    }

    pub fn is_cooler_on(&self) -> bool {
        self.state.cooler_on.load(Ordering::Acquire)
    }

    /// Sensor temperature in degrees Celsius
    pub fn temperature(&self) -> Option<f64> {
        *self.state.temperature.read()
    }

    pub fn binning(&self) -> (u32, u32) {
        *self.state.binning.read()
    }

    pub fn gain(&self) -> Option<f64> {
        *self.state.gain.read()
    }

    pub fn offset(&self) -> Option<f64> {
        *self.state.offset.read()
    }

    pub fn frame_type(&self) -> Option<CcdFrameType> {
        *self.state.frame_type.read()
    }

    pub fn sensor_info(&self) -> Option<SensorInfo> {
        *self.state.sensor.read()
    }

    /// Most recent image
    pub fn last_frame(&self) -> Option<CapturedFrame> {
        self.state.last_frame.read().clone()
    }

    pub fn can_abort(&self) -> bool {
        self.state.can_abort.load(Ordering::Acquire)
    }

    pub fn has_cooler(&self) -> bool {
        self.state.has_cooler.load(Ordering::Acquire)
    }

    pub fn can_set_temperature(&self) -> bool {
        self.state.can_set_temperature.load(Ordering::Acquire)
    }

    pub fn can_bin(&self) -> bool {
        self.state.can_bin.load(Ordering::Acquire)
    }

    async fn execute(&self, command: CameraCommand) -> IndiResult<()> {
        self.device.send_all(command.encode(self.name())).await
    }

    /// Ask the server to forward image BLOBs along with regular updates
    pub async fn enable_blob(&self) -> IndiResult<()> {
        self.device.enable_blob(BlobMode::Also).await
    }

    pub async fn start_exposure(&self, duration_secs: f64) -> IndiResult<()> {
        self.execute(CameraCommand::StartExposure(duration_secs)).await
    }

    /// Expose and wait for the image BLOB
    pub async fn capture_and_wait(
        &self,
        duration_secs: f64,
        cancel: &CancellationToken,
    ) -> IndiResult<WaitOutcome> {
        self.device
            .execute_and_wait(
                CameraCommand::StartExposure(duration_secs).encode(self.name()),
                |event| match event {
                    DomainEvent::Camera(_, CameraEvent::ExposureFailed(reason)) => {
                        Verdict::Failure(FailureReason::Alert(reason.clone()))
                    }
                    DomainEvent::Camera(_, CameraEvent::FrameCaptured(_)) => Verdict::Success,
                    _ => Verdict::Pending,
                },
                Some(self.device.config().exposure_timeout(duration_secs)),
                cancel,
            )
            .await
    }

    pub async fn abort_exposure(&self) -> IndiResult<()> {
        self.device.require(self.can_abort(), "exposure abort")?;
        self.execute(CameraCommand::AbortExposure).await
    }

    pub async fn set_cooler(&self, enabled: bool) -> IndiResult<()> {
        self.device.require(self.has_cooler(), "cooling")?;
        self.execute(CameraCommand::SetCooler(enabled)).await
    }

    /// Set the cooling target in degrees Celsius
    pub async fn set_temperature(&self, celsius: f64) -> IndiResult<()> {
        self.device.require(self.can_set_temperature(), "temperature control")?;
        self.execute(CameraCommand::SetTemperature(celsius)).await
    }

    pub async fn set_binning(&self, x: u32, y: u32) -> IndiResult<()> {
        self.device.require(self.can_bin(), "binning")?;
        self.execute(CameraCommand::SetBinning { x, y }).await
    }

    pub async fn set_gain(&self, gain: f64) -> IndiResult<()> {
        self.execute(CameraCommand::SetGain(gain)).await
    }

    pub async fn set_offset(&self, offset: f64) -> IndiResult<()> {
        self.execute(CameraCommand::SetOffset(offset)).await
    }

    /// Set frame type (Light, Bias, Dark, Flat)
    pub async fn set_frame_type(&self, frame_type: CcdFrameType) -> IndiResult<()> {
        self.execute(CameraCommand::SetFrameType(frame_type)).await
    }
}
