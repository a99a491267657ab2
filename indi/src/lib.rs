//! INDI Protocol Client
//!
//! Talks the INDI XML protocol to an `indiserver` and exposes the devices it
//! announces as typed handles.
//!
//! ## Features
//!
//! - Streaming decoder that resynchronises after malformed input
//! - Property tables with change detection per device
//! - Device classification from DRIVER_INFO or well-known properties
//! - Mount, focuser, filter wheel and camera handles with typed telemetry
//! - Command-then-wait helpers that observe the device's own events
//! - Detach and session close release every pending wait
//!
//! ```no_run
//! # async fn run() -> observa_indi::IndiResult<()> {
//! use std::time::Duration;
//! use observa_indi::{CancellationToken, IndiConfig, Session};
//!
//! let session = Session::open(IndiConfig::new("localhost", 7624)).await?;
//! session.wait_for_device("Focuser Simulator", Duration::from_secs(10)).await?;
//! if let Some(focuser) = session.focuser("Focuser Simulator") {
//!     focuser.move_to_and_wait(12345.0, &CancellationToken::new()).await?;
//! }
//! session.close().await;
//! # Ok(())
//! # }
//! ```

mod camera;
mod classify;
mod codec;
mod config;
mod device;
mod encode;
mod error;
mod event;
mod filterwheel;
mod focuser;
mod framing;
mod message;
mod mount;
mod property;
mod protocol;
mod registry;
mod session;
mod sync;
mod transport;

pub use camera::{CameraCommand, CameraEvent, CapturedFrame, IndiCamera, SensorInfo};
pub use classify::{Classification, DefaultClassifier, DeviceClassifier};
pub use codec::{decode_message, parse_number, Decoded, Decoder, MessageReader};
pub use config::IndiConfig;
pub use device::{Device, DeviceKind, DeviceMessage, MESSAGE_LOG_CAPACITY};
pub use encode::encode;
pub use error::{DecodeError, DecodeErrorKind, IndiError, IndiResult};
pub use event::{
    DeviceEvent, DeviceRef, DeviceSubscription, DomainEvent, EventBus, EventBusStats,
    DEFAULT_EVENT_BUFFER_SIZE,
};
pub use filterwheel::{FilterWheelCommand, FilterWheelEvent, IndiFilterWheel};
pub use focuser::{FocuserCommand, FocuserEvent, IndiFocuser};
pub use message::*;
pub use mount::{IndiMount, MotionDirection, MountCommand, MountEvent, PierSide};
pub use property::{
    Applied, BlobValue, Element, ElementValue, NumberValue, PropertyTable, PropertyVector, Update,
};
pub use protocol::{
    coord_elements, driver_interface, standard_properties, CcdFrameType, INDI_DEFAULT_PORT,
    INDI_PROTOCOL_VERSION,
};
pub use registry::{DispatchOutput, Registry};
pub use session::{CloseReason, Session};
pub use sync::{CancellationToken, FailureReason, Verdict, WaitOutcome, Waiter};
pub use transport::{BoxedStream, IndiStream, TcpTransport, Transport};
