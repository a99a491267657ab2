//! INDI XML Protocol definitions

/// INDI protocol version
pub const INDI_PROTOCOL_VERSION: &str = "1.7";

/// Default INDI server port
pub const INDI_DEFAULT_PORT: u16 = 7624;

/// CCD frame type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CcdFrameType {
    Light,
    Bias,
    Dark,
    Flat,
}

impl CcdFrameType {
    /// Switch element of `CCD_FRAME_TYPE` selecting this frame type
    pub fn element(self) -> &'static str {
        match self {
            CcdFrameType::Light => "FRAME_LIGHT",
            CcdFrameType::Bias => "FRAME_BIAS",
            CcdFrameType::Dark => "FRAME_DARK",
            CcdFrameType::Flat => "FRAME_FLAT",
        }
    }

    pub fn from_element(element: &str) -> Option<Self> {
        match element {
            "FRAME_LIGHT" => Some(CcdFrameType::Light),
            "FRAME_BIAS" => Some(CcdFrameType::Bias),
            "FRAME_DARK" => Some(CcdFrameType::Dark),
            "FRAME_FLAT" => Some(CcdFrameType::Flat),
            _ => None,
        }
    }
}

/// Standard INDI properties
pub mod standard_properties {
    /// Connection control switch
    pub const CONNECTION: &str = "CONNECTION";
    pub const CONNECT: &str = "CONNECT";
    pub const DISCONNECT: &str = "DISCONNECT";

    /// Driver identification text vector
    pub const DRIVER_INFO: &str = "DRIVER_INFO";
    pub const DRIVER_NAME: &str = "DRIVER_NAME";
    pub const DRIVER_EXEC: &str = "DRIVER_EXEC";
    pub const DRIVER_INTERFACE: &str = "DRIVER_INTERFACE";

    // Camera properties
    pub const CCD_EXPOSURE: &str = "CCD_EXPOSURE";
    pub const CCD_EXPOSURE_VALUE: &str = "CCD_EXPOSURE_VALUE";
    pub const CCD_ABORT_EXPOSURE: &str = "CCD_ABORT_EXPOSURE";
    pub const ABORT: &str = "ABORT";
    pub const CCD_FRAME_TYPE: &str = "CCD_FRAME_TYPE";
    pub const CCD_BINNING: &str = "CCD_BINNING";
    pub const HOR_BIN: &str = "HOR_BIN";
    pub const VER_BIN: &str = "VER_BIN";
    pub const CCD_TEMPERATURE: &str = "CCD_TEMPERATURE";
    pub const CCD_TEMPERATURE_VALUE: &str = "CCD_TEMPERATURE_VALUE";
    pub const CCD_COOLER: &str = "CCD_COOLER";
    pub const COOLER_ON: &str = "COOLER_ON";
    pub const COOLER_OFF: &str = "COOLER_OFF";
    pub const CCD_GAIN: &str = "CCD_GAIN";
    pub const GAIN: &str = "GAIN";
    pub const CCD_OFFSET: &str = "CCD_OFFSET";
    pub const OFFSET: &str = "OFFSET";
    pub const CCD_INFO: &str = "CCD_INFO";
    pub const CCD1: &str = "CCD1"; // BLOB property for image data

    // Mount properties
    pub const EQUATORIAL_EOD_COORD: &str = "EQUATORIAL_EOD_COORD";
    pub const ON_COORD_SET: &str = "ON_COORD_SET";
    pub const TRACK: &str = "TRACK";
    pub const SLEW: &str = "SLEW";
    pub const SYNC: &str = "SYNC";
    pub const TELESCOPE_TRACK_STATE: &str = "TELESCOPE_TRACK_STATE";
    pub const TRACK_ON: &str = "TRACK_ON";
    pub const TRACK_OFF: &str = "TRACK_OFF";
    pub const TELESCOPE_TRACK_MODE: &str = "TELESCOPE_TRACK_MODE";
    pub const TELESCOPE_PARK: &str = "TELESCOPE_PARK";
    pub const PARK: &str = "PARK";
    pub const UNPARK: &str = "UNPARK";
    pub const TELESCOPE_ABORT_MOTION: &str = "TELESCOPE_ABORT_MOTION";
    pub const TELESCOPE_MOTION_NS: &str = "TELESCOPE_MOTION_NS";
    pub const MOTION_NORTH: &str = "MOTION_NORTH";
    pub const MOTION_SOUTH: &str = "MOTION_SOUTH";
    pub const TELESCOPE_MOTION_WE: &str = "TELESCOPE_MOTION_WE";
    pub const MOTION_WEST: &str = "MOTION_WEST";
    pub const MOTION_EAST: &str = "MOTION_EAST";
    pub const TELESCOPE_SLEW_RATE: &str = "TELESCOPE_SLEW_RATE";
    pub const TELESCOPE_PIER_SIDE: &str = "TELESCOPE_PIER_SIDE";
    pub const PIER_EAST: &str = "PIER_EAST";
    pub const PIER_WEST: &str = "PIER_WEST";
    pub const GEOGRAPHIC_COORD: &str = "GEOGRAPHIC_COORD";
    pub const LAT: &str = "LAT";
    pub const LONG: &str = "LONG";
    pub const ELEV: &str = "ELEV";

    // Focuser properties
    pub const FOCUS_MOTION: &str = "FOCUS_MOTION";
    pub const FOCUS_INWARD: &str = "FOCUS_INWARD";
    pub const FOCUS_OUTWARD: &str = "FOCUS_OUTWARD";
    pub const ABS_FOCUS_POSITION: &str = "ABS_FOCUS_POSITION";
    pub const FOCUS_ABSOLUTE_POSITION: &str = "FOCUS_ABSOLUTE_POSITION";
    pub const REL_FOCUS_POSITION: &str = "REL_FOCUS_POSITION";
    pub const FOCUS_RELATIVE_POSITION: &str = "FOCUS_RELATIVE_POSITION";
    pub const FOCUS_ABORT_MOTION: &str = "FOCUS_ABORT_MOTION";
    pub const FOCUS_REVERSE_MOTION: &str = "FOCUS_REVERSE_MOTION";
    pub const INDI_ENABLED: &str = "INDI_ENABLED";
    pub const INDI_DISABLED: &str = "INDI_DISABLED";
    pub const FOCUS_SYNC: &str = "FOCUS_SYNC";
    pub const FOCUS_SYNC_VALUE: &str = "FOCUS_SYNC_VALUE";
    pub const FOCUS_TEMPERATURE: &str = "FOCUS_TEMPERATURE";
    pub const TEMPERATURE: &str = "TEMPERATURE";

    // Filter wheel properties
    pub const FILTER_SLOT: &str = "FILTER_SLOT";
    pub const FILTER_SLOT_VALUE: &str = "FILTER_SLOT_VALUE";
    pub const FILTER_NAME: &str = "FILTER_NAME";
    /// Prefix of the per-slot text elements in `FILTER_NAME`
    pub const FILTER_SLOT_NAME_PREFIX: &str = "FILTER_SLOT_NAME_";
}

/// Common coordinate elements
pub mod coord_elements {
    pub const RA: &str = "RA";
    pub const DEC: &str = "DEC";
}

/// Bits of the `DRIVER_INTERFACE` mask
pub mod driver_interface {
    pub const TELESCOPE: u32 = 1 << 0;
    pub const CCD: u32 = 1 << 1;
    pub const GUIDER: u32 = 1 << 2;
    pub const FOCUSER: u32 = 1 << 3;
    pub const FILTER: u32 = 1 << 4;
}
