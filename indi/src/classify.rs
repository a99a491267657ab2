//! Device kind classification
//!
//! Decides which kind handler a newly announced device gets. The registry
//! asks after every buffered definition until the answer is final.

use std::collections::HashMap;

use crate::device::DeviceKind;
use crate::property::PropertyTable;
use crate::protocol::driver_interface;
use crate::protocol::standard_properties::*;

/// Answer of a [`DeviceClassifier`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Kind(DeviceKind),
    /// Known not to be one of the typed kinds
    Generic,
    /// Need more definitions
    Undecided,
}

/// Hook choosing the kind of a device from what it has defined so far
pub trait DeviceClassifier: Send + Sync {
    fn classify(&self, device: &str, properties: &PropertyTable) -> Classification;
}

/// Driver executable name fragments per kind, matched case-insensitively
const EXEC_PATTERNS: &[(&str, DeviceKind)] = &[
    ("telescope", DeviceKind::Mount),
    ("lx200", DeviceKind::Mount),
    ("eqmod", DeviceKind::Mount),
    ("ioptron", DeviceKind::Mount),
    ("celestron", DeviceKind::Mount),
    ("skywatcher", DeviceKind::Mount),
    ("ccd", DeviceKind::Camera),
    ("qhy", DeviceKind::Camera),
    ("canon", DeviceKind::Camera),
    ("nikon", DeviceKind::Camera),
    ("focus", DeviceKind::Focuser),
    ("moonlite", DeviceKind::Focuser),
    ("wheel", DeviceKind::FilterWheel),
    ("filter", DeviceKind::FilterWheel),
    ("efw", DeviceKind::FilterWheel),
];

/// Explicit registrations, then `DRIVER_INFO`, then well-known property names
#[derive(Debug, Clone, Default)]
pub struct DefaultClassifier {
    registered: HashMap<String, DeviceKind>,
}

impl DefaultClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Force the kind of a device by name
    pub fn register(mut self, device: impl Into<String>, kind: DeviceKind) -> Self {
        self.registered.insert(device.into(), kind);
        self
    }

    fn from_interface(bits: u32) -> Option<DeviceKind> {
        if bits & driver_interface::TELESCOPE != 0 {
            Some(DeviceKind::Mount)
        } else if bits & driver_interface::CCD != 0 {
            Some(DeviceKind::Camera)
        } else if bits & driver_interface::FOCUSER != 0 {
            Some(DeviceKind::Focuser)
        } else if bits & driver_interface::FILTER != 0 {
            Some(DeviceKind::FilterWheel)
        } else {
            None
        }
    }

    fn from_exec(exec: &str) -> Option<DeviceKind> {
        let exec = exec.to_ascii_lowercase();
        EXEC_PATTERNS
            .iter()
            .find(|(pattern, _)| exec.contains(pattern))
            .map(|(_, kind)| *kind)
    }

    /// Infer device type from the properties it exposes
    fn from_properties(properties: &PropertyTable) -> Option<DeviceKind> {
        let has = |names: &[&str]| names.iter().any(|n| properties.contains(n));

        if has(&[CCD_EXPOSURE, CCD_INFO, CCD1]) {
            Some(DeviceKind::Camera)
        } else if has(&[EQUATORIAL_EOD_COORD, ON_COORD_SET, TELESCOPE_TRACK_MODE, TELESCOPE_MOTION_NS]) {
            Some(DeviceKind::Mount)
        } else if has(&[ABS_FOCUS_POSITION, REL_FOCUS_POSITION, FOCUS_MOTION]) {
            Some(DeviceKind::Focuser)
        } else if has(&[FILTER_SLOT, FILTER_NAME]) {
            Some(DeviceKind::FilterWheel)
        } else {
            None
        }
    }
}

impl DeviceClassifier for DefaultClassifier {
    fn classify(&self, device: &str, properties: &PropertyTable) -> Classification {
        if let Some(kind) = self.registered.get(device) {
            return Classification::Kind(*kind);
        }

        if let Some(info) = properties.get(DRIVER_INFO) {
            let from_interface = info
                .text(DRIVER_INTERFACE)
                .and_then(|s| s.trim().parse::<u32>().ok())
                .and_then(Self::from_interface);
            let kind = from_interface
                .or_else(|| info.text(DRIVER_EXEC).and_then(Self::from_exec))
                .or_else(|| Self::from_properties(properties));
            return match kind {
                Some(kind) => Classification::Kind(kind),
                None => Classification::Generic,
            };
        }

        match Self::from_properties(properties) {
            Some(kind) => Classification::Kind(kind),
            None => Classification::Undecided,
        }
    }
}
