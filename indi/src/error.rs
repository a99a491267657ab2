//! INDI error types
//!
//! Provides structured error types for INDI operations.

use std::fmt;
use std::time::Duration;

/// What went wrong while turning bytes into a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeErrorKind {
    /// Bytes between top-level elements that are not markup
    Garbage,
    /// A top-level element was cut off by the start of another one
    Truncated,
    /// A complete element that is not a well-formed message
    Malformed,
    /// An element larger than the configured frame limit
    Oversized,
}

impl fmt::Display for DecodeErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DecodeErrorKind::Garbage => "garbage between elements",
            DecodeErrorKind::Truncated => "truncated element",
            DecodeErrorKind::Malformed => "malformed element",
            DecodeErrorKind::Oversized => "oversized element",
        };
        f.write_str(s)
    }
}

/// A message that could not be decoded. Non-fatal: the decoder has already
/// moved past the offending bytes when this is reported.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind} ({bytes} bytes): {detail}")]
pub struct DecodeError {
    pub kind: DecodeErrorKind,
    pub detail: String,
    /// Number of bytes dropped from the stream
    pub bytes: usize,
}

impl DecodeError {
    pub fn new(kind: DecodeErrorKind, detail: impl Into<String>, bytes: usize) -> Self {
        Self {
            kind,
            detail: detail.into(),
            bytes,
        }
    }
}

/// INDI client errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum IndiError {
    /// Connection to INDI server failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    /// Connection timeout with context
    #[error("Connection timeout: failed to connect to {host}:{port} after {duration:?}")]
    ConnectionTimeout {
        host: String,
        port: u16,
        duration: Duration,
    },
    /// Session is closed or was never opened
    #[error("Not connected to INDI server")]
    NotConnected,
    /// Send channel closed
    #[error("Channel closed: {0}")]
    ChannelClosed(String),
    /// Malformed wire data
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),
    /// Property not found
    #[error("Property not found: {device}.{property}")]
    PropertyNotFound { device: String, property: String },
    /// Element not found inside a known property
    #[error("Element not found: {device}.{property}.{element}")]
    ElementNotFound {
        device: String,
        property: String,
        element: String,
    },
    /// Attempted to write a read-only property
    #[error("Permission denied: {device}.{property} is read-only")]
    PermissionDenied { device: String, property: String },
    /// Property value out of range
    #[error("Value {value} out of range [{min}, {max}] for {device}.{property}.{element}")]
    ValueOutOfRange {
        device: String,
        property: String,
        element: String,
        value: f64,
        min: f64,
        max: f64,
    },
    /// Device does not advertise the capability the command needs
    #[error("Device '{device}' does not support {operation}")]
    Unsupported { device: String, operation: String },
    /// Device reported the Alert state on the awaited property
    #[error("Device alert on {device}: {reason}")]
    DeviceAlert { device: String, reason: String },
    /// Operation timeout with detailed context
    #[error("Operation '{operation}' on device {device} timed out after {duration:?}")]
    OperationTimeout {
        operation: String,
        device: String,
        duration: Duration,
    },
    /// Caller cancelled the wait
    #[error("Operation '{operation}' on device {device} was cancelled")]
    Cancelled { operation: String, device: String },
    /// Device went away while an operation was pending
    #[error("Device detached: {0}")]
    Detached(String),
    /// Session closed while an operation was pending
    #[error("Session closed")]
    SessionClosed,
    /// Underlying stream error
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for IndiError {
    fn from(err: std::io::Error) -> Self {
        IndiError::Io(err.to_string())
    }
}

impl From<IndiError> for String {
    fn from(err: IndiError) -> String {
        err.to_string()
    }
}

/// Result type for INDI operations
pub type IndiResult<T> = Result<T, IndiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = IndiError::ConnectionFailed("connection refused".to_string());
        assert_eq!(err.to_string(), "Connection failed: connection refused");

        let err = IndiError::PropertyNotFound {
            device: "CCD Simulator".to_string(),
            property: "CCD_EXPOSURE".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Property not found: CCD Simulator.CCD_EXPOSURE"
        );

        let err = IndiError::ValueOutOfRange {
            device: "Focuser".to_string(),
            property: "ABS_FOCUS_POSITION".to_string(),
            element: "FOCUS_ABSOLUTE_POSITION".to_string(),
            value: 100000.0,
            min: 0.0,
            max: 50000.0,
        };
        assert!(err.to_string().contains("100000"));
        assert!(err.to_string().contains("50000"));
    }

    #[test]
    fn test_permission_denied_display() {
        let err = IndiError::PermissionDenied {
            device: "Telescope Simulator".to_string(),
            property: "TELESCOPE_INFO".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Permission denied: Telescope Simulator.TELESCOPE_INFO is read-only"
        );
    }

    #[test]
    fn test_operation_timeout_display() {
        let err = IndiError::OperationTimeout {
            operation: "slew".to_string(),
            device: "Telescope".to_string(),
            duration: Duration::from_secs(300),
        };
        let msg = err.to_string();
        assert!(msg.contains("slew"));
        assert!(msg.contains("Telescope"));
        assert!(msg.contains("300"));
    }

    #[test]
    fn test_decode_error_converts() {
        let decode = DecodeError::new(DecodeErrorKind::Garbage, "stray text", 12);
        assert_eq!(
            decode.to_string(),
            "garbage between elements (12 bytes): stray text"
        );

        let err: IndiError = decode.clone().into();
        assert!(matches!(err, IndiError::Decode(ref d) if *d == decode));
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
        let err: IndiError = io.into();
        let s: String = err.into();
        assert_eq!(s, "I/O error: pipe closed");
    }
}
