//! Session configuration
//!
//! Connection settings, decoder limits and the default timeouts used by the
//! `*_and_wait` helpers of each device kind.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::protocol::{INDI_DEFAULT_PORT, INDI_PROTOCOL_VERSION};

/// Configuration for an INDI session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndiConfig {
    /// Server host name or address
    pub host: String,
    /// Server port (default: 7624)
    pub port: u16,
    /// Connection timeout for initial TCP connection (default: 30 seconds)
    pub connection_timeout_secs: u64,
    /// Protocol version sent with the initial getProperties
    pub protocol_version: String,
    /// Largest single top-level element the decoder accepts (default: 64 MiB)
    pub max_frame_bytes: usize,
    /// Size of each read from the transport (default: 64 KiB)
    pub read_chunk_bytes: usize,
    /// Outgoing message queue depth before `send` waits (default: 256)
    pub writer_queue_capacity: usize,
    /// Broadcast buffer for telemetry subscribers (default: 1024)
    pub event_capacity: usize,
    /// Messages held for a device whose kind is not yet known (default: 2048)
    pub pending_message_limit: usize,
    /// Mount slew timeout (default: 300 seconds)
    pub mount_slew_timeout_secs: u64,
    /// Mount park timeout (default: 300 seconds)
    pub mount_park_timeout_secs: u64,
    /// Focuser move timeout (default: 120 seconds)
    pub focuser_move_timeout_secs: u64,
    /// Filter change timeout (default: 60 seconds)
    pub filter_change_timeout_secs: u64,
    /// Camera exposure timeout buffer (added to exposure time, default: 60 seconds)
    pub camera_exposure_buffer_secs: u64,
}

impl Default for IndiConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: INDI_DEFAULT_PORT,
            connection_timeout_secs: 30,
            protocol_version: INDI_PROTOCOL_VERSION.to_string(),
            max_frame_bytes: 64 * 1024 * 1024,
            read_chunk_bytes: 64 * 1024,
            writer_queue_capacity: 256,
            event_capacity: 1024,
            pending_message_limit: 2048,
            mount_slew_timeout_secs: 300,
            mount_park_timeout_secs: 300,
            focuser_move_timeout_secs: 120,
            filter_change_timeout_secs: 60,
            camera_exposure_buffer_secs: 60,
        }
    }
}

impl IndiConfig {
    /// Config for a server at `host:port`, everything else default
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    /// `host:port` as passed to the transport
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Get the connection timeout as a Duration
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn mount_slew_timeout(&self) -> Duration {
        Duration::from_secs(self.mount_slew_timeout_secs)
    }

    pub fn mount_park_timeout(&self) -> Duration {
        Duration::from_secs(self.mount_park_timeout_secs)
    }

    pub fn focuser_move_timeout(&self) -> Duration {
        Duration::from_secs(self.focuser_move_timeout_secs)
    }

    pub fn filter_change_timeout(&self) -> Duration {
        Duration::from_secs(self.filter_change_timeout_secs)
    }

    /// Exposure timeout: the exposure itself plus the download buffer
    pub fn exposure_timeout(&self, exposure_secs: f64) -> Duration {
        Duration::from_secs_f64(exposure_secs.max(0.0))
            + Duration::from_secs(self.camera_exposure_buffer_secs)
    }
}
