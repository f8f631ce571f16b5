//! Bridge configuration
//!
//! Everything is optional in the JSON form; missing fields take the
//! defaults below.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;

use crate::protocol::{
    ANALOG_MAP_TIMEOUT_MS, DEFAULT_BAUD_RATE, DEFAULT_RESET_DELAY_MS, FIRMWARE_TIMEOUT_MS,
};

/// Configuration for the whole bridge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Preferred serial device, tried before anything discovered
    pub port_name: Option<String>,
    /// Baud rate
    pub baud_rate: u32,
    /// Time the board needs to come out of the reset caused by opening the port
    pub reset_delay_ms: u64,
    /// Minimum pause between scheduler flushes and dispatcher reads
    pub sleep_tune_ms: u64,
    /// Ceiling for the firmware version reply during discovery
    pub firmware_timeout_ms: u64,
    /// Ceiling for the analog mapping reply during discovery
    pub analog_map_timeout_ms: u64,
    /// Ceiling for the capability report; `None` waits for as long as it takes
    pub capability_timeout_ms: Option<u64>,
    /// Ceiling for protocol version and pin state queries
    pub query_timeout_ms: u64,
    /// Probes slower than this are backed off
    pub probe_slow_threshold_ms: u64,
    /// Slow devices are re-probed once every `duration * factor`
    pub probe_backoff_factor: u32,
    /// Period of the probe cycle
    pub probe_cycle_ms: u64,
    /// Poll period while waiting for a usable port
    pub reconnect_poll_ms: u64,
    /// Poll period of the reconnection supervisor
    pub supervisor_poll_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            port_name: None,
            baud_rate: DEFAULT_BAUD_RATE,
            reset_delay_ms: DEFAULT_RESET_DELAY_MS,
            sleep_tune_ms: 1,
            firmware_timeout_ms: FIRMWARE_TIMEOUT_MS,
            analog_map_timeout_ms: ANALOG_MAP_TIMEOUT_MS,
            capability_timeout_ms: None,
            query_timeout_ms: 3000,
            probe_slow_threshold_ms: 300,
            probe_backoff_factor: 100,
            probe_cycle_ms: 1000,
            reconnect_poll_ms: 500,
            supervisor_poll_ms: 1000,
        }
    }
}

impl BridgeConfig {
    /// Parse a JSON document
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    /// Load a JSON configuration file
    pub fn from_file<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_json(&content).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    pub fn probe_slow_threshold(&self) -> Duration {
        Duration::from_millis(self.probe_slow_threshold_ms)
    }

    pub fn probe_cycle(&self) -> Duration {
        Duration::from_millis(self.probe_cycle_ms)
    }

    pub fn reconnect_poll(&self) -> Duration {
        Duration::from_millis(self.reconnect_poll_ms)
    }

    pub fn supervisor_poll(&self) -> Duration {
        Duration::from_millis(self.supervisor_poll_ms)
    }

    /// The subset the protocol engine needs
    pub fn engine(&self) -> EngineConfig {
        EngineConfig {
            baud_rate: self.baud_rate,
            reset_delay: Duration::from_millis(self.reset_delay_ms),
            sleep_tune: Duration::from_millis(self.sleep_tune_ms),
            firmware_timeout: Duration::from_millis(self.firmware_timeout_ms),
            analog_map_timeout: Duration::from_millis(self.analog_map_timeout_ms),
            capability_timeout: self.capability_timeout_ms.map(Duration::from_millis),
            query_timeout: Duration::from_millis(self.query_timeout_ms),
        }
    }
}

/// Engine timing
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub baud_rate: u32,
    pub reset_delay: Duration,
    pub sleep_tune: Duration,
    pub firmware_timeout: Duration,
    pub analog_map_timeout: Duration,
    pub capability_timeout: Option<Duration>,
    pub query_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        BridgeConfig::default().engine()
    }
}

impl EngineConfig {
    /// Bytes per second on the wire
    pub fn byte_rate(&self) -> f64 {
        self.baud_rate as f64 / 8.0
    }
}
