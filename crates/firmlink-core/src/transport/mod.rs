//! Serial transport
//!
//! Everything between the protocol engine and the operating system: the byte
//! level contract the engine reads and writes through, the OS serial
//! implementation, background port probing, and the manager that picks,
//! opens and fails over between candidate ports.

mod loopback;
pub mod manager;
pub mod probe;
pub mod serial;

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

pub use loopback::{LoopbackOpener, LoopbackTransport};
pub use manager::{
    list_candidates, CandidateSnapshot, LinkState, PortStatus, TransportEvent, TransportManager,
};
pub use probe::{ProbeBackoff, ProbeOutcome, ProbeResult, Prober, SerialProber};
pub use serial::{list_ports, PortInfo, SerialOpener, SerialTransport};

/// Errors raised by a transport
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Port {0} is closed")]
    Closed(String),

    #[error("Failed to open {port}: {reason}")]
    OpenFailed { port: String, reason: String },

    #[error("No candidate serial port locations")]
    NoCandidates,

    #[error("Serial port error: {0}")]
    Serial(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serialport::Error> for TransportError {
    fn from(e: serialport::Error) -> Self {
        TransportError::Serial(e.to_string())
    }
}

/// Byte-level contract the protocol engine talks through.
///
/// Reads and writes take `&self` so one open port can be shared between the
/// dispatcher (reading) and the write scheduler (writing).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Device name this transport is bound to
    fn name(&self) -> &str;

    /// Wait for the next inbound byte.
    ///
    /// Yields to other tasks while no data is available and returns
    /// [`TransportError::Closed`] once the port is no longer valid.
    async fn read_byte(&self) -> Result<u8, TransportError>;

    /// Write all bytes
    async fn write(&self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Whether the port is still usable
    fn is_open(&self) -> bool;

    /// Invalidate the port; pending reads return `Closed`
    fn close(&self);
}

/// Opens a named device into a [`Transport`]
#[async_trait]
pub trait PortOpener: Send + Sync {
    async fn open(&self, name: &str, baud_rate: u32) -> Result<Arc<dyn Transport>, TransportError>;
}
