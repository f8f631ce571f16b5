//! Protocol errors

use thiserror::Error;

use super::commands::PinMode;
use crate::transport::TransportError;

/// Errors that can occur while talking Firmata to a board
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Timed out waiting for {query}")]
    Timeout { query: &'static str },

    #[error("No Firmata board connected")]
    NotConnected,

    #[error("Pin {pin} out of range (board has {count} pins)")]
    InvalidPin { pin: usize, count: usize },

    #[error("Port {port} out of range (board has {count} ports)")]
    InvalidPort { port: usize, count: usize },

    #[error("Analog channel {channel} out of range (board has {count} channels)")]
    InvalidAnalogChannel { channel: usize, count: usize },

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Pin {pin} does not support mode {mode:?}")]
    UnsupportedMode { pin: usize, mode: PinMode },

    #[error("Analog mapping and capability report disagree about pin {pin}")]
    CapabilityMismatch { pin: usize },

    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

impl ProtocolError {
    /// Whether this error means the port itself is unusable
    pub fn is_port_fault(&self) -> bool {
        matches!(
            self,
            ProtocolError::Timeout { .. } | ProtocolError::Transport(_)
        )
    }
}
