//! # Firmlink Core Library
//!
//! Host side of a Firmata link to a microcontroller over serial.

#![cfg_attr(docsrs, feature(doc_cfg))]

//!
//! This library provides:
//! - Serial port discovery, health probing and automatic failover
//! - Firmata framing and message parsing
//! - A pin/port model that only sends what changed
//! - I2C, sonar, stepper, encoder, tone, keepalive and Pixy extensions
//! - Threshold latches on incoming values
//!
//! ## Example
//!
//! ```rust,ignore
//! use firmlink_core::prelude::*;
//!
//! let bridge = Bridge::new(BridgeConfig::default())?;
//! bridge.start();
//!
//! let engine = bridge.engine();
//! engine.set_pin_mode(13, PinMode::Output, None)?;
//! engine.digital_write(13, 1)?;
//! ```

pub mod board;
pub mod bridge;
pub mod callback;
pub mod config;
pub mod engine;
pub mod protocol;
pub mod scheduler;
pub mod transport;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::board::{
        I2cReadMode, I2cReply, LatchData, LatchEvent, LatchState, PinCapabilities, PinKind,
        PinReport, SonarReading,
    };
    pub use crate::bridge::{Bridge, BridgeError};
    pub use crate::callback::Callback;
    pub use crate::config::BridgeConfig;
    pub use crate::engine::{Engine, EngineEvent, FirmwareInfo, PinStateReport};
    pub use crate::protocol::{EncoderReport, PinMode, PixyBlock, ProtocolError, Threshold};
    pub use crate::transport::{PortStatus, TransportError, TransportManager};
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
