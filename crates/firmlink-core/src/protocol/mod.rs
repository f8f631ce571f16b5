//! Firmata protocol
//!
//! Wire constants, the 7-bit codec, and inbound message parsing.
//!
//! Only the message types this bridge uses are implemented: version, firmware,
//! capability, analog-mapping and pin-state queries, analog/digital I/O, and
//! the sysex extensions for I2C, sonar, encoder, stepper, tone and Pixy.

pub mod codec;
pub mod commands;
mod error;
pub mod message;

pub use codec::SysexBuilder;
pub use commands::{ModeSet, PinMode, Threshold};
pub use error::ProtocolError;
pub use message::{EncoderReport, Message, PixyBlock, SysexMessage};

/// Default baud rate for StandardFirmata/FirmataPlus sketches
pub const DEFAULT_BAUD_RATE: u32 = 57600;

/// Default time to wait for the board to finish its reset after the port opens
pub const DEFAULT_RESET_DELAY_MS: u64 = 2000;

/// Firmware version query ceiling
pub const FIRMWARE_TIMEOUT_MS: u64 = 3000;

/// Analog mapping query ceiling
pub const ANALOG_MAP_TIMEOUT_MS: u64 = 10000;
