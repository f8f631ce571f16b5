//! Protocol commands
//!
//! Command bytes, sysex identifiers and pin modes used on the Firmata wire.
//! Only the subset this bridge actually speaks is listed here.

use serde::{Deserialize, Serialize};

// --- Framing ---
pub const START_SYSEX: u8 = 0xF0;
pub const END_SYSEX: u8 = 0xF7;

// --- Channel messages (low nibble carries the pin or port) ---
pub const DIGITAL_MESSAGE: u8 = 0x90;
pub const DIGITAL_MESSAGE_END: u8 = 0x9F;
pub const ANALOG_MESSAGE: u8 = 0xE0;
pub const ANALOG_MESSAGE_END: u8 = 0xEF;
pub const REPORT_ANALOG: u8 = 0xC0;
pub const REPORT_DIGITAL: u8 = 0xD0;

// --- System messages ---
pub const SET_PIN_MODE: u8 = 0xF4;
pub const REPORT_VERSION: u8 = 0xF9;
pub const SYSTEM_RESET: u8 = 0xFF;

// --- Sysex commands ---
pub const KEEP_ALIVE: u8 = 0x50;
pub const TONE_DATA: u8 = 0x5F;
pub const ENCODER_CONFIG: u8 = 0x60;
pub const ENCODER_DATA: u8 = 0x61;
pub const SONAR_CONFIG: u8 = 0x62;
pub const SONAR_DATA: u8 = 0x63;
pub const PIXY_CONFIG: u8 = 0x64;
pub const PIXY_DATA: u8 = 0x65;
pub const ANALOG_MAPPING_QUERY: u8 = 0x69;
pub const ANALOG_MAPPING_RESPONSE: u8 = 0x6A;
pub const CAPABILITY_QUERY: u8 = 0x6B;
pub const CAPABILITY_RESPONSE: u8 = 0x6C;
pub const PIN_STATE_QUERY: u8 = 0x6D;
pub const PIN_STATE_RESPONSE: u8 = 0x6E;
pub const EXTENDED_ANALOG: u8 = 0x6F;
pub const SERVO_CONFIG: u8 = 0x70;
pub const STRING_DATA: u8 = 0x71;
pub const STEPPER_DATA: u8 = 0x72;
pub const I2C_REQUEST: u8 = 0x76;
pub const I2C_REPLY: u8 = 0x77;
pub const I2C_CONFIG: u8 = 0x78;
pub const REPORT_FIRMWARE: u8 = 0x79;
pub const SAMPLING_INTERVAL: u8 = 0x7A;

// --- Sub-commands ---
pub const STEPPER_CONFIGURE: u8 = 0x00;
pub const STEPPER_STEP: u8 = 0x01;

pub const PIXY_INIT: u8 = 0x00;
pub const PIXY_SET_SERVOS: u8 = 0x01;
pub const PIXY_SET_BRIGHTNESS: u8 = 0x02;
pub const PIXY_SET_LED: u8 = 0x03;

pub const TONE_TONE: u8 = 0x00;
pub const TONE_NO_TONE: u8 = 0x01;

pub const I2C_WRITE: u8 = 0x00;
pub const I2C_READ: u8 = 0x08;
pub const I2C_READ_CONTINUOUSLY: u8 = 0x10;
pub const I2C_STOP_READING: u8 = 0x18;
pub const I2C_END_TX_MASK: u8 = 0x40;

/// Terminates one pin's entry in a capability report; also marks "no analog
/// channel" in an analog mapping report.
pub const CAPABILITY_END: u8 = 0x7F;

/// Pixy talks SPI, so its data is attached to the MOSI pin.
pub const PIN_PIXY_MOSI: u8 = 11;

/// Analog reporting can only address this many channels.
pub const MAX_REPORTED_ANALOG_CHANNELS: u8 = 16;

/// Pins at or above this index use EXTENDED_ANALOG for analog writes.
pub const SHORT_ANALOG_PIN_LIMIT: u8 = 16;

/// Pin modes understood by the firmware
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PinMode {
    Input,
    Output,
    Analog,
    Pwm,
    Servo,
    I2c,
    OneWire,
    Stepper,
    Encoder,
    Serial,
    Pullup,
    Sonar,
    Tone,
    Pixy,
}

impl PinMode {
    /// All modes, in wire-byte order
    pub const ALL: [PinMode; 14] = [
        PinMode::Input,
        PinMode::Output,
        PinMode::Analog,
        PinMode::Pwm,
        PinMode::Servo,
        PinMode::I2c,
        PinMode::OneWire,
        PinMode::Stepper,
        PinMode::Encoder,
        PinMode::Serial,
        PinMode::Pullup,
        PinMode::Sonar,
        PinMode::Tone,
        PinMode::Pixy,
    ];

    /// Get the mode byte sent in SET_PIN_MODE and capability reports
    pub fn as_byte(&self) -> u8 {
        match self {
            PinMode::Input => 0x00,
            PinMode::Output => 0x01,
            PinMode::Analog => 0x02,
            PinMode::Pwm => 0x03,
            PinMode::Servo => 0x04,
            PinMode::I2c => 0x06,
            PinMode::OneWire => 0x07,
            PinMode::Stepper => 0x08,
            PinMode::Encoder => 0x09,
            PinMode::Serial => 0x0A,
            PinMode::Pullup => 0x0B,
            PinMode::Sonar => 0x0C,
            PinMode::Tone => 0x0D,
            PinMode::Pixy => 0x0E,
        }
    }

    /// Look up a mode from its wire byte
    pub fn from_byte(byte: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|m| m.as_byte() == byte)
    }
}

/// Set of pin modes, one bit per mode byte
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModeSet(u16);

impl ModeSet {
    pub fn new() -> Self {
        Self(0)
    }

    pub fn insert(&mut self, mode: PinMode) {
        self.0 |= 1 << mode.as_byte();
    }

    pub fn contains(&self, mode: PinMode) -> bool {
        self.0 & (1 << mode.as_byte()) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Iterate the contained modes in wire-byte order
    pub fn iter(&self) -> impl Iterator<Item = PinMode> + '_ {
        PinMode::ALL.iter().copied().filter(|m| self.contains(*m))
    }
}

impl FromIterator<PinMode> for ModeSet {
    fn from_iter<I: IntoIterator<Item = PinMode>>(iter: I) -> Self {
        let mut set = ModeSet::new();
        for mode in iter {
            set.insert(mode);
        }
        set
    }
}

/// Comparison applied by a latch against incoming values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Threshold {
    Eq,
    Gt,
    Lt,
    Gte,
    Lte,
}

impl Threshold {
    /// Check whether `value` satisfies this threshold against `target`
    pub fn matches(&self, value: i32, target: i32) -> bool {
        match self {
            Threshold::Eq => value == target,
            Threshold::Gt => value > target,
            Threshold::Lt => value < target,
            Threshold::Gte => value >= target,
            Threshold::Lte => value <= target,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_byte_roundtrip() {
        for mode in PinMode::ALL {
            assert_eq!(PinMode::from_byte(mode.as_byte()), Some(mode));
        }
        assert_eq!(PinMode::from_byte(0x05), None);
        assert_eq!(PinMode::from_byte(CAPABILITY_END), None);
    }

    #[test]
    fn test_mode_set() {
        let set: ModeSet = [PinMode::Input, PinMode::Pullup].into_iter().collect();
        assert!(set.contains(PinMode::Input));
        assert!(set.contains(PinMode::Pullup));
        assert!(!set.contains(PinMode::Output));
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![PinMode::Input, PinMode::Pullup]);
        assert!(ModeSet::new().is_empty());
    }

    #[test]
    fn test_threshold_matches() {
        assert!(Threshold::Eq.matches(1, 1));
        assert!(!Threshold::Gt.matches(100, 100));
        assert!(Threshold::Gte.matches(100, 100));
        assert!(Threshold::Lt.matches(99, 100));
        assert!(Threshold::Lte.matches(100, 100));
    }
}
