//! Capability discovery
//!
//! Combines the capability report and the analog mapping into one immutable
//! description per pin.

use crate::protocol::commands::CAPABILITY_END;
use crate::protocol::{ModeSet, PinMode, ProtocolError};

/// Analog mapping entry for pins without an analog channel
pub const ANALOG_IGNORE: u8 = 0x7F;

/// What one pin can do
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinCapabilities {
    /// Digital pin number
    pub pin: usize,
    /// Modes the firmware reported
    pub modes: ModeSet,
    /// Analog channel, if the pin has one
    pub analog_channel: Option<u8>,
    /// Analog input resolution in bits
    pub analog_resolution: u8,
    /// PWM resolution in bits
    pub pwm_resolution: u8,
}

impl PinCapabilities {
    pub fn supports(&self, mode: PinMode) -> bool {
        self.modes.contains(mode)
    }

    /// Whether `set_pin_mode(mode)` may be used on this pin
    pub fn accepts(&self, mode: PinMode) -> bool {
        use PinMode::*;
        match mode {
            Analog => self.supports(Analog) && self.analog_channel.is_some(),
            Input | Output | Pullup | Pwm | I2c => self.supports(mode),
            Servo | Tone | Stepper => self.supports(Output) || self.supports(mode),
            Sonar => (self.supports(Output) && self.supports(Input)) || self.supports(Sonar),
            Serial => true,
            OneWire | Encoder | Pixy => self.supports(mode),
        }
    }

    /// Digital writes are possible on output pins and on inputs with a pull-up
    pub fn is_digitally_writable(&self) -> bool {
        self.supports(PinMode::Output)
            || (self.supports(PinMode::Input) && self.supports(PinMode::Pullup))
    }
}

/// Build per-pin capabilities.
///
/// The analog mapping decides the pin count; each pin's entry in the
/// capability report is a run of (mode, resolution) pairs ended by 0x7F.
/// A pin the mapping calls analog must also report analog mode (and vice
/// versa), otherwise the two reports disagree and discovery cannot continue.
pub fn parse_capabilities(
    report: &[u8],
    analog_map: &[u8],
) -> Result<Vec<PinCapabilities>, ProtocolError> {
    let mut bytes = report.iter().copied();
    let mut pins = Vec::with_capacity(analog_map.len());

    for (pin, &mapping) in analog_map.iter().enumerate() {
        let mut caps = PinCapabilities {
            pin,
            modes: ModeSet::new(),
            analog_channel: None,
            analog_resolution: 0,
            pwm_resolution: 0,
        };

        while let Some(mode_byte) = bytes.next() {
            if mode_byte == CAPABILITY_END {
                break;
            }
            let resolution = bytes.next().unwrap_or(0);
            match PinMode::from_byte(mode_byte) {
                Some(PinMode::Analog) => {
                    caps.modes.insert(PinMode::Analog);
                    caps.analog_resolution = resolution;
                }
                Some(PinMode::Pwm) => {
                    caps.modes.insert(PinMode::Pwm);
                    caps.pwm_resolution = resolution;
                }
                Some(mode) => caps.modes.insert(mode),
                None => tracing::trace!("pin {}: unknown mode byte {:#04x}", pin, mode_byte),
            }
        }

        let mapped_analog = mapping != ANALOG_IGNORE;
        if mapped_analog != caps.supports(PinMode::Analog) {
            return Err(ProtocolError::CapabilityMismatch { pin });
        }
        if mapped_analog {
            caps.analog_channel = Some(mapping);
        }
        pins.push(caps);
    }

    Ok(pins)
}

/// Human readable dump of a capability table, one line per pin
pub fn format_report(pins: &[PinCapabilities]) -> String {
    pins.iter()
        .map(|p| {
            let modes: Vec<String> = p.modes.iter().map(|m| format!("{:?}", m)).collect();
            match p.analog_channel {
                Some(ch) => format!("pin {}: {} (A{}, {} bit)", p.pin, modes.join(", "), ch, p.analog_resolution),
                None => format!("pin {}: {}", p.pin, modes.join(", ")),
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}
