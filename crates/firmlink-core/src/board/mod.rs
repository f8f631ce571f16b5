//! Board model
//!
//! The pin/port tree built from discovery plus the extension state
//! (latches, keepalive, tone, I2C, sonar, encoders, Pixy). Ports own their
//! pins and the board owns the ports; everything else refers to pins by
//! number.
//!
//! Outbound changes are recorded as dirty flags and turned into wire bytes by
//! [`Board::generate_output`]. Inbound values are applied with
//! [`Board::apply_analog`] / [`Board::apply_digital`], which return the
//! callback futures to run once the caller has released the board.

pub mod capability;
pub mod devices;
pub mod keepalive;
pub mod latch;
pub mod pin;
pub mod port;
pub mod tone;

pub use capability::{format_report, parse_capabilities, PinCapabilities, ANALOG_IGNORE};
pub use devices::{I2cMap, I2cReadMode, I2cReply, SonarAdd, SonarMap, SonarReading};
pub use keepalive::KeepAlive;
pub use latch::{LatchData, LatchEvent, LatchKey, LatchState, LatchTable};
pub use pin::Pin;
pub use port::{Port, PINS_PER_PORT};
pub use tone::Tone;

use tokio::time::Instant;

use crate::callback::Pending;
use crate::protocol::{PinMode, ProtocolError};
use devices::{Encoders, Pixy};

/// Digital pin or analog channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PinKind {
    Digital,
    Analog,
}

/// Delivered to a pin callback. `pin` is the analog channel for analog
/// reports and the digital pin number otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinReport {
    pub kind: PinKind,
    pub pin: usize,
    pub value: i32,
}

#[derive(Debug)]
pub struct Board {
    ports: Vec<Port>,
    pin_count: usize,
    /// Digital pin number for each analog channel
    analog_pins: Vec<Option<usize>>,
    capabilities: Vec<PinCapabilities>,

    pub keepalive: KeepAlive,
    pub tone: Tone,
    pub latches: LatchTable,
    pub i2c: I2cMap,
    pub sonar: SonarMap,
    pub encoders: Encoders,
    pub pixy: Pixy,
}

impl Board {
    /// Build the pin/port tree; a new port starts at every eighth pin
    pub fn new(capabilities: Vec<PinCapabilities>, now: Instant) -> Self {
        let pin_count = capabilities.len();

        let channels = capabilities
            .iter()
            .filter_map(|c| c.analog_channel)
            .map(|ch| ch as usize + 1)
            .max()
            .unwrap_or(0);
        let mut analog_pins = vec![None; channels];
        for caps in &capabilities {
            if let Some(ch) = caps.analog_channel {
                analog_pins[ch as usize] = Some(caps.pin);
            }
        }

        let mut ports: Vec<Port> = Vec::with_capacity(pin_count.div_ceil(PINS_PER_PORT));
        let mut pins = Vec::with_capacity(PINS_PER_PORT);
        for caps in capabilities.iter().cloned() {
            pins.push(Pin::new(caps));
            if pins.len() == PINS_PER_PORT {
                ports.push(Port::new(ports.len(), std::mem::take(&mut pins)));
            }
        }
        if !pins.is_empty() {
            ports.push(Port::new(ports.len(), pins));
        }

        Self {
            ports,
            pin_count,
            analog_pins,
            capabilities,
            keepalive: KeepAlive::new(now),
            tone: Tone::new(),
            latches: LatchTable::new(),
            i2c: I2cMap::default(),
            sonar: SonarMap::default(),
            encoders: Encoders::default(),
            pixy: Pixy::default(),
        }
    }

    pub fn pin_count(&self) -> usize {
        self.pin_count
    }

    pub fn port_count(&self) -> usize {
        self.ports.len()
    }

    pub fn analog_count(&self) -> usize {
        self.analog_pins.iter().flatten().count()
    }

    pub fn capabilities(&self) -> &[PinCapabilities] {
        &self.capabilities
    }

    pub fn ports(&self) -> &[Port] {
        &self.ports
    }

    pub fn pin(&self, pin: usize) -> Result<&Pin, ProtocolError> {
        self.ports
            .get(pin / PINS_PER_PORT)
            .and_then(|p| p.pin(pin % PINS_PER_PORT))
            .ok_or(ProtocolError::InvalidPin {
                pin,
                count: self.pin_count,
            })
    }

    pub fn pin_mut(&mut self, pin: usize) -> Result<&mut Pin, ProtocolError> {
        let count = self.pin_count;
        self.ports
            .get_mut(pin / PINS_PER_PORT)
            .and_then(|p| p.pin_mut(pin % PINS_PER_PORT))
            .ok_or(ProtocolError::InvalidPin { pin, count })
    }

    pub fn port_mut(&mut self, port: usize) -> Result<&mut Port, ProtocolError> {
        let count = self.ports.len();
        self.ports
            .get_mut(port)
            .ok_or(ProtocolError::InvalidPort { port, count })
    }

    /// Port holding digital pin `pin`
    pub fn port_of_pin_mut(&mut self, pin: usize) -> Result<&mut Port, ProtocolError> {
        if pin >= self.pin_count {
            return Err(ProtocolError::InvalidPin {
                pin,
                count: self.pin_count,
            });
        }
        self.port_mut(pin / PINS_PER_PORT)
    }

    /// Digital pin number behind an analog channel
    pub fn analog_pin(&self, channel: usize) -> Result<usize, ProtocolError> {
        self.analog_pins
            .get(channel)
            .copied()
            .flatten()
            .ok_or(ProtocolError::InvalidAnalogChannel {
                channel,
                count: self.analog_count(),
            })
    }

    pub fn analog_pin_mut(&mut self, channel: usize) -> Result<&mut Pin, ProtocolError> {
        let pin = self.analog_pin(channel)?;
        self.pin_mut(pin)
    }

    /// Change a pin's mode and the reporting that goes with it: digital
    /// inputs turn on their port's reporting, analog inputs their channel's.
    pub fn set_pin_mode(&mut self, pin: usize, mode: PinMode) -> Result<(), ProtocolError> {
        self.pin_mut(pin)?.set_mode(mode)?;
        match mode {
            PinMode::Input | PinMode::Pullup => {
                self.port_of_pin_mut(pin)?.enable_digital_reporting();
            }
            PinMode::Analog => self.pin_mut(pin)?.enable_analog_reporting(),
            _ => {}
        }
        Ok(())
    }

    pub fn is_dirty(&self) -> bool {
        self.ports.iter().any(Port::is_dirty) || self.keepalive.is_dirty() || self.tone.is_dirty()
    }

    /// Wire bytes for every pending change; flags are cleared as they are
    /// emitted, so a second call without new changes returns nothing.
    pub fn generate_output(&mut self, now: Instant) -> Vec<u8> {
        let mut out = Vec::new();
        for port in &mut self.ports {
            port.generate_output(&mut out);
        }
        self.keepalive.generate_output(&mut out, now);
        self.tone.generate_output(&mut out);
        out
    }

    /// Store an analog reading. The pin callback runs for every reading.
    pub fn apply_analog(&mut self, channel: usize, value: u16) -> Pending {
        let mut pending = Pending::new();
        let Ok(pin) = self.analog_pin_mut(channel) else {
            tracing::trace!("analog value for unmapped channel {}", channel);
            return pending;
        };
        pin.set_reported(value as i32);
        if let Some(cb) = pin.callback() {
            pending.push(cb.call(PinReport {
                kind: PinKind::Analog,
                pin: channel,
                value: value as i32,
            }));
        }
        if let Some((cb, event)) = self.latches.check(LatchKey::analog(channel), value as i32) {
            pending.push(cb.call(event));
        }
        pending
    }

    /// Fan a port value out to its pins. Pin callbacks run only for pins
    /// whose level changed; latches see every level.
    pub fn apply_digital(&mut self, port: usize, value: u16) -> Pending {
        let mut pending = Pending::new();
        let Some(target) = self.ports.get_mut(port) else {
            tracing::trace!("digital value for unknown port {}", port);
            return pending;
        };
        let mut levels = Vec::with_capacity(PINS_PER_PORT);
        for (i, pin) in target.pins_mut().iter_mut().enumerate() {
            let level = ((value >> i) & 1) as i32;
            let changed = pin.reported() != level;
            pin.set_reported(level);
            if changed {
                if let Some(cb) = pin.callback() {
                    pending.push(cb.call(PinReport {
                        kind: PinKind::Digital,
                        pin: pin.number(),
                        value: level,
                    }));
                }
            }
            levels.push((pin.number(), level));
        }
        for (pin, level) in levels {
            if let Some((cb, event)) = self.latches.check(LatchKey::digital(pin), level) {
                pending.push(cb.call(event));
            }
        }
        pending
    }
}
