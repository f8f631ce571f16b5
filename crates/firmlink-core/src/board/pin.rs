//! Per-pin state
//!
//! Every mutator updates the logical value and raises a dirty flag only when
//! the wire-visible state changes. The flags are consumed by the owning
//! [`Port`](super::port::Port) when it generates output.

use super::capability::PinCapabilities;
use super::PinReport;
use crate::callback::Callback;
use crate::protocol::codec::push_7bit;
use crate::protocol::commands::*;
use crate::protocol::{PinMode, ProtocolError, SysexBuilder};

pub const DEFAULT_SERVO_MIN_PULSE: u16 = 544;
pub const DEFAULT_SERVO_MAX_PULSE: u16 = 2400;

/// Pending wire messages for one pin
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PinDirty {
    pub mode: bool,
    pub servo_config: bool,
    pub digital_write: bool,
    pub analog_write: bool,
    pub analog_reporting: bool,
    pub state_query: bool,
}

impl PinDirty {
    pub fn any(&self) -> bool {
        self.mode
            || self.servo_config
            || self.digital_write
            || self.analog_write
            || self.analog_reporting
            || self.state_query
    }
}

#[derive(Debug)]
pub struct Pin {
    caps: PinCapabilities,

    mode: Option<PinMode>,
    last_sent_mode: Option<PinMode>,

    /// Outbound value
    value: u32,
    last_sent_value: u32,

    servo_min: u16,
    servo_max: u16,
    last_sent_servo: Option<(u16, u16)>,

    report_analog: bool,
    last_sent_report_analog: bool,

    dirty: PinDirty,

    /// Last value the board reported for this pin
    reported: i32,
    callback: Option<Callback<PinReport>>,
}

impl Pin {
    pub fn new(caps: PinCapabilities) -> Self {
        Self {
            caps,
            mode: None,
            last_sent_mode: None,
            value: 0,
            last_sent_value: 0,
            servo_min: DEFAULT_SERVO_MIN_PULSE,
            servo_max: DEFAULT_SERVO_MAX_PULSE,
            last_sent_servo: None,
            report_analog: false,
            last_sent_report_analog: false,
            dirty: PinDirty::default(),
            reported: 0,
            callback: None,
        }
    }

    pub fn number(&self) -> usize {
        self.caps.pin
    }

    pub fn capabilities(&self) -> &PinCapabilities {
        &self.caps
    }

    pub fn mode(&self) -> Option<PinMode> {
        self.mode
    }

    pub fn value(&self) -> u32 {
        self.value
    }

    pub fn last_sent_value(&self) -> u32 {
        self.last_sent_value
    }

    pub fn dirty(&self) -> PinDirty {
        self.dirty
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.any()
    }

    pub fn reported(&self) -> i32 {
        self.reported
    }

    pub fn set_reported(&mut self, value: i32) {
        self.reported = value;
    }

    pub fn callback(&self) -> Option<&Callback<PinReport>> {
        self.callback.as_ref()
    }

    pub fn set_callback(&mut self, callback: Option<Callback<PinReport>>) {
        self.callback = callback;
    }

    pub fn is_reporting_analog(&self) -> bool {
        self.report_analog
    }

    /// Change the pin mode. Unsupported modes are rejected before anything
    /// is touched.
    pub fn set_mode(&mut self, mode: PinMode) -> Result<(), ProtocolError> {
        if !self.caps.accepts(mode) {
            return Err(ProtocolError::UnsupportedMode {
                pin: self.caps.pin,
                mode,
            });
        }

        // Leaving analog mode turns its reports off
        if self.caps.analog_channel.is_some() && mode != PinMode::Analog {
            self.disable_analog_reporting();
        }

        self.mode = Some(mode);
        self.value = if mode == PinMode::Pullup { 1 } else { 0 };

        match mode {
            PinMode::Analog => {
                // Always resent; the firmware answers a mode change with fresh readings
                self.dirty.mode = true;
                self.dirty.servo_config = false;
                self.dirty.analog_write = false;
            }
            PinMode::Servo => {
                self.dirty.mode = self.mode != self.last_sent_mode;
            }
            PinMode::Pwm => {
                self.dirty.mode = self.mode != self.last_sent_mode;
                self.dirty.servo_config = false;
            }
            _ => {
                self.dirty.mode = self.mode != self.last_sent_mode;
                self.dirty.servo_config = false;
                self.dirty.analog_write = false;
            }
        }
        Ok(())
    }

    /// Digital write with the edge rule: only 0 to non-zero and back are
    /// resent. INPUT pins are written (toggling the pull-up) only when
    /// `permit_input` is set.
    pub fn digital_write(&mut self, value: u32, permit_input: bool) {
        if !self.caps.is_digitally_writable() {
            return;
        }
        let writable = match self.mode {
            Some(PinMode::Output) => true,
            Some(PinMode::Input) => permit_input,
            _ => false,
        };
        if !writable {
            tracing::debug!("pin {} not in a writable mode ({:?})", self.caps.pin, self.mode);
            return;
        }
        self.value = value;
        self.dirty.digital_write = (value != 0 && self.last_sent_value == 0)
            || (value == 0 && self.last_sent_value != 0);
    }

    /// PWM duty or servo position
    pub fn analog_write(&mut self, value: u32) {
        if !matches!(self.mode, Some(PinMode::Pwm) | Some(PinMode::Servo)) {
            tracing::debug!("pin {} not in PWM or servo mode ({:?})", self.caps.pin, self.mode);
            return;
        }
        self.value = value;
        self.dirty.analog_write = value != self.last_sent_value;
    }

    pub fn configure_servo(&mut self, min_pulse: u16, max_pulse: u16) {
        self.servo_min = min_pulse;
        self.servo_max = max_pulse;
        self.mode = Some(PinMode::Servo);
        let unchanged = self.last_sent_servo == Some((min_pulse, max_pulse))
            && self.last_sent_mode == Some(PinMode::Servo);
        if !unchanged {
            self.dirty.mode = false;
            self.dirty.servo_config = true;
        }
    }

    /// Always resent; enabling triggers an immediate reading
    pub fn enable_analog_reporting(&mut self) {
        self.report_analog = true;
        self.dirty.analog_reporting = true;
    }

    pub fn disable_analog_reporting(&mut self) {
        self.report_analog = false;
        self.dirty.analog_reporting = self.last_sent_report_analog;
    }

    pub fn query_state(&mut self) {
        self.dirty.state_query = true;
    }

    /// Servo config, mode and analog reporting messages
    pub(crate) fn emit_config(&mut self, out: &mut Vec<u8>) {
        let pin = self.caps.pin as u8;
        if self.dirty.servo_config {
            out.extend(
                SysexBuilder::new(SERVO_CONFIG)
                    .byte(pin)
                    .seven_bit(self.servo_min as u32, 2)
                    .seven_bit(self.servo_max as u32, 2)
                    .build(),
            );
            self.last_sent_servo = Some((self.servo_min, self.servo_max));
            self.last_sent_mode = Some(PinMode::Servo);
            self.dirty.servo_config = false;
        }
        if self.dirty.mode {
            if let Some(mode) = self.mode {
                out.extend_from_slice(&[SET_PIN_MODE, pin & 0x7F, mode.as_byte()]);
            }
            self.last_sent_mode = self.mode;
            self.dirty.mode = false;
        }
        if self.dirty.analog_reporting {
            match self.caps.analog_channel {
                Some(channel) if channel < MAX_REPORTED_ANALOG_CHANNELS => {
                    out.extend_from_slice(&[REPORT_ANALOG | channel, self.report_analog as u8]);
                    self.last_sent_report_analog = self.report_analog;
                }
                _ => {}
            }
            self.dirty.analog_reporting = false;
        }
    }

    /// Take the digital write flag; the port sends one message for all its pins
    pub(crate) fn take_digital_write(&mut self) -> bool {
        std::mem::take(&mut self.dirty.digital_write)
    }

    /// Analog write and state query messages, then record the sent value
    pub(crate) fn emit_values(&mut self, out: &mut Vec<u8>) {
        let pin = self.caps.pin as u8;
        if self.dirty.analog_write {
            if pin < SHORT_ANALOG_PIN_LIMIT {
                out.push(ANALOG_MESSAGE | pin);
                push_7bit(out, self.value, 2);
            } else {
                out.extend(
                    SysexBuilder::new(EXTENDED_ANALOG)
                        .byte(pin)
                        .seven_bit(self.value, 3)
                        .build(),
                );
            }
            self.dirty.analog_write = false;
        }
        if self.dirty.state_query {
            out.extend(SysexBuilder::new(PIN_STATE_QUERY).byte(pin).build());
            self.dirty.state_query = false;
        }
        self.last_sent_value = self.value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::capability::parse_capabilities;
    use pretty_assertions::assert_eq;

    /// Pin 0: input/output/pullup/pwm; pin 1: input/output/analog on A0
    fn pins() -> Vec<Pin> {
        let report = [0, 1, 1, 1, 0x0B, 1, 3, 8, 0x7F, 0, 1, 1, 1, 2, 10, 0x7F];
        parse_capabilities(&report, &[0x7F, 0])
            .unwrap()
            .into_iter()
            .map(Pin::new)
            .collect()
    }

    fn flush(pin: &mut Pin) -> Vec<u8> {
        let mut out = Vec::new();
        pin.emit_config(&mut out);
        pin.take_digital_write();
        pin.emit_values(&mut out);
        out
    }

    #[test]
    fn test_unsupported_mode_leaves_state() {
        let mut pin = pins().remove(0);
        let err = pin.set_mode(PinMode::Analog).unwrap_err();
        assert!(matches!(err, ProtocolError::UnsupportedMode { pin: 0, .. }));
        assert_eq!(pin.mode(), None);
        assert!(!pin.is_dirty());
    }

    #[test]
    fn test_mode_only_sent_on_change() {
        let mut pin = pins().remove(0);
        pin.set_mode(PinMode::Output).unwrap();
        assert_eq!(flush(&mut pin), vec![SET_PIN_MODE, 0, 1]);
        pin.set_mode(PinMode::Output).unwrap();
        assert!(!pin.is_dirty());
    }

    #[test]
    fn test_analog_mode_always_resent() {
        let mut pin = pins().remove(1);
        pin.set_mode(PinMode::Analog).unwrap();
        pin.enable_analog_reporting();
        assert_eq!(flush(&mut pin), vec![SET_PIN_MODE, 1, 2, REPORT_ANALOG, 1]);
        pin.set_mode(PinMode::Analog).unwrap();
        assert!(pin.dirty().mode);
    }

    #[test]
    fn test_analog_reporting_disable_only_after_enable() {
        let mut pin = pins().remove(1);
        pin.disable_analog_reporting();
        assert!(!pin.is_dirty());

        pin.enable_analog_reporting();
        pin.enable_analog_reporting();
        assert_eq!(flush(&mut pin), vec![REPORT_ANALOG, 1]);
        pin.enable_analog_reporting();
        assert_eq!(flush(&mut pin), vec![REPORT_ANALOG, 1]);

        pin.disable_analog_reporting();
        assert_eq!(flush(&mut pin), vec![REPORT_ANALOG, 0]);
        pin.disable_analog_reporting();
        assert!(!pin.is_dirty());
    }

    #[test]
    fn test_digital_edge_rule() {
        let mut pin = pins().remove(0);
        pin.set_mode(PinMode::Output).unwrap();
        flush(&mut pin);

        pin.digital_write(1, true);
        assert!(pin.dirty().digital_write);
        flush(&mut pin);

        pin.digital_write(5, true);
        assert!(!pin.dirty().digital_write);
        pin.digital_write(0, true);
        assert!(pin.dirty().digital_write);
    }

    #[test]
    fn test_digital_write_needs_writable_mode() {
        let mut pin = pins().remove(0);
        pin.set_mode(PinMode::Input).unwrap();
        flush(&mut pin);
        pin.digital_write(1, false);
        assert!(!pin.dirty().digital_write);
        pin.digital_write(1, true);
        assert!(pin.dirty().digital_write);
    }

    #[test]
    fn test_pwm_write_short_form() {
        let mut pin = pins().remove(0);
        pin.set_mode(PinMode::Pwm).unwrap();
        flush(&mut pin);
        pin.analog_write(200);
        assert_eq!(flush(&mut pin), vec![ANALOG_MESSAGE, 0x48, 0x01]);
        pin.analog_write(200);
        assert!(!pin.is_dirty());
    }

    #[test]
    fn test_servo_config_sends_min_and_max() {
        let mut pin = pins().remove(0);
        pin.configure_servo(1000, 2000);
        assert_eq!(
            flush(&mut pin),
            vec![0xF0, SERVO_CONFIG, 0, 0x68, 0x07, 0x50, 0x0F, 0xF7]
        );
        pin.configure_servo(1000, 2000);
        assert!(!pin.is_dirty());
    }

    #[test]
    fn test_state_query() {
        let mut pin = pins().remove(1);
        pin.query_state();
        assert_eq!(flush(&mut pin), vec![0xF0, PIN_STATE_QUERY, 1, 0xF7]);
    }
}
