//! Groups of 8 pins addressed together by digital messages

use super::pin::Pin;
use crate::protocol::commands::{DIGITAL_MESSAGE, REPORT_DIGITAL};
use crate::protocol::PinMode;

pub const PINS_PER_PORT: usize = 8;

#[derive(Debug)]
pub struct Port {
    number: usize,
    pins: Vec<Pin>,
    report_digital: bool,
    last_sent_report_digital: bool,
    reporting_dirty: bool,
}

impl Port {
    pub fn new(number: usize, pins: Vec<Pin>) -> Self {
        Self {
            number,
            pins,
            report_digital: false,
            last_sent_report_digital: false,
            reporting_dirty: false,
        }
    }

    pub fn number(&self) -> usize {
        self.number
    }

    pub fn pins(&self) -> &[Pin] {
        &self.pins
    }

    pub fn pins_mut(&mut self) -> &mut [Pin] {
        &mut self.pins
    }

    pub fn pin(&self, offset: usize) -> Option<&Pin> {
        self.pins.get(offset)
    }

    pub fn pin_mut(&mut self, offset: usize) -> Option<&mut Pin> {
        self.pins.get_mut(offset)
    }

    pub fn is_reporting_digital(&self) -> bool {
        self.report_digital
    }

    /// Always resent; the firmware answers with the current port state
    pub fn enable_digital_reporting(&mut self) {
        self.report_digital = true;
        self.reporting_dirty = true;
    }

    pub fn disable_digital_reporting(&mut self) {
        self.report_digital = false;
        self.reporting_dirty = self.last_sent_report_digital;
    }

    /// Bit `i` of `value` goes to pin `i` of this port. INPUT pins are
    /// included so their pull-ups follow the written bits.
    pub fn digital_write(&mut self, value: u8) {
        for (i, pin) in self.pins.iter_mut().enumerate() {
            pin.digital_write(((value >> i) & 1) as u32, true);
        }
    }

    /// Aggregated pin levels as one byte
    pub fn value(&self) -> u8 {
        self.pins
            .iter()
            .enumerate()
            .filter(|(_, pin)| pin.value() != 0 && pin.mode() != Some(PinMode::Analog))
            .fold(0u8, |acc, (i, _)| acc | (1 << i))
    }

    pub fn is_dirty(&self) -> bool {
        self.reporting_dirty || self.pins.iter().any(Pin::is_dirty)
    }

    /// Append wire bytes for everything pending in this port
    pub fn generate_output(&mut self, out: &mut Vec<u8>) {
        for pin in &mut self.pins {
            pin.emit_config(out);
        }

        if self.reporting_dirty {
            out.extend_from_slice(&[
                REPORT_DIGITAL | (self.number as u8 & 0x0F),
                self.report_digital as u8,
            ]);
            self.last_sent_report_digital = self.report_digital;
            self.reporting_dirty = false;
        }

        // Every pin's flag is consumed even when one message covers them all
        let mut write = false;
        for pin in &mut self.pins {
            write |= pin.take_digital_write();
        }
        if write {
            let value = self.value();
            out.extend_from_slice(&[
                DIGITAL_MESSAGE | (self.number as u8 & 0x0F),
                value & 0x7F,
                value >> 7,
            ]);
        }

        for pin in &mut self.pins {
            pin.emit_values(out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::capability::{parse_capabilities, ANALOG_IGNORE};
    use pretty_assertions::assert_eq;

    /// Two ports: 8 output pins and 2 more
    fn ports() -> Vec<Port> {
        let report: Vec<u8> = (0..10).flat_map(|_| [0x00, 1, 0x01, 1, 0x7F]).collect();
        let caps = parse_capabilities(&report, &[ANALOG_IGNORE; 10]).unwrap();
        let mut pins: Vec<Pin> = caps.into_iter().map(Pin::new).collect();
        let tail = pins.split_off(8);
        vec![Port::new(0, pins), Port::new(1, tail)]
    }

    fn set_outputs(port: &mut Port) {
        for pin in port.pins_mut() {
            pin.set_mode(PinMode::Output).unwrap();
        }
        port.generate_output(&mut Vec::new());
    }

    #[test]
    fn test_single_message_per_port() {
        let mut port = ports().remove(0);
        set_outputs(&mut port);

        port.pin_mut(0).unwrap().digital_write(1, false);
        port.pin_mut(7).unwrap().digital_write(1, false);
        let mut out = Vec::new();
        port.generate_output(&mut out);
        assert_eq!(out, vec![DIGITAL_MESSAGE, 0x01, 0x01]);

        let mut again = Vec::new();
        port.generate_output(&mut again);
        assert!(again.is_empty());
    }

    #[test]
    fn test_port_write_uses_port_number() {
        let mut port = ports().remove(1);
        set_outputs(&mut port);
        port.digital_write(0b10);
        let mut out = Vec::new();
        port.generate_output(&mut out);
        assert_eq!(out, vec![DIGITAL_MESSAGE | 1, 0x02, 0x00]);
    }

    #[test]
    fn test_digital_reporting() {
        let mut port = ports().remove(0);
        port.disable_digital_reporting();
        assert!(!port.is_dirty());

        port.enable_digital_reporting();
        let mut out = Vec::new();
        port.generate_output(&mut out);
        assert_eq!(out, vec![REPORT_DIGITAL, 1]);

        port.disable_digital_reporting();
        let mut out = Vec::new();
        port.generate_output(&mut out);
        assert_eq!(out, vec![REPORT_DIGITAL, 0]);
    }

    #[test]
    fn test_mode_then_report_then_write_order() {
        let mut port = ports().remove(0);
        port.pin_mut(2).unwrap().set_mode(PinMode::Output).unwrap();
        port.pin_mut(2).unwrap().digital_write(1, false);
        port.enable_digital_reporting();
        let mut out = Vec::new();
        port.generate_output(&mut out);
        assert_eq!(
            out,
            vec![0xF4, 2, 1, REPORT_DIGITAL, 1, DIGITAL_MESSAGE, 0x04, 0x00]
        );
    }
}
