//! Byte codec
//!
//! Firmata carries every multi-byte number as 7-bit groups, least significant
//! group first, so that data bytes never collide with command bytes (which
//! always have the high bit set).
//!
//! Sysex frame format:
//! - 1 byte: START_SYSEX (0xF0)
//! - 1 byte: sysex command
//! - N bytes: payload (7-bit)
//! - 1 byte: END_SYSEX (0xF7)

use super::commands::{END_SYSEX, START_SYSEX};

/// Append `value` as `count` 7-bit groups, low group first
pub fn push_7bit(buf: &mut Vec<u8>, value: u32, count: usize) {
    for i in 0..count {
        let shift = 7 * i as u32;
        let group = if shift >= 32 { 0 } else { (value >> shift) & 0x7F };
        buf.push(group as u8);
    }
}

/// Split `value` into `count` 7-bit groups, low group first
pub fn to_7bit(value: u32, count: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(count);
    push_7bit(&mut out, value, count);
    out
}

/// Most 7-bit groups that fit a u32
pub const MAX_U32_GROUPS: usize = 5;

/// Join 7-bit groups (low group first) back into a number.
///
/// The high bit of each byte is ignored, as is anything past the fifth group.
pub fn from_7bit(bytes: &[u8]) -> u32 {
    bytes
        .iter()
        .take(MAX_U32_GROUPS)
        .enumerate()
        .fold(0u32, |acc, (i, b)| acc | (((*b & 0x7F) as u32) << (7 * i)))
}

/// Decode a payload of LSB/MSB pairs into 14-bit values.
///
/// A trailing odd byte is dropped.
pub fn decode_pairs(bytes: &[u8]) -> Vec<u16> {
    bytes
        .chunks_exact(2)
        .map(|pair| from_7bit(pair) as u16)
        .collect()
}

/// Frame a sysex message
pub fn wrap_sysex(command: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 3);
    out.push(START_SYSEX);
    out.push(command);
    out.extend_from_slice(payload);
    out.push(END_SYSEX);
    out
}

/// Strip sysex framing, returning command byte and payload
pub fn unwrap_sysex(frame: &[u8]) -> Option<(u8, &[u8])> {
    match frame {
        [START_SYSEX, command, payload @ .., END_SYSEX] => Some((*command, payload)),
        _ => None,
    }
}

/// Builder for sysex messages
#[derive(Debug, Clone)]
pub struct SysexBuilder {
    command: u8,
    payload: Vec<u8>,
}

impl SysexBuilder {
    /// Start a sysex message with the given command
    pub fn new(command: u8) -> Self {
        Self {
            command,
            payload: Vec::new(),
        }
    }

    /// Add a raw byte (masked to 7 bits)
    pub fn byte(mut self, value: u8) -> Self {
        self.payload.push(value & 0x7F);
        self
    }

    /// Add raw bytes (each masked to 7 bits)
    pub fn bytes(mut self, values: &[u8]) -> Self {
        self.payload.extend(values.iter().map(|b| b & 0x7F));
        self
    }

    /// Add a number as `count` 7-bit groups
    pub fn seven_bit(mut self, value: u32, count: usize) -> Self {
        push_7bit(&mut self.payload, value, count);
        self
    }

    /// Build the framed message
    pub fn build(self) -> Vec<u8> {
        wrap_sysex(self.command, &self.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::commands::SERVO_CONFIG;

    #[test]
    fn test_7bit_split() {
        assert_eq!(to_7bit(0x3FFF, 2), vec![0x7F, 0x7F]);
        assert_eq!(to_7bit(544, 2), vec![0x20, 0x04]);
        assert_eq!(to_7bit(0x1F_FFFF, 3), vec![0x7F, 0x7F, 0x7F]);
        // Groups beyond `count` are truncated
        assert_eq!(to_7bit(0x80, 1), vec![0x00]);
    }

    #[test]
    fn test_7bit_roundtrip_sampled() {
        // Every value below 2^21 survives a three-group round trip
        for v in (0..(1u32 << 21)).step_by(977).chain([(1 << 21) - 1, 0x7F, 0x80, 0x3FFF, 0x4000]) {
            let count = if v < 0x80 {
                1
            } else if v < 0x4000 {
                2
            } else {
                3
            };
            assert_eq!(from_7bit(&to_7bit(v, count)), v, "value {v}");
        }
    }

    #[test]
    fn test_7bit_join_caps_at_u32() {
        assert_eq!(from_7bit(&[0x7F; 5]), u32::MAX);
        // Extra groups cannot push bits past the top
        assert_eq!(from_7bit(&[1, 1, 1, 1, 1, 1, 1, 1]), from_7bit(&[1, 1, 1, 1, 1]));
    }

    #[test]
    fn test_decode_pairs() {
        assert_eq!(decode_pairs(&[0x01, 0x01, 0x7F, 0x00, 0x05]), vec![129, 127]);
    }

    #[test]
    fn test_sysex_framing() {
        let frame = SysexBuilder::new(SERVO_CONFIG)
            .byte(9)
            .seven_bit(544, 2)
            .seven_bit(2400, 2)
            .build();
        assert_eq!(frame, vec![0xF0, 0x70, 9, 0x20, 0x04, 0x60, 0x12, 0xF7]);

        let (command, payload) = unwrap_sysex(&frame).unwrap();
        assert_eq!(command, SERVO_CONFIG);
        assert_eq!(payload, &[9, 0x20, 0x04, 0x60, 0x12]);
        assert!(unwrap_sysex(&[0xF0, 0x70]).is_none());
    }
}
