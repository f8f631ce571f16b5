//! Tone generation
//!
//! Only one tone plays at a time, so stopping only makes sense on the pin
//! that last received a tone.

use crate::protocol::commands::{TONE_DATA, TONE_NO_TONE, TONE_TONE};
use crate::protocol::SysexBuilder;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ToneRequest {
    pin: u8,
    frequency: u16,
    duration_ms: u16,
}

#[derive(Debug, Clone, Default)]
pub struct Tone {
    play: Option<ToneRequest>,
    stop: Option<u8>,
    last_sent: Option<ToneRequest>,
}

impl Tone {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a tone; a frequency of 0 stops instead. A duration of 0 plays
    /// until stopped.
    pub fn play(&mut self, pin: u8, frequency: u16, duration_ms: u16) {
        if frequency == 0 {
            self.stop(pin);
            return;
        }
        self.play = Some(ToneRequest {
            pin,
            frequency,
            duration_ms,
        });
    }

    /// Queue a stop if `pin` is where the last tone went
    pub fn stop(&mut self, pin: u8) {
        if self.last_sent.map(|t| t.pin) == Some(pin) {
            self.stop = Some(pin);
            self.play = None;
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.play.is_some() || self.stop.is_some()
    }

    pub fn generate_output(&mut self, out: &mut Vec<u8>) {
        if let Some(pin) = self.stop.take() {
            out.extend(SysexBuilder::new(TONE_DATA).byte(TONE_NO_TONE).byte(pin).build());
        }
        if let Some(req) = self.play.take() {
            out.extend(
                SysexBuilder::new(TONE_DATA)
                    .byte(TONE_TONE)
                    .byte(req.pin)
                    .seven_bit(req.frequency as u32, 2)
                    .seven_bit(req.duration_ms as u32, 2)
                    .build(),
            );
            self.last_sent = Some(req);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_play_then_stop() {
        let mut tone = Tone::new();
        tone.stop(3);
        assert!(!tone.is_dirty());

        tone.play(3, 440, 0);
        let mut out = Vec::new();
        tone.generate_output(&mut out);
        assert_eq!(out, vec![0xF0, TONE_DATA, TONE_TONE, 3, 0x38, 0x03, 0, 0, 0xF7]);

        tone.stop(4);
        assert!(!tone.is_dirty());
        tone.stop(3);
        let mut out = Vec::new();
        tone.generate_output(&mut out);
        assert_eq!(out, vec![0xF0, TONE_DATA, TONE_NO_TONE, 3, 0xF7]);
    }

    #[test]
    fn test_zero_frequency_stops() {
        let mut tone = Tone::new();
        tone.play(5, 1000, 200);
        tone.generate_output(&mut Vec::new());
        tone.play(5, 0, 0);
        let mut out = Vec::new();
        tone.generate_output(&mut out);
        assert_eq!(out, vec![0xF0, TONE_DATA, TONE_NO_TONE, 5, 0xF7]);
    }
}
