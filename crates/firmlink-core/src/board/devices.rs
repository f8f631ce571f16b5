//! I2C, sonar, encoder and Pixy bookkeeping
//!
//! These devices answer over sysex. Their last readings are cached here so
//! callers can poll, and callbacks registered at configuration time are
//! handed back when a new reading arrives.

use std::collections::HashMap;

use crate::callback::Callback;
use crate::protocol::{EncoderReport, PixyBlock};

/// Most sonar devices FirmataPlus can drive at once
pub const MAX_SONARS: usize = 6;

/// How an I2C read is requested
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum I2cReadMode {
    /// One reply
    Once,
    /// Replies keep coming until stopped
    Continuous,
}

/// Delivered to an I2C callback: `[address, register, data...]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct I2cReply {
    pub address: u16,
    pub words: Vec<u16>,
}

#[derive(Debug, Default)]
struct I2cDevice {
    data: Vec<u16>,
    callback: Option<Callback<I2cReply>>,
}

/// Known I2C devices by address
#[derive(Debug, Default)]
pub struct I2cMap {
    devices: HashMap<u16, I2cDevice>,
}

impl I2cMap {
    /// Register `address`; a new callback replaces any previous one
    pub fn ensure(&mut self, address: u16, callback: Option<Callback<I2cReply>>) {
        let device = self.devices.entry(address).or_default();
        if callback.is_some() {
            device.callback = callback;
        }
    }

    /// Store a reply. Replies for addresses nobody asked about are dropped.
    pub fn apply_reply(
        &mut self,
        address: u16,
        words: Vec<u16>,
    ) -> Option<(Callback<I2cReply>, I2cReply)> {
        let Some(device) = self.devices.get_mut(&address) else {
            tracing::debug!("i2c reply from unregistered address {:#04x}", address);
            return None;
        };
        device.data = words.get(2..).map(<[u16]>::to_vec).unwrap_or_default();
        device
            .callback
            .clone()
            .map(|cb| (cb, I2cReply { address, words }))
    }

    /// Data bytes of the last reply, without address and register
    pub fn read(&self, address: u16) -> Option<Vec<u16>> {
        self.devices.get(&address).map(|d| d.data.clone())
    }
}

/// Delivered to a sonar callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SonarReading {
    pub trigger_pin: u8,
    pub distance: u16,
}

#[derive(Debug)]
struct SonarEntry {
    distance: u16,
    callback: Option<Callback<SonarReading>>,
}

/// Result of registering a sonar
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SonarAdd {
    Added,
    Duplicate,
    Full,
}

/// Active sonars by trigger pin
#[derive(Debug, Default)]
pub struct SonarMap {
    entries: HashMap<u8, SonarEntry>,
}

impl SonarMap {
    pub fn add(&mut self, trigger_pin: u8, callback: Option<Callback<SonarReading>>) -> SonarAdd {
        if self.entries.contains_key(&trigger_pin) {
            return SonarAdd::Duplicate;
        }
        if self.entries.len() >= MAX_SONARS {
            return SonarAdd::Full;
        }
        self.entries.insert(
            trigger_pin,
            SonarEntry {
                distance: 0,
                callback,
            },
        );
        SonarAdd::Added
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Store a distance; the callback is returned only when it changed
    pub fn apply(
        &mut self,
        trigger_pin: u8,
        distance: u16,
    ) -> Option<(Callback<SonarReading>, SonarReading)> {
        let entry = self.entries.get_mut(&trigger_pin)?;
        if entry.distance == distance {
            return None;
        }
        entry.distance = distance;
        entry.callback.clone().map(|cb| {
            (
                cb,
                SonarReading {
                    trigger_pin,
                    distance,
                },
            )
        })
    }

    pub fn read(&self, trigger_pin: u8) -> Option<u16> {
        self.entries.get(&trigger_pin).map(|e| e.distance)
    }
}

#[derive(Debug, Default)]
struct EncoderEntry {
    last: Option<EncoderReport>,
    callback: Option<Callback<EncoderReport>>,
}

/// Encoders by their first pin
#[derive(Debug, Default)]
pub struct Encoders {
    hall: bool,
    entries: HashMap<u8, EncoderEntry>,
}

impl Encoders {
    pub fn configure(&mut self, pin: u8, hall: bool, callback: Option<Callback<EncoderReport>>) {
        self.hall = hall;
        self.entries.insert(
            pin,
            EncoderEntry {
                last: None,
                callback,
            },
        );
    }

    /// Whether payloads carry hall counters instead of a position
    pub fn is_hall(&self) -> bool {
        self.hall
    }

    /// Store a report. Position callbacks fire only on change, hall
    /// counters on every report.
    pub fn apply(
        &mut self,
        report: EncoderReport,
    ) -> Option<(Callback<EncoderReport>, EncoderReport)> {
        let pin = match report {
            EncoderReport::Position { pin, .. } | EncoderReport::Hall { pin, .. } => pin,
        };
        let entry = self.entries.entry(pin).or_default();
        let changed = entry.last.as_ref() != Some(&report);
        let notify = matches!(report, EncoderReport::Hall { .. }) || changed;
        entry.last = Some(report.clone());
        if !notify {
            return None;
        }
        entry.callback.clone().map(|cb| (cb, report))
    }

    pub fn read(&self, pin: u8) -> Option<EncoderReport> {
        self.entries.get(&pin).and_then(|e| e.last.clone())
    }
}

/// Latest Pixy camera blocks
#[derive(Debug, Default)]
pub struct Pixy {
    blocks: Vec<PixyBlock>,
    callback: Option<Callback<Vec<PixyBlock>>>,
}

impl Pixy {
    pub fn set_callback(&mut self, callback: Option<Callback<Vec<PixyBlock>>>) {
        self.callback = callback;
    }

    pub fn apply(
        &mut self,
        blocks: Vec<PixyBlock>,
    ) -> Option<(Callback<Vec<PixyBlock>>, Vec<PixyBlock>)> {
        self.blocks = blocks;
        self.callback.clone().map(|cb| (cb, self.blocks.clone()))
    }

    pub fn blocks(&self) -> &[PixyBlock] {
        &self.blocks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sonar_cap() {
        let mut sonars = SonarMap::default();
        for pin in 2..8 {
            assert_eq!(sonars.add(pin, None), SonarAdd::Added);
        }
        assert_eq!(sonars.add(2, None), SonarAdd::Duplicate);
        assert_eq!(sonars.add(12, None), SonarAdd::Full);
        assert_eq!(sonars.len(), MAX_SONARS);
        assert_eq!(sonars.read(12), None);
    }

    #[test]
    fn test_sonar_callback_on_change() {
        let mut sonars = SonarMap::default();
        sonars.add(7, Some(Callback::sync(|_| {})));
        let (_, reading) = sonars.apply(7, 42).unwrap();
        assert_eq!(reading.distance, 42);
        assert!(sonars.apply(7, 42).is_none());
        assert_eq!(sonars.read(7), Some(42));
    }

    #[test]
    fn test_i2c_reply_strips_header() {
        let mut i2c = I2cMap::default();
        assert!(i2c.apply_reply(0x48, vec![0x48, 0, 1, 2]).is_none());
        assert_eq!(i2c.read(0x48), None);

        i2c.ensure(0x48, Some(Callback::sync(|_| {})));
        let (_, reply) = i2c.apply_reply(0x48, vec![0x48, 0, 1, 2]).unwrap();
        assert_eq!(reply.words, vec![0x48, 0, 1, 2]);
        assert_eq!(i2c.read(0x48), Some(vec![1, 2]));
    }

    #[test]
    fn test_encoder_notifications() {
        let mut encoders = Encoders::default();
        encoders.configure(2, false, Some(Callback::sync(|_| {})));
        let pos = EncoderReport::Position { pin: 2, value: -3 };
        assert!(encoders.apply(pos.clone()).is_some());
        assert!(encoders.apply(pos.clone()).is_none());
        assert_eq!(encoders.read(2), Some(pos));

        encoders.configure(2, true, Some(Callback::sync(|_| {})));
        let hall = EncoderReport::Hall { pin: 2, counts: [1, 1] };
        assert!(encoders.apply(hall.clone()).is_some());
        assert!(encoders.apply(hall).is_some());
    }
}
