//! Threshold latches on incoming values

use chrono::{DateTime, Utc};
use std::collections::HashMap;

use super::PinKind;
use crate::callback::Callback;
use crate::protocol::{ProtocolError, Threshold};

/// Largest value an analog latch can wait for
pub const ANALOG_LATCH_MAX: i32 = 1023;

/// Latch identity: digital pin number or analog channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LatchKey {
    pub kind: PinKind,
    pub pin: usize,
}

impl LatchKey {
    pub fn digital(pin: usize) -> Self {
        Self { kind: PinKind::Digital, pin }
    }

    pub fn analog(channel: usize) -> Self {
        Self { kind: PinKind::Analog, pin: channel }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LatchState {
    #[default]
    Ignore,
    Armed,
    Latched,
}

/// Delivered to a latch callback when its threshold is met
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LatchEvent {
    pub key: LatchKey,
    pub value: i32,
    pub timestamp: DateTime<Utc>,
}

/// Polled view of a latch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LatchData {
    pub state: LatchState,
    pub threshold: Threshold,
    pub target: i32,
    pub latched_value: i32,
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
struct LatchEntry {
    state: LatchState,
    threshold: Threshold,
    target: i32,
    latched_value: i32,
    timestamp: Option<DateTime<Utc>>,
    callback: Option<Callback<LatchEvent>>,
}

impl Default for LatchEntry {
    fn default() -> Self {
        Self {
            state: LatchState::Ignore,
            threshold: Threshold::Eq,
            target: 0,
            latched_value: 0,
            timestamp: None,
            callback: None,
        }
    }
}

/// All latches of one connection, at most one per key
#[derive(Debug, Default)]
pub struct LatchTable {
    entries: HashMap<LatchKey, LatchEntry>,
}

impl LatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a latch. Out-of-range targets are rejected and nothing changes.
    pub fn arm(
        &mut self,
        key: LatchKey,
        threshold: Threshold,
        target: i32,
        callback: Option<Callback<LatchEvent>>,
    ) -> Result<(), ProtocolError> {
        let max = match key.kind {
            PinKind::Digital => 1,
            PinKind::Analog => ANALOG_LATCH_MAX,
        };
        if !(0..=max).contains(&target) {
            return Err(ProtocolError::InvalidParameter(format!(
                "latch threshold {} outside 0..={}",
                target, max
            )));
        }
        self.entries.insert(
            key,
            LatchEntry {
                state: LatchState::Armed,
                threshold,
                target,
                callback,
                ..LatchEntry::default()
            },
        );
        Ok(())
    }

    /// Feed a new value. When an armed latch fires with a callback the entry
    /// is reset and the callback returned; without one it stays latched.
    pub fn check(
        &mut self,
        key: LatchKey,
        value: i32,
    ) -> Option<(Callback<LatchEvent>, LatchEvent)> {
        let entry = self.entries.get_mut(&key)?;
        if entry.state != LatchState::Armed || !entry.threshold.matches(value, entry.target) {
            return None;
        }

        let timestamp = Utc::now();
        match entry.callback.take() {
            Some(callback) => {
                *entry = LatchEntry::default();
                Some((
                    callback,
                    LatchEvent {
                        key,
                        value,
                        timestamp,
                    },
                ))
            }
            None => {
                entry.state = LatchState::Latched;
                entry.latched_value = value;
                entry.timestamp = Some(timestamp);
                None
            }
        }
    }

    /// Read a latch. Reading a latched entry consumes it; arm it again to
    /// wait for the next crossing.
    pub fn poll(&mut self, key: LatchKey) -> Option<LatchData> {
        let entry = self.entries.get_mut(&key)?;
        let data = LatchData {
            state: entry.state,
            threshold: entry.threshold,
            target: entry.target,
            latched_value: entry.latched_value,
            timestamp: entry.timestamp,
        };
        if entry.state == LatchState::Latched {
            *entry = LatchEntry::default();
        }
        Some(data)
    }
}
