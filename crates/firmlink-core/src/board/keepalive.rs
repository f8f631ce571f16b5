//! Keepalive pings
//!
//! FirmataPlus resets the board when no keepalive arrives within the
//! configured interval. A ticker marks the keepalive dirty once
//! `interval * margin` has passed since the last ping; the next flush sends it.

use std::time::Duration;
use tokio::time::Instant;

use crate::protocol::commands::KEEP_ALIVE;
use crate::protocol::{ProtocolError, SysexBuilder};

/// Granularity of the keepalive ticker, finer than the smallest interval
pub const TICK: Duration = Duration::from_millis(500);

pub const MAX_INTERVAL_SECS: f64 = 10.0;
pub const MIN_MARGIN: f64 = 0.1;
pub const MAX_MARGIN: f64 = 0.9;
pub const DEFAULT_MARGIN: f64 = 0.3;

#[derive(Debug, Clone)]
pub struct KeepAlive {
    interval: u8,
    last_sent_interval: u8,
    margin: f64,
    last_ping: Instant,
    dirty: bool,
}

impl KeepAlive {
    pub fn new(now: Instant) -> Self {
        Self {
            interval: 0,
            last_sent_interval: 0,
            margin: DEFAULT_MARGIN,
            last_ping: now,
            dirty: false,
        }
    }

    fn check_interval(seconds: f64) -> Result<(), ProtocolError> {
        if !(0.0..=MAX_INTERVAL_SECS).contains(&seconds) {
            return Err(ProtocolError::InvalidParameter(format!(
                "keepalive interval {} outside 0..=10 seconds",
                seconds
            )));
        }
        Ok(())
    }

    fn check_margin(margin: f64) -> Result<(), ProtocolError> {
        if !(MIN_MARGIN..=MAX_MARGIN).contains(&margin) {
            return Err(ProtocolError::InvalidParameter(format!(
                "keepalive margin {} outside 0.1..=0.9",
                margin
            )));
        }
        Ok(())
    }

    /// Interval in whole seconds; 0 disables keepalives
    pub fn set_interval(&mut self, seconds: f64) -> Result<(), ProtocolError> {
        Self::check_interval(seconds)?;
        self.interval = seconds.round() as u8;
        self.dirty = self.interval != self.last_sent_interval;
        Ok(())
    }

    /// Fraction of the interval after which a ping is sent, one decimal
    pub fn set_margin(&mut self, margin: f64) -> Result<(), ProtocolError> {
        Self::check_margin(margin)?;
        self.margin = (margin * 10.0).round() / 10.0;
        Ok(())
    }

    /// Set interval and margin together; nothing changes unless both are valid
    pub fn configure(&mut self, seconds: f64, margin: f64) -> Result<(), ProtocolError> {
        Self::check_interval(seconds)?;
        Self::check_margin(margin)?;
        self.set_margin(margin)?;
        self.set_interval(seconds)
    }

    pub fn interval(&self) -> u8 {
        self.interval
    }

    pub fn margin(&self) -> f64 {
        self.margin
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Mark dirty if a ping is due
    pub fn tick(&mut self, now: Instant) {
        if self.last_sent_interval == 0 {
            return;
        }
        let due = Duration::from_secs_f64(self.last_sent_interval as f64 * self.margin);
        if now.saturating_duration_since(self.last_ping) >= due {
            self.dirty = true;
        }
    }

    pub fn generate_output(&mut self, out: &mut Vec<u8>, now: Instant) {
        if !self.dirty {
            return;
        }
        out.extend(
            SysexBuilder::new(KEEP_ALIVE)
                .seven_bit(self.interval as u32, 2)
                .build(),
        );
        self.last_sent_interval = self.interval;
        self.last_ping = now;
        self.dirty = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounds() {
        let mut ka = KeepAlive::new(Instant::now());
        assert!(ka.set_interval(11.0).is_err());
        assert!(ka.set_interval(-1.0).is_err());
        assert!(ka.set_margin(0.05).is_err());
        assert!(ka.set_margin(0.95).is_err());
        ka.set_margin(0.34).unwrap();
        assert_eq!(ka.margin(), 0.3);
        assert!(!ka.is_dirty());
    }

    #[test]
    fn test_configure_is_all_or_nothing() {
        let mut ka = KeepAlive::new(Instant::now());
        assert!(ka.configure(11.0, 0.8).is_err());
        assert!(ka.configure(5.0, 0.95).is_err());
        assert_eq!(ka.margin(), DEFAULT_MARGIN);
        assert_eq!(ka.interval(), 0);
        assert!(!ka.is_dirty());

        ka.configure(5.0, 0.8).unwrap();
        assert_eq!(ka.margin(), 0.8);
        assert_eq!(ka.interval(), 5);
        assert!(ka.is_dirty());
    }

    #[test]
    fn test_interval_change_and_tick() {
        let start = Instant::now();
        let mut ka = KeepAlive::new(start);
        ka.set_interval(2.0).unwrap();
        assert!(ka.is_dirty());

        let mut out = Vec::new();
        ka.generate_output(&mut out, start);
        assert_eq!(out, vec![0xF0, KEEP_ALIVE, 2, 0, 0xF7]);

        // 2s * 0.3 = 600ms
        ka.tick(start + Duration::from_millis(500));
        assert!(!ka.is_dirty());
        ka.tick(start + Duration::from_millis(600));
        assert!(ka.is_dirty());

        // Same interval again is not a change
        let mut out = Vec::new();
        ka.generate_output(&mut out, start + Duration::from_millis(600));
        ka.set_interval(2.0).unwrap();
        assert!(!ka.is_dirty());
    }

    #[test]
    fn test_zero_never_fires() {
        let start = Instant::now();
        let mut ka = KeepAlive::new(start);
        ka.tick(start + Duration::from_secs(100));
        assert!(!ka.is_dirty());
    }
}
