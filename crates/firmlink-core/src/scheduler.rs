//! Write scheduler
//!
//! Flushes pending model changes in a loop, pacing itself to the serial
//! link so the driver buffer never overruns.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

use crate::engine::Engine;

/// Start and stop bits on top of the 8 data bits
const FRAMING_MARGIN: f64 = 1.25;

const SAFETY_MARGIN: f64 = 1.1;

/// Time needed to put `len` bytes on a link carrying `byte_rate` bytes/s
pub fn estimate_write_time(len: usize, byte_rate: f64) -> Duration {
    if len == 0 || byte_rate <= 0.0 {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(len as f64 / byte_rate * FRAMING_MARGIN * SAFETY_MARGIN)
}

/// Pause before the next flush
pub fn pause_after(len: usize, byte_rate: f64, sleep_tune: Duration) -> Duration {
    estimate_write_time(len, byte_rate).max(sleep_tune)
}

/// Flush forever. Write errors are reported by the engine itself; the
/// scheduler just keeps going.
pub async fn run(engine: Arc<Engine>) {
    let byte_rate = engine.config().byte_rate();
    let sleep_tune = engine.config().sleep_tune;
    loop {
        let written = match engine.flush().await {
            Ok(n) => n,
            Err(e) => {
                tracing::debug!("flush failed: {}", e);
                0
            }
        };
        sleep(pause_after(written, byte_rate, sleep_tune)).await;
    }
}
