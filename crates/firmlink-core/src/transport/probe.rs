//! Port probing
//!
//! Checking whether a device can be opened means a blocking native open and
//! close that may stall for seconds on a busy or missing device. Each
//! candidate gets its own worker thread; requests go in over a std channel and
//! results come back to the async side over a tokio channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant as StdInstant};
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Probes taking at least this long are considered slow
pub const DEFAULT_SLOW_PROBE: Duration = Duration::from_millis(300);

/// Slow devices are re-probed at most once every `duration * factor`
pub const DEFAULT_BACKOFF_FACTOR: u32 = 100;

/// Blocking availability check for one device
pub trait Prober: Send + Sync + 'static {
    /// Try to open and immediately close `name`
    fn probe(&self, name: &str, baud_rate: u32) -> Result<(), String>;
}

/// Probes OS serial devices with a raw open/close
#[derive(Debug, Default, Clone, Copy)]
pub struct SerialProber;

impl Prober for SerialProber {
    fn probe(&self, name: &str, baud_rate: u32) -> Result<(), String> {
        serialport::new(name, baud_rate)
            .timeout(Duration::from_secs(10))
            .open()
            .map(drop)
            .map_err(|e| e.to_string())
    }
}

/// What a probe found
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Available,
    Unavailable(String),
}

/// Result reported by a probe worker
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub name: String,
    pub outcome: ProbeOutcome,
    pub duration: Duration,
}

/// Back-off bookkeeping for one device
#[derive(Debug, Clone, Default)]
pub struct ProbeBackoff {
    last_duration: Duration,
    last_finished: Option<Instant>,
}

impl ProbeBackoff {
    /// Record a finished probe
    pub fn record(&mut self, duration: Duration, finished: Instant) {
        self.last_duration = duration;
        self.last_finished = Some(finished);
    }

    pub fn last_duration(&self) -> Duration {
        self.last_duration
    }

    /// Whether the device should be probed again at `now`
    pub fn is_due(&self, now: Instant, slow: Duration, factor: u32) -> bool {
        if self.last_duration < slow {
            return true;
        }
        match self.last_finished {
            Some(finished) => now >= finished + self.last_duration * factor,
            None => true,
        }
    }
}

struct ProbeWorker {
    requests: std_mpsc::Sender<()>,
    busy: Arc<AtomicBool>,
    _handle: JoinHandle<()>,
}

/// One blocking worker per device
pub struct ProbePool {
    prober: Arc<dyn Prober>,
    baud_rate: u32,
    workers: HashMap<String, ProbeWorker>,
    results: mpsc::UnboundedSender<ProbeResult>,
}

impl ProbePool {
    pub fn new(
        prober: Arc<dyn Prober>,
        baud_rate: u32,
        results: mpsc::UnboundedSender<ProbeResult>,
    ) -> Self {
        Self {
            prober,
            baud_rate,
            workers: HashMap::new(),
            results,
        }
    }

    /// Whether a probe for `name` is queued or running
    pub fn is_busy(&self, name: &str) -> bool {
        self.workers
            .get(name)
            .map(|w| w.busy.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Queue a probe of `name`. Returns false if one is already in flight.
    pub fn request(&mut self, name: &str) -> bool {
        if self.is_busy(name) {
            return false;
        }
        if !self.workers.contains_key(name) {
            match self.spawn_worker(name) {
                Ok(worker) => {
                    self.workers.insert(name.to_string(), worker);
                }
                Err(e) => {
                    tracing::error!("could not start probe worker for {}: {}", name, e);
                    return false;
                }
            }
        }
        let Some(worker) = self.workers.get(name) else {
            return false;
        };
        worker.busy.store(true, Ordering::SeqCst);
        if worker.requests.send(()).is_err() {
            // Worker thread is gone; drop it so the next request respawns it
            worker.busy.store(false, Ordering::SeqCst);
            self.workers.remove(name);
            return false;
        }
        true
    }

    fn spawn_worker(&self, name: &str) -> std::io::Result<ProbeWorker> {
        let (tx, rx) = std_mpsc::channel::<()>();
        let busy = Arc::new(AtomicBool::new(false));
        let prober = self.prober.clone();
        let results = self.results.clone();
        let device = name.to_string();
        let baud_rate = self.baud_rate;
        let worker_busy = busy.clone();

        let handle = thread::Builder::new()
            .name(format!("probe {}", name))
            .spawn(move || {
                while rx.recv().is_ok() {
                    let start = StdInstant::now();
                    let outcome = match prober.probe(&device, baud_rate) {
                        Ok(()) => ProbeOutcome::Available,
                        Err(reason) => ProbeOutcome::Unavailable(reason),
                    };
                    let result = ProbeResult {
                        name: device.clone(),
                        outcome,
                        duration: start.elapsed(),
                    };
                    let sent = results.send(result);
                    worker_busy.store(false, Ordering::SeqCst);
                    if sent.is_err() {
                        break;
                    }
                }
            })?;

        Ok(ProbeWorker {
            requests: tx,
            busy,
            _handle: handle,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedProber;

    impl Prober for FixedProber {
        fn probe(&self, name: &str, _baud_rate: u32) -> Result<(), String> {
            if name.ends_with("ok") {
                Ok(())
            } else {
                Err("no such device".to_string())
            }
        }
    }

    #[tokio::test]
    async fn test_pool_reports_results() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut pool = ProbePool::new(Arc::new(FixedProber), 57600, tx);

        assert!(pool.request("/dev/ok"));
        let result = rx.recv().await.unwrap();
        assert_eq!(result.name, "/dev/ok");
        assert_eq!(result.outcome, ProbeOutcome::Available);

        assert!(pool.request("/dev/missing"));
        let result = rx.recv().await.unwrap();
        assert!(matches!(result.outcome, ProbeOutcome::Unavailable(_)));
    }

    #[test]
    fn test_backoff() {
        let now = Instant::now();
        let mut backoff = ProbeBackoff::default();
        assert!(backoff.is_due(now, DEFAULT_SLOW_PROBE, DEFAULT_BACKOFF_FACTOR));

        backoff.record(Duration::from_millis(100), now);
        assert!(backoff.is_due(now, DEFAULT_SLOW_PROBE, DEFAULT_BACKOFF_FACTOR));

        // A 0.5s probe waits 50s before the next attempt
        backoff.record(Duration::from_millis(500), now);
        assert!(!backoff.is_due(
            now + Duration::from_secs(49),
            DEFAULT_SLOW_PROBE,
            DEFAULT_BACKOFF_FACTOR
        ));
        assert!(backoff.is_due(
            now + Duration::from_secs(50),
            DEFAULT_SLOW_PROBE,
            DEFAULT_BACKOFF_FACTOR
        ));
    }
}
