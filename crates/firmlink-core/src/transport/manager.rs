//! Transport lifecycle
//!
//! [`TransportManager`] owns the candidate device list and at most one open
//! port. It consumes probe results, picks the next usable candidate in
//! round-robin order, opens and closes ports, and tracks which ones have
//! misbehaved so they are skipped until explicitly cleared.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{sleep, Instant};
use tracing::Instrument;

use super::probe::{ProbeBackoff, ProbeOutcome, ProbePool, ProbeResult, Prober};
use super::serial::{list_ports, static_locations};
use super::{PortOpener, Transport, TransportError};
use crate::config::BridgeConfig;

/// Where a candidate is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Not probed yet
    Unknown,
    Available,
    Unavailable,
    Open,
    /// Was open, then closed by an error or on request
    Closed,
}

/// Read-only view of one candidate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateSnapshot {
    pub name: String,
    pub state: LinkState,
    pub had_error: bool,
    pub probed: bool,
}

/// Notifications about the transport layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The set of available device names changed
    AvailablePortsChanged(Vec<String>),
    Opened(String),
    Closed(String),
    /// The named port was flagged as misbehaving
    Errored(String),
}

/// Current port and whether it is healthy
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortStatus {
    pub port: Option<String>,
    pub healthy: bool,
}

struct Candidate {
    name: String,
    state: LinkState,
    had_error: bool,
    probed: bool,
    backoff: ProbeBackoff,
}

impl Candidate {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: LinkState::Unknown,
            had_error: false,
            probed: false,
            backoff: ProbeBackoff::default(),
        }
    }

    /// Available (or already open) and not flagged
    fn is_usable(&self) -> bool {
        matches!(self.state, LinkState::Available | LinkState::Open) && !self.had_error
    }

    fn snapshot(&self) -> CandidateSnapshot {
        CandidateSnapshot {
            name: self.name.clone(),
            state: self.state,
            had_error: self.had_error,
            probed: self.probed,
        }
    }
}

#[derive(Default)]
struct ManagerState {
    candidates: Vec<Candidate>,
    current: Option<String>,
    transport: Option<Arc<dyn Transport>>,
    available: Vec<String>,
}

impl ManagerState {
    fn candidate_mut(&mut self, name: &str) -> Option<&mut Candidate> {
        self.candidates.iter_mut().find(|c| c.name == name)
    }

    fn current_is_open(&self) -> bool {
        self.transport.as_ref().map(|t| t.is_open()).unwrap_or(false)
    }

    /// Round-robin pick of the next usable candidate
    fn pick_next(&self) -> Option<String> {
        let start = match &self.current {
            None => 0,
            Some(current) => self
                .candidates
                .iter()
                .position(|c| &c.name == current)
                .map(|i| i + 1)
                .unwrap_or(0),
        };
        let len = self.candidates.len();
        (0..len)
            .map(|offset| &self.candidates[(start + offset) % len])
            .find(|c| c.is_usable())
            .map(|c| c.name.clone())
    }

    fn available_names(&self) -> Vec<String> {
        self.candidates
            .iter()
            .filter(|c| matches!(c.state, LinkState::Available | LinkState::Open))
            .map(|c| c.name.clone())
            .collect()
    }
}

/// Probe pool plus the receiving end of its results
struct ProbeDriver {
    pool: ProbePool,
    results: mpsc::UnboundedReceiver<ProbeResult>,
}

/// Timing knobs taken from [`BridgeConfig`]
#[derive(Debug, Clone)]
struct Timing {
    baud_rate: u32,
    slow_probe: Duration,
    backoff_factor: u32,
    probe_cycle: Duration,
    reconnect_poll: Duration,
    supervisor_poll: Duration,
}

/// Discovers, opens and fails over between serial ports
pub struct TransportManager {
    timing: Timing,
    opener: Arc<dyn PortOpener>,
    state: Mutex<ManagerState>,
    probes: Mutex<ProbeDriver>,
    events: broadcast::Sender<TransportEvent>,
    status: watch::Sender<PortStatus>,
}

/// Device names worth trying: the user's choice first, then what the OS
/// reports, then the platform's usual names. Duplicates are dropped.
pub fn list_candidates(user_port: Option<&str>) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    let os_ports = list_ports().into_iter().map(|p| p.name);
    for name in user_port
        .map(str::to_string)
        .into_iter()
        .chain(os_ports)
        .chain(static_locations())
    {
        if !names.contains(&name) {
            names.push(name);
        }
    }
    names
}

impl TransportManager {
    /// Manager over [`list_candidates`] for the configured port
    pub fn new(
        config: &BridgeConfig,
        opener: Arc<dyn PortOpener>,
        prober: Arc<dyn Prober>,
    ) -> Result<Arc<Self>, TransportError> {
        let names = list_candidates(config.port_name.as_deref());
        Self::with_candidates(config, names, opener, prober)
    }

    /// Manager over an explicit candidate list
    pub fn with_candidates(
        config: &BridgeConfig,
        names: Vec<String>,
        opener: Arc<dyn PortOpener>,
        prober: Arc<dyn Prober>,
    ) -> Result<Arc<Self>, TransportError> {
        if names.is_empty() {
            return Err(TransportError::NoCandidates);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(64);
        let (status, _) = watch::channel(PortStatus::default());

        let mut state = ManagerState::default();
        for name in &names {
            if state.candidate_mut(name).is_none() {
                state.candidates.push(Candidate::new(name));
            }
        }

        tracing::debug!("transport candidates: {:?}", names);

        Ok(Arc::new(Self {
            timing: Timing {
                baud_rate: config.baud_rate,
                slow_probe: config.probe_slow_threshold(),
                backoff_factor: config.probe_backoff_factor,
                probe_cycle: config.probe_cycle(),
                reconnect_poll: config.reconnect_poll(),
                supervisor_poll: config.supervisor_poll(),
            },
            opener,
            state: Mutex::new(state),
            probes: Mutex::new(ProbeDriver {
                pool: ProbePool::new(prober, config.baud_rate, tx),
                results: rx,
            }),
            events,
            status,
        }))
    }

    fn lock(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: TransportEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn set_status(&self, port: Option<String>, healthy: bool) {
        self.status.send_replace(PortStatus { port, healthy });
    }

    /// Subscribe to transport events
    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    /// Watch the current port and its health
    pub fn status(&self) -> watch::Receiver<PortStatus> {
        self.status.subscribe()
    }

    /// Flag the current port healthy or not without closing it
    pub fn report_health(&self, healthy: bool) {
        let current = self.lock().current.clone();
        self.set_status(current, healthy);
    }

    pub fn candidates(&self) -> Vec<CandidateSnapshot> {
        self.lock().candidates.iter().map(Candidate::snapshot).collect()
    }

    /// Name of the current port, open or not
    pub fn current_name(&self) -> Option<String> {
        self.lock().current.clone()
    }

    /// The open transport, if the current port is still usable
    pub fn current_transport(&self) -> Option<Arc<dyn Transport>> {
        let state = self.lock();
        state.transport.clone().filter(|t| t.is_open())
    }

    /// Whether the current port is open. Notices ports that died underneath
    /// and moves them to `Closed`.
    pub fn is_current_open(&self) -> bool {
        let dead = {
            let mut state = self.lock();
            if state.transport.is_some() && !state.current_is_open() {
                state.transport = None;
                let name = state.current.clone();
                if let Some(name) = &name {
                    if let Some(c) = state.candidate_mut(name) {
                        c.state = LinkState::Closed;
                    }
                }
                name
            } else {
                None
            }
        };
        if let Some(name) = dead {
            tracing::warn!("port {} went away", name);
            self.set_status(Some(name.clone()), false);
            self.emit(TransportEvent::Closed(name));
            return false;
        }
        self.lock().current_is_open()
    }

    /// Clear the error flag on a candidate
    pub fn clear_error(&self, name: &str) {
        if let Some(c) = self.lock().candidate_mut(name) {
            c.had_error = false;
        }
    }

    /// Flag `name` as misbehaving and close it if it is the open port
    pub fn mark_error(&self, name: &str) {
        let close_it = {
            let mut state = self.lock();
            match state.candidate_mut(name) {
                Some(c) => c.had_error = true,
                None => return,
            }
            state.current.as_deref() == Some(name) && state.transport.is_some()
        };
        tracing::warn!("port {} marked as errored", name);
        if close_it {
            self.close();
        }
        self.set_status(Some(name.to_string()), false);
        self.emit(TransportEvent::Errored(name.to_string()));
    }

    /// Close the current port
    pub fn close(&self) {
        let closed = {
            let mut state = self.lock();
            let transport = state.transport.take();
            let name = state.current.clone();
            if let (Some(t), Some(name)) = (transport, name) {
                t.close();
                if let Some(c) = state.candidate_mut(&name) {
                    c.state = LinkState::Closed;
                }
                Some(name)
            } else {
                None
            }
        };
        if let Some(name) = closed {
            tracing::info!("closed {}", name);
            self.set_status(Some(name.clone()), false);
            self.emit(TransportEvent::Closed(name));
        }
    }

    /// Fold one probe result into the candidate table.
    ///
    /// Open ports are never probed, so a result for one was started before
    /// the open and is dropped. A port that really went away is noticed by
    /// [`Self::is_current_open`].
    pub fn apply_probe_result(&self, result: ProbeResult) {
        let changed = {
            let mut state = self.lock();
            let Some(c) = state.candidate_mut(&result.name) else {
                return;
            };
            c.probed = true;
            if c.state == LinkState::Open {
                tracing::trace!("dropping stale probe result for open port {}", result.name);
                return;
            }
            match &result.outcome {
                ProbeOutcome::Available => {
                    // Good ports may take a while to open; no penalty
                    c.backoff.record(Duration::ZERO, Instant::now());
                    c.state = LinkState::Available;
                }
                ProbeOutcome::Unavailable(reason) => {
                    tracing::trace!("{} unavailable: {}", result.name, reason);
                    c.backoff.record(result.duration, Instant::now());
                    c.state = LinkState::Unavailable;
                }
            }
            let available = state.available_names();
            if available != state.available {
                state.available = available.clone();
                Some(available)
            } else {
                None
            }
        };
        if let Some(available) = changed {
            tracing::debug!("available ports: {:?}", available);
            self.emit(TransportEvent::AvailablePortsChanged(available));
        }
    }

    /// Apply every probe result received so far
    pub fn drain_probe_results(&self) {
        let results: Vec<ProbeResult> = {
            let mut probes = self.probes.lock().unwrap_or_else(PoisonError::into_inner);
            std::iter::from_fn(|| probes.results.try_recv().ok()).collect()
        };
        for result in results {
            self.apply_probe_result(result);
        }
    }

    fn request_probe(&self, name: &str) {
        let mut probes = self.probes.lock().unwrap_or_else(PoisonError::into_inner);
        probes.pool.request(name);
    }

    /// Queue probes for every closed candidate whose back-off has expired
    pub fn probe_tick(&self) {
        self.drain_probe_results();
        self.is_current_open();

        let now = Instant::now();
        let due: Vec<String> = {
            let state = self.lock();
            state
                .candidates
                .iter()
                .filter(|c| c.state != LinkState::Open)
                .filter(|c| {
                    c.backoff
                        .is_due(now, self.timing.slow_probe, self.timing.backoff_factor)
                })
                .map(|c| c.name.clone())
                .collect()
        };
        for name in due {
            self.request_probe(&name);
        }
    }

    /// Probe candidates forever, once per cycle
    pub async fn run_probe_cycle(self: Arc<Self>) {
        loop {
            self.probe_tick();
            sleep(self.timing.probe_cycle).await;
        }
    }

    /// Open `name`, switching away from the current port if needed.
    ///
    /// Unknown names are added as new candidates. Returns `Ok(false)` when the
    /// candidate is unavailable or flagged; the caller has to try again.
    pub async fn open_named(&self, name: &str, clear_error: bool) -> Result<bool, TransportError> {
        {
            let mut state = self.lock();
            if state.candidate_mut(name).is_none() {
                tracing::info!("adding candidate {}", name);
                state.candidates.push(Candidate::new(name));
            }
        }

        // Wait for the first probe
        loop {
            self.drain_probe_results();
            let probed = self
                .lock()
                .candidate_mut(name)
                .map(|c| c.probed)
                .unwrap_or(false);
            if probed {
                break;
            }
            self.request_probe(name);
            sleep(self.timing.reconnect_poll).await;
        }

        enum Action {
            Open,
            Switch,
            Nothing,
        }

        let action = {
            let mut state = self.lock();
            let current_open = state.current_is_open();
            let current = state.current.clone();
            let Some(c) = state.candidate_mut(name) else {
                return Ok(false);
            };
            if clear_error {
                c.had_error = false;
            }
            if !c.is_usable() {
                tracing::debug!("{} is not usable (state {:?}, error {})", name, c.state, c.had_error);
                return Ok(false);
            }
            match current {
                None => Action::Open,
                Some(_) if !current_open => Action::Open,
                Some(current) if current != name => Action::Switch,
                Some(_) => Action::Nothing,
            }
        };

        match action {
            Action::Nothing => Ok(true),
            Action::Switch => {
                self.close();
                self.open_port(name).await.map(|_| true)
            }
            Action::Open => self.open_port(name).await.map(|_| true),
        }
    }

    async fn open_port(&self, name: &str) -> Result<(), TransportError> {
        let span = tracing::info_span!("port", name = %name);
        let result = self
            .opener
            .open(name, self.timing.baud_rate)
            .instrument(span)
            .await;

        match result {
            Ok(transport) => {
                {
                    let mut state = self.lock();
                    if let Some(old) = state.transport.replace(transport) {
                        old.close();
                    }
                    state.current = Some(name.to_string());
                    if let Some(c) = state.candidate_mut(name) {
                        c.state = LinkState::Open;
                    }
                }
                tracing::info!("opened {}", name);
                self.set_status(Some(name.to_string()), true);
                self.emit(TransportEvent::Opened(name.to_string()));
                Ok(())
            }
            Err(e) => {
                tracing::warn!("failed to open {}: {}", name, e);
                let mut state = self.lock();
                state.current = Some(name.to_string());
                if let Some(c) = state.candidate_mut(name) {
                    c.state = LinkState::Unavailable;
                }
                Err(e)
            }
        }
    }

    /// Wait until some candidate is usable and return its name. Starts
    /// scanning just after the current port and wraps around.
    pub async fn next_available(&self) -> String {
        let mut announced = false;
        loop {
            self.drain_probe_results();
            if let Some(name) = self.lock().pick_next() {
                return name;
            }
            if !announced {
                tracing::info!("no available ports; waiting");
                announced = true;
            }
            sleep(self.timing.reconnect_poll).await;
        }
    }

    /// Reconnection supervisor; never returns
    pub async fn keep_trying_to_connect(self: Arc<Self>) {
        let mut announced = false;
        loop {
            if self.is_current_open() {
                if !announced {
                    if let Some(name) = self.current_name() {
                        tracing::info!("port {} is open", name);
                    }
                    announced = true;
                }
            } else {
                announced = false;
                let name = self.next_available().await;
                tracing::debug!("next available port is {}", name);
                if let Err(e) = self.open_named(&name, false).await {
                    tracing::warn!("could not open {}: {}", name, e);
                }
            }
            sleep(self.timing.supervisor_poll).await;
        }
    }
}
