//! Bridge wiring
//!
//! Connects the transport manager to the protocol engine and runs the
//! long-lived tasks: probing, reconnection, dispatching, flushing, keepalive
//! and callbacks. Transport events drive the engine (an opened port gets a
//! discovery handshake, a closed one is released) and engine faults flow back
//! to the manager, which flags the port and lets the supervisor move on.

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::config::BridgeConfig;
use crate::engine::{Engine, EngineEvent};
use crate::protocol::ProtocolError;
use crate::scheduler;
use crate::transport::{
    PortOpener, PortStatus, Prober, SerialOpener, SerialProber, TransportError, TransportEvent,
    TransportManager,
};

/// Errors surfaced by the bridge itself
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("No candidate serial port locations")]
    NoCandidates,

    #[error("Failed to load configuration: {0}")]
    Config(#[from] std::io::Error),

    #[error(transparent)]
    Transport(TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl From<TransportError> for BridgeError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::NoCandidates => BridgeError::NoCandidates,
            other => BridgeError::Transport(other),
        }
    }
}

/// A running Firmata bridge
pub struct Bridge {
    manager: Arc<TransportManager>,
    engine: Arc<Engine>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Bridge {
    /// Bridge over the OS serial ports
    pub fn new(config: BridgeConfig) -> Result<Self, BridgeError> {
        Self::with_io(config, Arc::new(SerialOpener), Arc::new(SerialProber))
    }

    /// Bridge configured from a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, BridgeError> {
        Self::new(BridgeConfig::from_file(path)?)
    }

    /// Bridge with custom port I/O
    pub fn with_io(
        config: BridgeConfig,
        opener: Arc<dyn PortOpener>,
        prober: Arc<dyn Prober>,
    ) -> Result<Self, BridgeError> {
        let manager = TransportManager::new(&config, opener, prober)?;
        Ok(Self::with_parts(&config, manager))
    }

    /// Bridge around an existing manager
    pub fn with_parts(config: &BridgeConfig, manager: Arc<TransportManager>) -> Self {
        Self {
            manager,
            engine: Engine::new(config.engine()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn manager(&self) -> &Arc<TransportManager> {
        &self.manager
    }

    /// Current port name and health
    pub fn status(&self) -> watch::Receiver<PortStatus> {
        self.manager.status()
    }

    /// Spawn every background task. Calling it twice has no effect.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        if !tasks.is_empty() {
            return;
        }

        // Subscribe before anything can happen
        let transport_events = self.manager.subscribe();
        let engine_events = self.engine.subscribe();

        if let Some(runner) = self.engine.take_callback_runner() {
            tasks.push(tokio::spawn(runner.run()));
        }
        tasks.push(tokio::spawn(pump_transport_events(
            transport_events,
            self.manager.clone(),
            self.engine.clone(),
        )));
        tasks.push(tokio::spawn(pump_engine_events(
            engine_events,
            self.manager.clone(),
        )));
        tasks.push(tokio::spawn(self.manager.clone().run_probe_cycle()));
        tasks.push(tokio::spawn(
            self.manager
                .clone()
                .keep_trying_to_connect()
                .instrument(tracing::info_span!("supervisor")),
        ));
        tasks.push(tokio::spawn(scheduler::run(self.engine.clone())));
        tasks.push(tokio::spawn(self.engine.clone().run_keepalive()));

        tracing::info!("bridge started");
    }

    /// Switch to `name`, clearing its error flag. Returns false when the port
    /// is unavailable.
    pub async fn select_port(&self, name: &str) -> Result<bool, BridgeError> {
        Ok(self.manager.open_named(name, true).await?)
    }

    /// Stop all tasks and close the port
    pub fn shutdown(&self) {
        let tasks: Vec<JoinHandle<()>> = std::mem::take(
            &mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for task in tasks {
            task.abort();
        }
        self.engine.remove_port();
        self.manager.close();
        tracing::info!("bridge stopped");
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        let tasks = self.tasks.get_mut().unwrap_or_else(PoisonError::into_inner);
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

async fn pump_transport_events(
    mut events: broadcast::Receiver<TransportEvent>,
    manager: Arc<TransportManager>,
    engine: Arc<Engine>,
) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!("missed {} transport events", n);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };

        match event {
            TransportEvent::Opened(name) => {
                let Some(transport) = manager.current_transport() else {
                    continue;
                };
                if transport.name() != name {
                    continue;
                }
                let engine = engine.clone();
                tokio::spawn(async move {
                    if let Err(e) = engine.assign_port(transport).await {
                        tracing::debug!("discovery on {} ended: {}", name, e);
                    }
                });
            }
            TransportEvent::Closed(name) => {
                if engine.port_name().as_deref() == Some(name.as_str()) {
                    engine.remove_port();
                }
            }
            TransportEvent::Errored(name) => tracing::debug!("{} flagged", name),
            TransportEvent::AvailablePortsChanged(names) => {
                tracing::debug!("available ports: {:?}", names)
            }
        }
    }
}

async fn pump_engine_events(
    mut events: broadcast::Receiver<EngineEvent>,
    manager: Arc<TransportManager>,
) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!("missed {} engine events", n);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };

        match event {
            EngineEvent::Ready { .. } => manager.report_health(true),
            EngineEvent::PortFaulted { port, .. } => manager.mark_error(&port),
            // Left open so the mismatch stays visible
            EngineEvent::Inconsistent { .. } => manager.report_health(false),
            EngineEvent::Removed { .. } => {}
        }
    }
}
