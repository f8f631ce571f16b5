//! Firmata protocol engine
//!
//! Owns the board model for the port the transport manager currently has
//! open. [`Engine::assign_port`] runs the discovery handshake and starts the
//! inbound dispatcher; the public operations either mutate the model (sent on
//! the next scheduler flush) or write a command straight away.
//!
//! Port problems never stop the engine. Query timeouts and write failures
//! are published as [`EngineEvent::PortFaulted`] so the owner can flag the
//! port and let the reconnection supervisor move on.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval, sleep, Instant};
use tracing::Instrument;

use crate::board::devices::I2cReply;
use crate::board::{
    keepalive, Board, I2cReadMode, LatchData, LatchEvent, LatchKey, PinCapabilities, PinReport,
    SonarAdd, SonarReading,
};
use crate::callback::{Callback, CallbackQueue, CallbackRunner, Pending};
use crate::config::EngineConfig;
use crate::protocol::codec::{from_7bit, wrap_sysex, MAX_U32_GROUPS};
use crate::protocol::commands::*;
use crate::protocol::message::{parse_encoder, read_message};
use crate::protocol::{
    EncoderReport, Message, PinMode, PixyBlock, ProtocolError, SysexBuilder, SysexMessage,
    Threshold,
};
use crate::transport::{Transport, TransportError};

/// How often a pending query checks for its reply
const REPLY_POLL: Duration = Duration::from_millis(10);

/// Sonar distances above this are clamped (centimetres)
pub const MAX_SONAR_DISTANCE: u16 = 350;

pub const DEFAULT_PING_INTERVAL_MS: u8 = 50;

/// Firmware name and version from REPORT_FIRMWARE
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareInfo {
    pub major: u8,
    pub minor: u8,
    pub name: String,
}

/// Decoded PIN_STATE_RESPONSE
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinStateReport {
    pub pin: u8,
    pub mode: Option<PinMode>,
    pub state: u32,
}

impl PinStateReport {
    fn parse(payload: &[u8]) -> Result<Self, ProtocolError> {
        match payload {
            [_, _, state @ ..] if state.len() > MAX_U32_GROUPS => Err(ProtocolError::Malformed(
                format!("pin state of {} groups", state.len()),
            )),
            [pin, mode, state @ ..] => Ok(Self {
                pin: *pin,
                mode: PinMode::from_byte(*mode),
                state: from_7bit(state),
            }),
            _ => Err(ProtocolError::Malformed("short pin state response".to_string())),
        }
    }
}

/// Lifecycle notifications for the owner of the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// Discovery finished and the board model is in place
    Ready {
        port: String,
        pins: usize,
        ports: usize,
        analog: usize,
    },
    /// The port stopped answering or failed a write
    PortFaulted { port: String, reason: String },
    /// Discovery reports contradict each other; retrying will not help
    Inconsistent { port: String, reason: String },
    /// The engine let go of the port
    Removed { port: String },
}

/// Transient query replies; `None` until a reply arrives
#[derive(Debug, Default)]
struct Replies {
    firmware: Option<FirmwareInfo>,
    protocol_version: Option<(u8, u8)>,
    capability: Option<Vec<u8>>,
    analog_map: Option<Vec<u8>>,
    pin_state: Option<Vec<u8>>,
}

struct Link {
    transport: Arc<dyn Transport>,
    generation: u64,
    faulted: bool,
}

#[derive(Default)]
struct EngineState {
    link: Option<Link>,
    generation: u64,
    board: Option<Board>,
    replies: Replies,
    firmware: Option<FirmwareInfo>,
    analog_map: Vec<u8>,
}

impl EngineState {
    fn is_current(&self, generation: u64) -> bool {
        self.link.as_ref().map(|l| l.generation) == Some(generation)
    }

    /// Fold one inbound message into the model
    fn apply(&mut self, message: Message) -> Pending {
        match message {
            Message::ProtocolVersion { major, minor } => {
                self.replies.protocol_version = Some((major, minor));
            }
            Message::Analog { channel, value } => {
                if let Some(board) = self.board.as_mut() {
                    return board.apply_analog(channel as usize, value);
                }
            }
            Message::Digital { port, value } => {
                if let Some(board) = self.board.as_mut() {
                    return board.apply_digital(port as usize, value);
                }
            }
            Message::Sysex(sysex) => return self.apply_sysex(sysex),
        }
        Pending::new()
    }

    fn apply_sysex(&mut self, sysex: SysexMessage) -> Pending {
        let mut pending = Pending::new();
        match sysex {
            SysexMessage::Firmware { major, minor, name } => {
                self.replies.firmware = Some(FirmwareInfo { major, minor, name });
            }
            SysexMessage::CapabilityResponse(bytes) => self.replies.capability = Some(bytes),
            SysexMessage::AnalogMappingResponse(bytes) => self.replies.analog_map = Some(bytes),
            SysexMessage::PinStateResponse(bytes) => self.replies.pin_state = Some(bytes),
            SysexMessage::StringData(text) => tracing::info!("board says: {}", text),
            SysexMessage::I2cReply { address, words } => {
                if let Some(board) = self.board.as_mut() {
                    if let Some((cb, reply)) = board.i2c.apply_reply(address, words) {
                        pending.push(cb.call(reply));
                    }
                }
            }
            SysexMessage::SonarData { pin, distance } => {
                if let Some(board) = self.board.as_mut() {
                    if let Some((cb, reading)) = board.sonar.apply(pin, distance) {
                        pending.push(cb.call(reading));
                    }
                }
            }
            SysexMessage::EncoderData(payload) => {
                if let Some(board) = self.board.as_mut() {
                    match parse_encoder(&payload, board.encoders.is_hall()) {
                        Ok(report) => {
                            if let Some((cb, report)) = board.encoders.apply(report) {
                                pending.push(cb.call(report));
                            }
                        }
                        Err(e) => tracing::warn!("dropping encoder data: {}", e),
                    }
                }
            }
            SysexMessage::PixyData(blocks) => match self.board.as_mut() {
                Some(board) if board.pin_count() > PIN_PIXY_MOSI as usize => {
                    if let Some((cb, blocks)) = board.pixy.apply(blocks) {
                        pending.push(cb.call(blocks));
                    }
                }
                _ => tracing::debug!("pixy data before discovery finished"),
            },
            SysexMessage::Unknown { command, payload } => {
                tracing::trace!("unhandled sysex {:#04x} ({} bytes)", command, payload.len());
            }
        }
        pending
    }
}

/// The protocol engine
pub struct Engine {
    config: EngineConfig,
    state: Mutex<EngineState>,
    callbacks: CallbackQueue,
    runner: Mutex<Option<CallbackRunner>>,
    events: broadcast::Sender<EngineEvent>,
    /// Held from taking pending output until it is written
    write_order: tokio::sync::Mutex<()>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Arc<Self> {
        let (callbacks, runner) = CallbackQueue::new();
        let (events, _) = broadcast::channel(32);
        Arc::new(Self {
            config,
            state: Mutex::new(EngineState::default()),
            callbacks,
            runner: Mutex::new(Some(runner)),
            events,
            write_order: tokio::sync::Mutex::new(()),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }

    /// Subscribe to lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// The callback runner; whoever takes it must drive it
    pub fn take_callback_runner(&self) -> Option<CallbackRunner> {
        self.runner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Whether discovery has completed on the current port
    pub fn is_ready(&self) -> bool {
        self.lock().board.is_some()
    }

    /// Name of the port the engine is bound to
    pub fn port_name(&self) -> Option<String> {
        self.lock()
            .link
            .as_ref()
            .map(|l| l.transport.name().to_string())
    }

    fn with_board<T>(
        &self,
        f: impl FnOnce(&mut Board) -> Result<T, ProtocolError>,
    ) -> Result<T, ProtocolError> {
        let mut state = self.lock();
        let board = state.board.as_mut().ok_or(ProtocolError::NotConnected)?;
        f(board)
    }

    /// Report a port problem once per assignment
    fn fault(&self, generation: u64, reason: String) {
        let port = {
            let mut state = self.lock();
            match state.link.as_mut() {
                Some(link) if link.generation == generation && !link.faulted => {
                    link.faulted = true;
                    link.transport.name().to_string()
                }
                _ => return,
            }
        };
        tracing::warn!("port {} faulted: {}", port, reason);
        self.emit(EngineEvent::PortFaulted { port, reason });
    }

    // ---- Port lifecycle ----

    /// Take over a freshly opened port and run discovery on it.
    ///
    /// Waits out the board reset, then asks for the firmware version, the
    /// analog mapping and the capability report, each within its ceiling.
    /// The board model only exists once all three have arrived and agree.
    pub async fn assign_port(
        self: &Arc<Self>,
        transport: Arc<dyn Transport>,
    ) -> Result<(), ProtocolError> {
        let port = transport.name().to_string();
        let span = tracing::info_span!("port", name = %port);

        async move {
            let generation = {
                let mut state = self.lock();
                state.generation += 1;
                let generation = state.generation;
                state.link = Some(Link {
                    transport: transport.clone(),
                    generation,
                    faulted: false,
                });
                state.board = None;
                state.replies = Replies::default();
                state.firmware = None;
                state.analog_map.clear();
                generation
            };

            tokio::spawn(
                self.clone()
                    .dispatch(transport, generation)
                    .instrument(tracing::Span::current()),
            );

            match self.discover(generation).await {
                Ok((pins, ports, analog)) => {
                    tracing::info!("{} pins, {} ports, {} analog channels", pins, ports, analog);
                    self.emit(EngineEvent::Ready {
                        port,
                        pins,
                        ports,
                        analog,
                    });
                    Ok(())
                }
                Err(e @ ProtocolError::CapabilityMismatch { .. }) => {
                    tracing::error!("discovery failed: {}", e);
                    self.emit(EngineEvent::Inconsistent {
                        port,
                        reason: e.to_string(),
                    });
                    Err(e)
                }
                Err(e) => {
                    if e.is_port_fault() {
                        self.fault(generation, e.to_string());
                    }
                    Err(e)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn discover(&self, generation: u64) -> Result<(usize, usize, usize), ProtocolError> {
        sleep(self.config.reset_delay).await;
        if !self.lock().is_current(generation) {
            return Err(ProtocolError::NotConnected);
        }

        let firmware = self
            .query(
                generation,
                wrap_sysex(REPORT_FIRMWARE, &[]),
                "firmware version",
                Some(self.config.firmware_timeout),
                |r| r.firmware.take(),
            )
            .await?;
        tracing::info!("firmware {} {}.{}", firmware.name, firmware.major, firmware.minor);

        let analog_map = self
            .query(
                generation,
                wrap_sysex(ANALOG_MAPPING_QUERY, &[]),
                "analog mapping",
                Some(self.config.analog_map_timeout),
                |r| r.analog_map.take(),
            )
            .await?;

        let capability = self
            .query(
                generation,
                wrap_sysex(CAPABILITY_QUERY, &[]),
                "capability report",
                self.config.capability_timeout,
                |r| r.capability.take(),
            )
            .await?;

        let caps = crate::board::parse_capabilities(&capability, &analog_map)?;
        tracing::debug!("capabilities:\n{}", crate::board::format_report(&caps));
        let board = Board::new(caps, Instant::now());
        let counts = (board.pin_count(), board.port_count(), board.analog_count());

        let mut state = self.lock();
        if !state.is_current(generation) {
            return Err(ProtocolError::NotConnected);
        }
        state.board = Some(board);
        state.firmware = Some(firmware);
        state.analog_map = analog_map;
        Ok(counts)
    }

    /// Forget the current port and its board model
    pub fn remove_port(&self) {
        let port = {
            let mut state = self.lock();
            state.board = None;
            state.replies = Replies::default();
            state.link.take().map(|l| l.transport.name().to_string())
        };
        if let Some(port) = port {
            tracing::info!("released {}", port);
            self.emit(EngineEvent::Removed { port });
        }
    }

    /// Read and apply messages until the port goes away or is replaced
    async fn dispatch(self: Arc<Self>, transport: Arc<dyn Transport>, generation: u64) {
        tracing::debug!("dispatcher started");
        while self.lock().is_current(generation) {
            match read_message(transport.as_ref()).await {
                Ok(Some(message)) => self.handle_message(generation, message),
                Ok(None) => {}
                Err(ProtocolError::Transport(TransportError::Closed(_))) => break,
                Err(e) => {
                    self.fault(generation, e.to_string());
                    break;
                }
            }
        }
        tracing::debug!("dispatcher stopped");
    }

    fn handle_message(&self, generation: u64, message: Message) {
        let pending = {
            let mut state = self.lock();
            if !state.is_current(generation) {
                return;
            }
            state.apply(message)
        };
        self.callbacks.push_all(pending);
    }

    // ---- Output ----

    /// Write `bytes` on the current port, preceded by any pending model
    /// changes so the wire order matches the call order.
    async fn send(&self, generation: Option<u64>, bytes: Vec<u8>) -> Result<(), ProtocolError> {
        let _order = self.write_order.lock().await;
        let (transport, generation, out) = {
            let mut state = self.lock();
            let link = state.link.as_ref().ok_or(ProtocolError::NotConnected)?;
            if generation.is_some_and(|g| g != link.generation) {
                return Err(ProtocolError::NotConnected);
            }
            let transport = link.transport.clone();
            let generation = link.generation;
            let mut out = state
                .board
                .as_mut()
                .map(|b| b.generate_output(Instant::now()))
                .unwrap_or_default();
            out.extend(bytes);
            (transport, generation, out)
        };
        if out.is_empty() {
            return Ok(());
        }
        transport.write(&out).await.map_err(|e| {
            self.fault(generation, e.to_string());
            ProtocolError::from(e)
        })
    }

    /// Emit every pending model change. Returns the number of bytes written.
    pub async fn flush(&self) -> Result<usize, ProtocolError> {
        let _order = self.write_order.lock().await;
        let (transport, generation, out) = {
            let mut state = self.lock();
            let Some(link) = state.link.as_ref() else {
                return Ok(0);
            };
            let transport = link.transport.clone();
            let generation = link.generation;
            let Some(board) = state.board.as_mut() else {
                return Ok(0);
            };
            (transport, generation, board.generate_output(Instant::now()))
        };
        if out.is_empty() {
            return Ok(0);
        }
        transport.write(&out).await.map_err(|e| {
            self.fault(generation, e.to_string());
            ProtocolError::from(e)
        })?;
        Ok(out.len())
    }

    /// Send a request and wait for the reply picked out by `take`
    async fn query<T>(
        &self,
        generation: u64,
        request: Vec<u8>,
        name: &'static str,
        ceiling: Option<Duration>,
        take: impl Fn(&mut Replies) -> Option<T>,
    ) -> Result<T, ProtocolError> {
        // Drop any stale reply
        take(&mut self.lock().replies);
        self.send(Some(generation), request).await?;

        let started = Instant::now();
        loop {
            {
                let mut state = self.lock();
                if !state.is_current(generation) {
                    return Err(ProtocolError::NotConnected);
                }
                if let Some(reply) = take(&mut state.replies) {
                    return Ok(reply);
                }
            }
            if ceiling.is_some_and(|c| started.elapsed() >= c) {
                tracing::warn!("no {} within {:?}", name, ceiling);
                return Err(ProtocolError::Timeout { query: name });
            }
            sleep(REPLY_POLL).await;
        }
    }

    fn current_generation(&self) -> Result<u64, ProtocolError> {
        self.lock()
            .link
            .as_ref()
            .map(|l| l.generation)
            .ok_or(ProtocolError::NotConnected)
    }

    /// Query with the configured ceiling; a timeout faults the port
    async fn query_current<T>(
        &self,
        request: Vec<u8>,
        name: &'static str,
        take: impl Fn(&mut Replies) -> Option<T>,
    ) -> Result<T, ProtocolError> {
        let generation = self.current_generation()?;
        let result = self
            .query(generation, request, name, Some(self.config.query_timeout), take)
            .await;
        if let Err(e @ ProtocolError::Timeout { .. }) = &result {
            self.fault(generation, e.to_string());
        }
        result
    }

    /// Keepalive ticker; runs until the task is dropped
    pub async fn run_keepalive(self: Arc<Self>) {
        let mut ticker = interval(keepalive::TICK);
        loop {
            ticker.tick().await;
            if let Some(board) = self.lock().board.as_mut() {
                board.keepalive.tick(Instant::now());
            }
        }
    }

    // ---- Digital and analog I/O ----

    /// Last reported level of a digital pin
    pub fn digital_read(&self, pin: usize) -> Result<i32, ProtocolError> {
        self.with_board(|b| Ok(b.pin(pin)?.reported()))
    }

    /// Last reported value of an analog channel
    pub fn analog_read(&self, channel: usize) -> Result<i32, ProtocolError> {
        self.with_board(|b| {
            let pin = b.analog_pin(channel)?;
            Ok(b.pin(pin)?.reported())
        })
    }

    /// Set an OUTPUT pin, or toggle the pull-up of an INPUT pin
    pub fn digital_write(&self, pin: usize, value: u32) -> Result<(), ProtocolError> {
        self.with_board(|b| {
            b.pin_mut(pin)?.digital_write(value, true);
            Ok(())
        })
    }

    /// Set an OUTPUT pin; INPUT pins are left alone
    pub fn digital_pin_write(&self, pin: usize, value: u32) -> Result<(), ProtocolError> {
        self.with_board(|b| {
            b.pin_mut(pin)?.digital_write(value, false);
            Ok(())
        })
    }

    /// Write all 8 pins of a port; bit i goes to pin i
    pub fn digital_port_write(&self, port: usize, value: u8) -> Result<(), ProtocolError> {
        self.with_board(|b| {
            b.port_mut(port)?.digital_write(value);
            Ok(())
        })
    }

    /// PWM duty cycle or servo angle
    pub fn analog_write(&self, pin: usize, value: u32) -> Result<(), ProtocolError> {
        self.with_board(|b| {
            b.pin_mut(pin)?.analog_write(value);
            Ok(())
        })
    }

    /// Change a pin mode. `pin` is the digital pin number, also for analog
    /// inputs. The callback receives every report for the pin.
    pub fn set_pin_mode(
        &self,
        pin: usize,
        mode: PinMode,
        callback: Option<Callback<PinReport>>,
    ) -> Result<(), ProtocolError> {
        self.with_board(|b| {
            b.set_pin_mode(pin, mode)?;
            if callback.is_some() {
                b.pin_mut(pin)?.set_callback(callback);
            }
            Ok(())
        })
    }

    pub fn servo_config(&self, pin: usize, min_pulse: u16, max_pulse: u16) -> Result<(), ProtocolError> {
        if min_pulse >= max_pulse {
            return Err(ProtocolError::InvalidParameter(format!(
                "servo pulse range {}..{} is empty",
                min_pulse, max_pulse
            )));
        }
        self.with_board(|b| {
            let p = b.pin_mut(pin)?;
            if !p.capabilities().accepts(PinMode::Servo) {
                return Err(ProtocolError::UnsupportedMode {
                    pin,
                    mode: PinMode::Servo,
                });
            }
            p.configure_servo(min_pulse, max_pulse);
            Ok(())
        })
    }

    pub fn enable_analog_reporting(&self, channel: usize) -> Result<(), ProtocolError> {
        self.with_board(|b| {
            b.analog_pin_mut(channel)?.enable_analog_reporting();
            Ok(())
        })
    }

    pub fn disable_analog_reporting(&self, channel: usize) -> Result<(), ProtocolError> {
        self.with_board(|b| {
            b.analog_pin_mut(channel)?.disable_analog_reporting();
            Ok(())
        })
    }

    /// Reporting is per port; this affects all pins sharing `pin`'s port
    pub fn enable_digital_reporting(&self, pin: usize) -> Result<(), ProtocolError> {
        self.with_board(|b| {
            b.port_of_pin_mut(pin)?.enable_digital_reporting();
            Ok(())
        })
    }

    pub fn disable_digital_reporting(&self, pin: usize) -> Result<(), ProtocolError> {
        self.with_board(|b| {
            b.port_of_pin_mut(pin)?.disable_digital_reporting();
            Ok(())
        })
    }

    /// Ask for a pin state report on the next flush
    pub fn query_pin_state(&self, pin: usize) -> Result<(), ProtocolError> {
        self.with_board(|b| {
            b.pin_mut(pin)?.query_state();
            Ok(())
        })
    }

    /// Extended analog write with a 3-group value
    pub async fn extended_analog(&self, pin: u8, value: u32) -> Result<(), ProtocolError> {
        self.with_board(|b| b.pin(pin as usize).map(drop))?;
        let msg = SysexBuilder::new(EXTENDED_ANALOG)
            .byte(pin)
            .seven_bit(value, 3)
            .build();
        self.send(None, msg).await
    }

    /// Sampling interval in milliseconds
    pub async fn set_sampling_interval(&self, interval_ms: u16) -> Result<(), ProtocolError> {
        let msg = SysexBuilder::new(SAMPLING_INTERVAL)
            .seven_bit(interval_ms as u32, 2)
            .build();
        self.send(None, msg).await
    }

    pub async fn send_reset(&self) -> Result<(), ProtocolError> {
        self.send(None, vec![SYSTEM_RESET]).await
    }

    // ---- Queries ----

    /// Firmware reported during discovery
    pub async fn get_firmware_version(&self) -> Result<FirmwareInfo, ProtocolError> {
        if let Some(firmware) = self.lock().firmware.clone() {
            return Ok(firmware);
        }
        let firmware = self
            .query_current(wrap_sysex(REPORT_FIRMWARE, &[]), "firmware version", |r| {
                r.firmware.take()
            })
            .await?;
        self.lock().firmware = Some(firmware.clone());
        Ok(firmware)
    }

    pub async fn get_protocol_version(&self) -> Result<(u8, u8), ProtocolError> {
        self.query_current(vec![REPORT_VERSION], "protocol version", |r| {
            r.protocol_version.take()
        })
        .await
    }

    pub async fn get_pin_state(&self, pin: u8) -> Result<PinStateReport, ProtocolError> {
        self.with_board(|b| b.pin(pin as usize).map(drop))?;
        let msg = SysexBuilder::new(PIN_STATE_QUERY).byte(pin).build();
        let payload = self
            .query_current(msg, "pin state", |r| r.pin_state.take())
            .await?;
        PinStateReport::parse(&payload)
    }

    /// Capabilities found during discovery
    pub fn capability_report(&self) -> Result<Vec<PinCapabilities>, ProtocolError> {
        self.with_board(|b| Ok(b.capabilities().to_vec()))
    }

    /// Raw analog mapping found during discovery
    pub fn analog_map(&self) -> Result<Vec<u8>, ProtocolError> {
        let state = self.lock();
        if state.board.is_none() {
            return Err(ProtocolError::NotConnected);
        }
        Ok(state.analog_map.clone())
    }

    // ---- Latches ----

    /// Latch a digital pin on a level
    pub fn set_digital_latch(
        &self,
        pin: usize,
        level: i32,
        callback: Option<Callback<LatchEvent>>,
    ) -> Result<(), ProtocolError> {
        self.with_board(|b| {
            b.pin(pin)?;
            b.latches
                .arm(LatchKey::digital(pin), Threshold::Eq, level, callback)
        })
    }

    /// Latch an analog channel on a threshold
    pub fn set_analog_latch(
        &self,
        channel: usize,
        threshold: Threshold,
        target: i32,
        callback: Option<Callback<LatchEvent>>,
    ) -> Result<(), ProtocolError> {
        self.with_board(|b| {
            b.analog_pin(channel)?;
            b.latches
                .arm(LatchKey::analog(channel), threshold, target, callback)
        })
    }

    pub fn get_digital_latch_data(&self, pin: usize) -> Result<Option<LatchData>, ProtocolError> {
        self.with_board(|b| Ok(b.latches.poll(LatchKey::digital(pin))))
    }

    pub fn get_analog_latch_data(&self, channel: usize) -> Result<Option<LatchData>, ProtocolError> {
        self.with_board(|b| Ok(b.latches.poll(LatchKey::analog(channel))))
    }

    // ---- Keepalive and tone ----

    /// Ask the board to reset itself if no ping arrives within `period`
    /// seconds; pings go out every `period * margin`. A period of 0 turns
    /// keepalive off.
    pub fn keep_alive(&self, period: f64, margin: f64) -> Result<(), ProtocolError> {
        self.with_board(|b| b.keepalive.configure(period, margin))
    }

    /// Play a tone; a duration of 0 plays until stopped
    pub fn play_tone(&self, pin: u8, frequency: u16, duration_ms: u16) -> Result<(), ProtocolError> {
        self.with_board(|b| {
            b.pin(pin as usize)?;
            b.tone.play(pin, frequency, duration_ms);
            Ok(())
        })
    }

    pub fn stop_tone(&self, pin: u8) -> Result<(), ProtocolError> {
        self.with_board(|b| {
            b.pin(pin as usize)?;
            b.tone.stop(pin);
            Ok(())
        })
    }

    // ---- I2C ----

    /// Must precede other I2C requests
    pub async fn i2c_config(&self, read_delay_us: u16) -> Result<(), ProtocolError> {
        let msg = SysexBuilder::new(I2C_CONFIG)
            .seven_bit(read_delay_us as u32, 2)
            .build();
        self.send(None, msg).await
    }

    /// Request a read of `count` bytes from `register`. `end_tx` restarts
    /// the transmission, which some devices need.
    pub async fn i2c_read(
        &self,
        address: u8,
        register: Option<u16>,
        count: u16,
        mode: I2cReadMode,
        end_tx: bool,
        callback: Option<Callback<I2cReply>>,
    ) -> Result<(), ProtocolError> {
        self.with_board(|b| {
            b.i2c.ensure(address as u16, callback);
            Ok(())
        })?;
        let mut request = match mode {
            I2cReadMode::Once => I2C_READ,
            I2cReadMode::Continuous => I2C_READ_CONTINUOUSLY,
        };
        if end_tx {
            request |= I2C_END_TX_MASK;
        }
        let mut msg = SysexBuilder::new(I2C_REQUEST).byte(address).byte(request);
        if let Some(register) = register {
            msg = msg.seven_bit(register as u32, 2);
        }
        self.send(None, msg.seven_bit(count as u32, 2).build()).await
    }

    pub async fn i2c_write(&self, address: u8, data: &[u8]) -> Result<(), ProtocolError> {
        self.with_board(|b| {
            b.i2c.ensure(address as u16, None);
            Ok(())
        })?;
        let msg = data.iter().fold(
            SysexBuilder::new(I2C_REQUEST).byte(address).byte(I2C_WRITE),
            |msg, byte| msg.seven_bit(*byte as u32, 2),
        );
        self.send(None, msg.build()).await
    }

    pub async fn i2c_stop_reading(&self, address: u8) -> Result<(), ProtocolError> {
        let msg = SysexBuilder::new(I2C_REQUEST)
            .byte(address)
            .byte(I2C_STOP_READING)
            .build();
        self.send(None, msg).await
    }

    /// Data of the last reply from `address`
    pub fn i2c_read_data(&self, address: u8) -> Result<Option<Vec<u16>>, ProtocolError> {
        self.with_board(|b| Ok(b.i2c.read(address as u16)))
    }

    // ---- Sonar, stepper, encoder ----

    /// Configure an HC-SR04 style sonar. At most six can be active; further
    /// requests (and repeats for a known trigger pin) are ignored.
    pub async fn sonar_config(
        &self,
        trigger_pin: u8,
        echo_pin: u8,
        ping_interval_ms: u8,
        max_distance: u16,
        callback: Option<Callback<SonarReading>>,
    ) -> Result<(), ProtocolError> {
        let added = self.with_board(|b| {
            for pin in [trigger_pin as usize, echo_pin as usize] {
                if !b.pin(pin)?.capabilities().accepts(PinMode::Sonar) {
                    return Err(ProtocolError::UnsupportedMode {
                        pin,
                        mode: PinMode::Sonar,
                    });
                }
            }
            let added = b.sonar.add(trigger_pin, callback);
            if added == SonarAdd::Added {
                b.set_pin_mode(trigger_pin as usize, PinMode::Sonar)?;
                b.set_pin_mode(echo_pin as usize, PinMode::Sonar)?;
            }
            Ok(added)
        })?;
        match added {
            SonarAdd::Added => {}
            SonarAdd::Duplicate => {
                tracing::debug!("sonar on pin {} already configured", trigger_pin);
                return Ok(());
            }
            SonarAdd::Full => {
                tracing::warn!("sonar_config: maximum number of devices assigned, ignoring pin {}", trigger_pin);
                return Ok(());
            }
        }
        let max_distance = max_distance.min(MAX_SONAR_DISTANCE);
        let msg = SysexBuilder::new(SONAR_CONFIG)
            .byte(trigger_pin)
            .byte(echo_pin)
            .byte(ping_interval_ms)
            .seven_bit(max_distance as u32, 2)
            .build();
        self.send(None, msg).await
    }

    /// Last distance measured by the sonar on `trigger_pin`
    pub fn sonar_read(&self, trigger_pin: u8) -> Result<Option<u16>, ProtocolError> {
        self.with_board(|b| Ok(b.sonar.read(trigger_pin)))
    }

    pub async fn stepper_config(&self, steps_per_revolution: u16, pins: &[u8]) -> Result<(), ProtocolError> {
        if !matches!(pins.len(), 2 | 4) {
            return Err(ProtocolError::InvalidParameter(format!(
                "steppers use 2 or 4 pins, got {}",
                pins.len()
            )));
        }
        self.with_board(|b| pins.iter().try_for_each(|p| b.pin(*p as usize).map(drop)))?;
        let msg = SysexBuilder::new(STEPPER_DATA)
            .byte(STEPPER_CONFIGURE)
            .seven_bit(steps_per_revolution as u32, 2)
            .bytes(pins)
            .build();
        self.send(None, msg).await
    }

    /// Move the stepper; negative step counts run in reverse
    pub async fn stepper_step(&self, speed: u32, steps: i32) -> Result<(), ProtocolError> {
        let direction = u8::from(steps > 0);
        let msg = SysexBuilder::new(STEPPER_DATA)
            .byte(STEPPER_STEP)
            .seven_bit(speed, 3)
            .seven_bit(steps.unsigned_abs(), 2)
            .byte(direction)
            .build();
        self.send(None, msg).await
    }

    /// Enable encoder reporting on `pin_a`/`pin_b`. In hall mode each pin is
    /// a separate wheel counter.
    pub async fn encoder_config(
        &self,
        pin_a: u8,
        pin_b: u8,
        hall: bool,
        callback: Option<Callback<EncoderReport>>,
    ) -> Result<(), ProtocolError> {
        self.with_board(|b| {
            b.pin(pin_a as usize)?;
            b.pin(pin_b as usize)?;
            b.encoders.configure(pin_a, hall, callback);
            Ok(())
        })?;
        let msg = SysexBuilder::new(ENCODER_CONFIG).byte(pin_a).byte(pin_b).build();
        self.send(None, msg).await
    }

    pub fn encoder_read(&self, pin: u8) -> Result<Option<EncoderReport>, ProtocolError> {
        self.with_board(|b| Ok(b.encoders.read(pin)))
    }

    // ---- Pixy ----

    /// Start Pixy block reporting
    pub async fn pixy_init(
        &self,
        max_blocks: u8,
        callback: Option<Callback<Vec<PixyBlock>>>,
    ) -> Result<(), ProtocolError> {
        self.with_board(|b| {
            if callback.is_some() {
                b.pixy.set_callback(callback);
            }
            Ok(())
        })?;
        let msg = SysexBuilder::new(PIXY_CONFIG)
            .byte(PIXY_INIT)
            .byte(max_blocks)
            .build();
        self.send(None, msg).await
    }

    /// Pan/tilt servos plugged into the camera
    pub async fn pixy_set_servos(&self, s0: u16, s1: u16) -> Result<(), ProtocolError> {
        let msg = SysexBuilder::new(PIXY_CONFIG)
            .byte(PIXY_SET_SERVOS)
            .seven_bit(s0 as u32, 2)
            .seven_bit(s1 as u32, 2)
            .build();
        self.send(None, msg).await
    }

    pub async fn pixy_set_brightness(&self, brightness: u16) -> Result<(), ProtocolError> {
        let msg = SysexBuilder::new(PIXY_CONFIG)
            .byte(PIXY_SET_BRIGHTNESS)
            .seven_bit(brightness as u32, 2)
            .build();
        self.send(None, msg).await
    }

    pub async fn pixy_set_led(&self, r: u16, g: u16, b: u16) -> Result<(), ProtocolError> {
        let msg = SysexBuilder::new(PIXY_CONFIG)
            .byte(PIXY_SET_LED)
            .seven_bit(r as u32, 2)
            .seven_bit(g as u32, 2)
            .seven_bit(b as u32, 2)
            .build();
        self.send(None, msg).await
    }

    pub fn pixy_blocks(&self) -> Result<Vec<PixyBlock>, ProtocolError> {
        self.with_board(|b| Ok(b.pixy.blocks().to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LoopbackTransport;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Loopback whose next write can be made to stall
    struct StallingTransport {
        inner: Arc<LoopbackTransport>,
        stall_next: AtomicBool,
    }

    #[async_trait]
    impl Transport for StallingTransport {
        fn name(&self) -> &str {
            self.inner.name()
        }

        async fn read_byte(&self) -> Result<u8, TransportError> {
            self.inner.read_byte().await
        }

        async fn write(&self, bytes: &[u8]) -> Result<(), TransportError> {
            if self.stall_next.swap(false, Ordering::SeqCst) {
                sleep(Duration::from_millis(50)).await;
            }
            self.inner.write(bytes).await
        }

        fn is_open(&self) -> bool {
            self.inner.is_open()
        }

        fn close(&self) {
            self.inner.close()
        }
    }

    /// Two pins: 0 digital, 1 analog channel 0
    fn capability_reply() -> Vec<u8> {
        SysexBuilder::new(CAPABILITY_RESPONSE)
            .bytes(&[0x00, 1, 0x01, 1, 0x7F, 0x02, 10, 0x7F])
            .build()
    }

    /// Loopback answering discovery like a tiny two-pin board
    fn board_transport() -> Arc<LoopbackTransport> {
        let transport = Arc::new(LoopbackTransport::new("loop0"));
        transport.set_responder(Box::new(|written| {
            let reply = match written {
                [START_SYSEX, REPORT_FIRMWARE, END_SYSEX] => SysexBuilder::new(REPORT_FIRMWARE)
                    .bytes(&[2, 5, b'F', 0, b'P', 0])
                    .build(),
                [START_SYSEX, ANALOG_MAPPING_QUERY, END_SYSEX] => {
                    SysexBuilder::new(ANALOG_MAPPING_RESPONSE).bytes(&[0x7F, 0]).build()
                }
                [START_SYSEX, CAPABILITY_QUERY, END_SYSEX] => capability_reply(),
                [REPORT_VERSION] => vec![REPORT_VERSION, 2, 5],
                _ => return None,
            };
            Some(reply)
        }));
        transport
    }

    fn engine() -> Arc<Engine> {
        Engine::new(EngineConfig {
            reset_delay: Duration::from_millis(10),
            ..EngineConfig::default()
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_builds_board() {
        let engine = engine();
        let mut events = engine.subscribe();
        let transport = board_transport();
        engine.assign_port(transport.clone()).await.unwrap();

        assert!(engine.is_ready());
        assert_eq!(
            events.recv().await.unwrap(),
            EngineEvent::Ready {
                port: "loop0".to_string(),
                pins: 2,
                ports: 1,
                analog: 1
            }
        );
        let firmware = engine.get_firmware_version().await.unwrap();
        assert_eq!(firmware.name, "FP");
        assert_eq!(engine.analog_map().unwrap(), vec![0x7F, 0]);
        assert_eq!(engine.get_protocol_version().await.unwrap(), (2, 5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_port_times_out() {
        let engine = engine();
        let mut events = engine.subscribe();
        let transport = Arc::new(LoopbackTransport::new("mute"));
        let err = engine.assign_port(transport).await.unwrap_err();

        assert!(matches!(err, ProtocolError::Timeout { query: "firmware version" }));
        assert!(!engine.is_ready());
        assert!(matches!(
            events.recv().await.unwrap(),
            EngineEvent::PortFaulted { port, .. } if port == "mute"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_mismatch_is_inconsistent() {
        let engine = engine();
        let mut events = engine.subscribe();
        let transport = Arc::new(LoopbackTransport::new("odd"));
        transport.set_responder(Box::new(|written| match written {
            [START_SYSEX, REPORT_FIRMWARE, END_SYSEX] => {
                Some(SysexBuilder::new(REPORT_FIRMWARE).bytes(&[2, 5]).build())
            }
            // Mapping claims pin 0 is analog, the capability report does not
            [START_SYSEX, ANALOG_MAPPING_QUERY, END_SYSEX] => {
                Some(SysexBuilder::new(ANALOG_MAPPING_RESPONSE).bytes(&[0]).build())
            }
            [START_SYSEX, CAPABILITY_QUERY, END_SYSEX] => Some(
                SysexBuilder::new(CAPABILITY_RESPONSE)
                    .bytes(&[0x00, 1, 0x7F])
                    .build(),
            ),
            _ => None,
        }));

        let err = engine.assign_port(transport).await.unwrap_err();
        assert!(matches!(err, ProtocolError::CapabilityMismatch { pin: 0 }));
        assert!(matches!(
            events.recv().await.unwrap(),
            EngineEvent::Inconsistent { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_analog_runs_callback() {
        let engine = engine();
        let runner = engine.take_callback_runner().unwrap();
        tokio::spawn(runner.run());
        let transport = board_transport();
        engine.assign_port(transport.clone()).await.unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        engine
            .set_pin_mode(
                1,
                PinMode::Analog,
                Some(Callback::sync(move |report: PinReport| {
                    let _ = tx.send(report);
                })),
            )
            .unwrap();
        transport.push_inbound(&[ANALOG_MESSAGE, 0x7F, 0x07]);

        let report = rx.recv().await.unwrap();
        assert_eq!(report.value, 1023);
        assert_eq!(engine.analog_read(0).unwrap(), 1023);
    }

    #[tokio::test(start_paused = true)]
    async fn test_commands_follow_pending_changes() {
        let engine = engine();
        let transport = board_transport();
        engine.assign_port(transport.clone()).await.unwrap();
        transport.take_outbound();

        engine.set_pin_mode(0, PinMode::Output, None).unwrap();
        engine.set_sampling_interval(100).await.unwrap();
        assert_eq!(
            transport.take_outbound(),
            vec![SET_PIN_MODE, 0, 1, START_SYSEX, SAMPLING_INTERVAL, 100, 0, END_SYSEX]
        );
        assert_eq!(engine.flush().await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_failure_faults_port() {
        let engine = engine();
        let mut events = engine.subscribe();
        let transport = board_transport();
        engine.assign_port(transport.clone()).await.unwrap();
        let _ready = events.recv().await.unwrap();

        transport.fail_writes(true);
        assert!(engine.send_reset().await.is_err());
        assert!(matches!(
            events.recv().await.unwrap(),
            EngineEvent::PortFaulted { .. }
        ));

        engine.remove_port();
        assert!(matches!(
            engine.digital_read(0),
            Err(ProtocolError::NotConnected)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_writes_keep_call_order() {
        let engine = engine();
        let inner = board_transport();
        let transport = Arc::new(StallingTransport {
            inner: inner.clone(),
            stall_next: AtomicBool::new(false),
        });
        engine.assign_port(transport.clone()).await.unwrap();
        inner.take_outbound();

        engine.set_pin_mode(0, PinMode::Output, None).unwrap();
        transport.stall_next.store(true, Ordering::SeqCst);
        let (flushed, reset) = tokio::join!(engine.flush(), engine.send_reset());
        assert_eq!(flushed.unwrap(), 3);
        reset.unwrap();

        assert_eq!(inner.take_outbound(), vec![SET_PIN_MODE, 0, 1, SYSTEM_RESET]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_sonar_changes_nothing() {
        let engine = engine();
        let transport = board_transport();
        engine.assign_port(transport.clone()).await.unwrap();
        transport.take_outbound();

        // Pin 1 is analog only
        let err = engine.sonar_config(0, 1, 50, 200, None).await.unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::UnsupportedMode {
                pin: 1,
                mode: PinMode::Sonar
            }
        ));
        assert_eq!(engine.sonar_read(0).unwrap(), None);
        engine
            .with_board(|b| {
                assert_eq!(b.sonar.len(), 0);
                assert_eq!(b.pin(0)?.mode(), None);
                Ok(())
            })
            .unwrap();
        assert_eq!(engine.flush().await.unwrap(), 0);
        assert!(transport.take_outbound().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_keep_alive_keeps_margin() {
        let engine = engine();
        engine.assign_port(board_transport()).await.unwrap();

        assert!(engine.keep_alive(11.0, 0.8).is_err());
        let margin = engine.with_board(|b| Ok(b.keepalive.margin())).unwrap();
        assert_eq!(margin, keepalive::DEFAULT_MARGIN);
        assert_eq!(engine.flush().await.unwrap(), 0);

        engine.keep_alive(4.0, 0.5).unwrap();
        let margin = engine.with_board(|b| Ok(b.keepalive.margin())).unwrap();
        assert_eq!(margin, 0.5);
    }

    #[test]
    fn test_pin_state_parse() {
        let report = PinStateReport::parse(&[3, 1, 0x01]).unwrap();
        assert_eq!(report.mode, Some(PinMode::Output));
        assert_eq!(report.state, 1);
        assert!(PinStateReport::parse(&[3]).is_err());

        let report = PinStateReport::parse(&[3, 1, 0x7F, 0x7F, 0x7F, 0x7F, 0x0F]).unwrap();
        assert_eq!(report.state, u32::MAX);
        assert!(matches!(
            PinStateReport::parse(&[3, 1, 1, 1, 1, 1, 1, 1]),
            Err(ProtocolError::Malformed(_))
        ));
    }
}
