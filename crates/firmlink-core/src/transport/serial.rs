//! Serial port handling
//!
//! OS serial enumeration, the platform list of likely device names, and the
//! async [`SerialTransport`] used once a port is open.

use async_trait::async_trait;
use serialport::{SerialPort, SerialPortInfo, SerialPortType};
use std::collections::HashMap;
#[cfg(target_os = "linux")]
use std::fs;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tokio_util::sync::CancellationToken;

use super::{PortOpener, Transport, TransportError};

/// Information about an available serial port
#[derive(Debug, Clone)]
pub struct PortInfo {
    /// Port name (e.g., "/dev/ttyUSB0" or "COM3")
    pub name: String,

    /// USB vendor ID (if USB device)
    pub vid: Option<u16>,

    /// USB product ID (if USB device)
    pub pid: Option<u16>,

    /// Manufacturer name (if available)
    pub manufacturer: Option<String>,

    /// Product name (if available)
    pub product: Option<String>,
}

impl PortInfo {
    fn bare(name: String) -> Self {
        Self {
            name,
            vid: None,
            pid: None,
            manufacturer: None,
            product: None,
        }
    }
}

impl From<SerialPortInfo> for PortInfo {
    fn from(info: SerialPortInfo) -> Self {
        let (vid, pid, manufacturer, product) = match info.port_type {
            SerialPortType::UsbPort(usb_info) => (
                Some(usb_info.vid),
                Some(usb_info.pid),
                usb_info.manufacturer,
                usb_info.product,
            ),
            _ => (None, None, None, None),
        };

        Self {
            name: info.port_name,
            vid,
            pid,
            manufacturer,
            product,
        }
    }
}

/// Sort key so that:
///  - ttyACM* ports come first (sorted numerically by suffix)
///  - then ttyUSB* ports (sorted numerically)
///  - then other ports (sorted by name)
fn port_sort_key(name: &str) -> (u8, usize, String) {
    let basename = name.rsplit('/').next().unwrap_or(name);
    if let Some(rest) = basename.strip_prefix("ttyACM") {
        let num = rest.parse::<usize>().unwrap_or(usize::MAX);
        return (0, num, basename.to_string());
    }
    if let Some(rest) = basename.strip_prefix("ttyUSB") {
        let num = rest.parse::<usize>().unwrap_or(usize::MAX);
        return (1, num, basename.to_string());
    }
    (2, 0, basename.to_string())
}

/// List serial ports the OS knows about, with /dev fallbacks and deterministic ordering
pub fn list_ports() -> Vec<PortInfo> {
    let mut map: HashMap<String, PortInfo> = HashMap::new();
    for info in serialport::available_ports().unwrap_or_default() {
        let p = PortInfo::from(info);
        map.entry(p.name.clone()).or_insert(p);
    }

    // Linux-only: /dev/ttyACM* and /dev/ttyUSB* entries the API missed
    #[cfg(target_os = "linux")]
    if let Ok(entries) = fs::read_dir("/dev") {
        for entry in entries.flatten() {
            if let Some(fname) = entry.file_name().to_str() {
                if fname.starts_with("ttyACM") || fname.starts_with("ttyUSB") {
                    let full = format!("/dev/{}", fname);
                    map.entry(full.clone())
                        .or_insert_with(|| PortInfo::bare(full));
                }
            }
        }
    }

    let mut v: Vec<PortInfo> = map.into_values().collect();
    v.sort_by_key(|p| port_sort_key(&p.name));
    v
}

/// Device names worth probing on this platform even if enumeration misses them
pub fn static_locations() -> Vec<String> {
    #[cfg(target_os = "macos")]
    {
        let mut names: Vec<String> = Vec::new();
        if let Ok(entries) = std::fs::read_dir("/dev") {
            for entry in entries.flatten() {
                if let Some(fname) = entry.file_name().to_str() {
                    if fname.starts_with("tty.wchusb") || fname.starts_with("tty.usb") {
                        names.push(format!("/dev/{}", fname));
                    }
                }
            }
        }
        names.sort();
        names
    }

    #[cfg(target_os = "windows")]
    {
        (1..=21).map(|n| format!("COM{}", n)).collect()
    }

    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    {
        let mut names: Vec<String> = (0..=5).map(|n| format!("/dev/ttyACM{}", n)).collect();
        names.extend((0..=10).map(|n| format!("/dev/ttyUSB{}", n)));
        names.extend((0..=2).map(|n| format!("/dev/ttyS{}", n)));
        names
    }
}

/// Configure an open port for Firmata: 8N1, no flow control, DTR/RTS asserted
pub fn configure_port(port: &mut dyn SerialPort) -> Result<(), TransportError> {
    port.set_data_bits(serialport::DataBits::Eight)?;
    port.set_parity(serialport::Parity::None)?;
    port.set_stop_bits(serialport::StopBits::One)?;
    port.set_flow_control(serialport::FlowControl::None)?;

    // Boards that reset on DTR toggles have already reset by now; keeping the
    // lines asserted avoids a second reset mid-handshake.
    if let Err(e) = port.write_data_terminal_ready(true) {
        tracing::debug!("failed to set DTR high: {} (continuing)", e);
    }
    if let Err(e) = port.write_request_to_send(true) {
        tracing::debug!("failed to set RTS high: {} (continuing)", e);
    }

    Ok(())
}

/// An open OS serial port
pub struct SerialTransport {
    name: String,
    reader: Mutex<ReadHalf<SerialStream>>,
    writer: Mutex<WriteHalf<SerialStream>>,
    cancel: CancellationToken,
}

impl SerialTransport {
    pub fn new(name: &str, stream: SerialStream) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            name: name.to_string(),
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            cancel: CancellationToken::new(),
        }
    }

    fn closed(&self) -> TransportError {
        TransportError::Closed(self.name.clone())
    }
}

#[async_trait]
impl Transport for SerialTransport {
    fn name(&self) -> &str {
        &self.name
    }

    async fn read_byte(&self) -> Result<u8, TransportError> {
        if self.cancel.is_cancelled() {
            return Err(self.closed());
        }
        let mut reader = self.reader.lock().await;
        tokio::select! {
            _ = self.cancel.cancelled() => Err(self.closed()),
            res = reader.read_u8() => res.map_err(|e| {
                self.cancel.cancel();
                TransportError::Io(e)
            }),
        }
    }

    async fn write(&self, bytes: &[u8]) -> Result<(), TransportError> {
        if self.cancel.is_cancelled() {
            return Err(self.closed());
        }
        let mut writer = self.writer.lock().await;
        let res = tokio::select! {
            _ = self.cancel.cancelled() => return Err(self.closed()),
            res = async {
                writer.write_all(bytes).await?;
                writer.flush().await
            } => res,
        };
        res.map_err(|e| {
            self.cancel.cancel();
            TransportError::Io(e)
        })
    }

    fn is_open(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    fn close(&self) {
        self.cancel.cancel();
    }
}

/// Opens OS serial devices
#[derive(Debug, Default, Clone, Copy)]
pub struct SerialOpener;

#[async_trait]
impl PortOpener for SerialOpener {
    async fn open(&self, name: &str, baud_rate: u32) -> Result<Arc<dyn Transport>, TransportError> {
        let mut stream = tokio_serial::new(name, baud_rate)
            .open_native_async()
            .map_err(|e| TransportError::OpenFailed {
                port: name.to_string(),
                reason: e.to_string(),
            })?;
        configure_port(&mut stream)?;
        if let Err(e) = stream.clear(serialport::ClearBuffer::All) {
            tracing::debug!("failed to clear buffers on {}: {}", name, e);
        }
        Ok(Arc::new(SerialTransport::new(name, stream)))
    }
}
