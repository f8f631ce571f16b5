//! In-memory transport
//!
//! Bytes pushed with [`LoopbackTransport::push_inbound`] are what the engine
//! reads; everything the engine writes is captured for inspection. Used for
//! simulation and tests in place of real hardware.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

use super::{PortOpener, Transport, TransportError};

/// Callback that answers written bytes with a reply, simulating firmware
pub type Responder = Box<dyn Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync>;

pub struct LoopbackTransport {
    name: String,
    inbound: Mutex<VecDeque<u8>>,
    outbound: Mutex<Vec<u8>>,
    open: AtomicBool,
    fail_writes: AtomicBool,
    responder: Mutex<Option<Responder>>,
    notify: Notify,
}

impl LoopbackTransport {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            inbound: Mutex::new(VecDeque::new()),
            outbound: Mutex::new(Vec::new()),
            open: AtomicBool::new(true),
            fail_writes: AtomicBool::new(false),
            responder: Mutex::new(None),
            notify: Notify::new(),
        }
    }

    /// Queue bytes for the reader
    pub fn push_inbound(&self, bytes: &[u8]) {
        if let Ok(mut inbound) = self.inbound.lock() {
            inbound.extend(bytes.iter().copied());
        }
        self.notify.notify_waiters();
    }

    /// Take everything written so far
    pub fn take_outbound(&self) -> Vec<u8> {
        self.outbound
            .lock()
            .map(|mut out| std::mem::take(&mut *out))
            .unwrap_or_default()
    }

    /// Make subsequent writes fail with an I/O error
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Answer every write with whatever the responder returns
    pub fn set_responder(&self, responder: Responder) {
        if let Ok(mut slot) = self.responder.lock() {
            *slot = Some(responder);
        }
    }

    fn pop_inbound(&self) -> Option<u8> {
        self.inbound.lock().ok().and_then(|mut q| q.pop_front())
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    fn name(&self) -> &str {
        &self.name
    }

    async fn read_byte(&self) -> Result<u8, TransportError> {
        loop {
            let notified = self.notify.notified();
            if let Some(byte) = self.pop_inbound() {
                return Ok(byte);
            }
            if !self.is_open() {
                return Err(TransportError::Closed(self.name.clone()));
            }
            notified.await;
        }
    }

    async fn write(&self, bytes: &[u8]) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed(self.name.clone()));
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            self.close();
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "loopback write failure",
            )));
        }
        if let Ok(mut out) = self.outbound.lock() {
            out.extend_from_slice(bytes);
        }
        let reply = self
            .responder
            .lock()
            .ok()
            .and_then(|r| r.as_ref().and_then(|f| f(bytes)));
        if let Some(reply) = reply {
            self.push_inbound(&reply);
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.notify.notify_waiters();
    }
}

/// Opener handing out loopback transports for a fixed set of device names
#[derive(Default)]
pub struct LoopbackOpener {
    opened: Mutex<HashMap<String, Arc<LoopbackTransport>>>,
    configure: Option<Box<dyn Fn(&LoopbackTransport) + Send + Sync>>,
}

impl LoopbackOpener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` on every transport right after it is opened
    pub fn with_setup(f: impl Fn(&LoopbackTransport) + Send + Sync + 'static) -> Self {
        Self {
            opened: Mutex::new(HashMap::new()),
            configure: Some(Box::new(f)),
        }
    }

    /// Most recent transport opened for `name`
    pub fn transport(&self, name: &str) -> Option<Arc<LoopbackTransport>> {
        self.opened.lock().ok().and_then(|m| m.get(name).cloned())
    }

    /// Names opened so far
    pub fn opened_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .opened
            .lock()
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }
}

#[async_trait]
impl PortOpener for LoopbackOpener {
    async fn open(&self, name: &str, _baud_rate: u32) -> Result<Arc<dyn Transport>, TransportError> {
        let transport = Arc::new(LoopbackTransport::new(name));
        if let Some(setup) = &self.configure {
            setup(&transport);
        }
        if let Ok(mut opened) = self.opened.lock() {
            opened.insert(name.to_string(), transport.clone());
        }
        Ok(transport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_after_push() {
        let t = Arc::new(LoopbackTransport::new("loop"));
        let reader = t.clone();
        let handle = tokio::spawn(async move { reader.read_byte().await });
        tokio::task::yield_now().await;
        t.push_inbound(&[0xAB]);
        assert_eq!(handle.await.unwrap().unwrap(), 0xAB);
    }

    #[tokio::test]
    async fn test_close_wakes_reader() {
        let t = Arc::new(LoopbackTransport::new("loop"));
        let reader = t.clone();
        let handle = tokio::spawn(async move { reader.read_byte().await });
        tokio::task::yield_now().await;
        t.close();
        assert!(matches!(handle.await.unwrap(), Err(TransportError::Closed(_))));
    }

    #[tokio::test]
    async fn test_write_failure_closes() {
        let t = LoopbackTransport::new("loop");
        t.write(b"ok").await.unwrap();
        assert_eq!(t.take_outbound(), b"ok".to_vec());
        t.fail_writes(true);
        assert!(t.write(b"x").await.is_err());
        assert!(!t.is_open());
    }

    #[tokio::test]
    async fn test_responder() {
        let t = LoopbackTransport::new("loop");
        t.set_responder(Box::new(|bytes| (bytes == [0xF9]).then(|| vec![0xF9, 2, 5])));
        t.write(&[0xF9]).await.unwrap();
        assert_eq!(t.read_byte().await.unwrap(), 0xF9);
        assert_eq!(t.read_byte().await.unwrap(), 2);
        assert_eq!(t.read_byte().await.unwrap(), 5);
    }
}
