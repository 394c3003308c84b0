// src/io/serial/mock.rs
//
// In-memory scale for tests. Counts live handles so tests can check that
// sessions never leak a device across restarts.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::sync::mpsc as std_mpsc;
use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc, Mutex,
};
use std::time::Duration;

use super::{DeviceConnector, DeviceLink};
use crate::io::BridgeError;
use crate::scale::ConnectionConfig;

enum MockInput {
    Bytes(Vec<u8>),
    Fault(String),
}

pub(crate) struct MockScale {
    live_links: Arc<AtomicUsize>,
    opens: AtomicUsize,
    inbound: Mutex<Option<std_mpsc::Sender<MockInput>>>,
    writes: Arc<Mutex<Vec<Vec<u8>>>>,
    fail_open: AtomicBool,
    fail_writes: Arc<AtomicBool>,
    open_delay: Mutex<Duration>,
}

impl MockScale {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            live_links: Arc::new(AtomicUsize::new(0)),
            opens: AtomicUsize::new(0),
            inbound: Mutex::new(None),
            writes: Arc::new(Mutex::new(Vec::new())),
            fail_open: AtomicBool::new(false),
            fail_writes: Arc::new(AtomicBool::new(false)),
            open_delay: Mutex::new(Duration::ZERO),
        })
    }

    /// Handles opened and not yet dropped
    pub(crate) fn live_links(&self) -> usize {
        self.live_links.load(Ordering::SeqCst)
    }

    pub(crate) fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub(crate) fn writes(&self) -> Vec<Vec<u8>> {
        self.writes.lock().unwrap().clone()
    }

    pub(crate) fn fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn set_open_delay(&self, delay: Duration) {
        *self.open_delay.lock().unwrap() = delay;
    }

    /// Deliver bytes to the most recently opened link
    pub(crate) fn push(&self, bytes: &[u8]) -> bool {
        self.send(MockInput::Bytes(bytes.to_vec()))
    }

    /// Make the most recently opened link fail its next read
    pub(crate) fn inject_fault(&self, reason: &str) -> bool {
        self.send(MockInput::Fault(reason.to_string()))
    }

    fn send(&self, input: MockInput) -> bool {
        match self.inbound.lock().unwrap().as_ref() {
            Some(tx) => tx.send(input).is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl DeviceConnector for MockScale {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn DeviceLink>, BridgeError> {
        let delay = *self.open_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(BridgeError::device_open(&config.device_path, "No such file or directory"));
        }

        let (tx, rx) = std_mpsc::channel();
        *self.inbound.lock().unwrap() = Some(tx);
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.live_links.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(MockLink {
            rx,
            writes: self.writes.clone(),
            fail_writes: self.fail_writes.clone(),
            live_links: self.live_links.clone(),
        }))
    }

    fn kind(&self) -> &'static str {
        "mock"
    }
}

struct MockLink {
    rx: std_mpsc::Receiver<MockInput>,
    writes: Arc<Mutex<Vec<Vec<u8>>>>,
    fail_writes: Arc<AtomicBool>,
    live_links: Arc<AtomicUsize>,
}

impl DeviceLink for MockLink {
    fn write_frame(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(std::io::Error::new(ErrorKind::BrokenPipe, "write rejected"));
        }
        self.writes.lock().unwrap().push(bytes.to_vec());
        Ok(())
    }

    fn read_available(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self.rx.recv_timeout(Duration::from_millis(5)) {
            Ok(MockInput::Bytes(bytes)) => {
                let n = bytes.len().min(buf.len());
                buf[..n].copy_from_slice(&bytes[..n]);
                Ok(n)
            }
            Ok(MockInput::Fault(reason)) => Err(std::io::Error::new(ErrorKind::Other, reason)),
            Err(_) => Err(std::io::Error::new(ErrorKind::TimedOut, "no data")),
        }
    }
}

impl Drop for MockLink {
    fn drop(&mut self) {
        self.live_links.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Poll `cond` until it holds or `timeout` elapses
pub(crate) async fn wait_until<F: Fn() -> bool>(timeout: Duration, cond: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
