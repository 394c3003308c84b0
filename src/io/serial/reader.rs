// src/io/serial/reader.rs
//
// serialport-backed device link and the blocking I/O worker.
//
// The worker thread is the only owner of the open handle: it drains queued
// poll requests, reads bytes, runs them through the framer and forwards
// complete frames to the session over a channel. Dropping out of the loop
// drops the link, which releases the port.

use async_trait::async_trait;
use serde::Serialize;
use std::io::{ErrorKind, Read, Write};
use std::sync::mpsc as std_mpsc;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::framer::{FramingEncoding, SerialFramer};
use super::{DeviceConnector, DeviceLink};
use crate::io::BridgeError;
use crate::scale::scheduler::{RequestSink, SubmitOutcome};
use crate::scale::ConnectionConfig;

/// Read timeout on the port. Bounds how long the worker takes to notice cancellation.
const READ_TIMEOUT: Duration = Duration::from_millis(20);

// ============================================================================
// Types
// ============================================================================

/// Information about an available serial port
#[derive(Clone, Debug, Serialize)]
pub struct SerialPortInfo {
    pub port_name: String,
    pub port_type: String,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
    pub vid: Option<u16>,
    pub pid: Option<u16>,
}

/// Events from the I/O worker to the session's event pump
#[derive(Debug)]
pub(crate) enum DeviceEvent {
    /// One complete inbound frame
    Frame(Vec<u8>),
    /// A single poll write failed; the link stays up
    WriteFailed(String),
    /// Connection-level failure; the worker has exited and released the handle
    Failed(String),
}

// ============================================================================
// Serial Connector
// ============================================================================

/// Opens real serial ports through the serialport crate
#[derive(Clone, Copy, Debug, Default)]
pub struct SerialConnector;

struct SerialLink {
    port: Box<dyn serialport::SerialPort>,
}

impl DeviceLink for SerialLink {
    fn write_frame(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.port.write_all(bytes)?;
        self.port.flush()
    }

    fn read_available(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.port.read(buf)
    }
}

#[async_trait]
impl DeviceConnector for SerialConnector {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn DeviceLink>, BridgeError> {
        let path = config.device_path.clone();
        let baud_rate = config.baud_rate;
        let line = config.line;

        // Opening a port can block (e.g. tty devices waiting on carrier detect)
        let opened = tokio::task::spawn_blocking(move || {
            line.configure(serialport::new(&path, baud_rate))
                .timeout(READ_TIMEOUT)
                .open()
        })
        .await
        .map_err(|e| BridgeError::device_open(&config.device_path, format!("open task failed: {}", e)))?;

        let port = opened.map_err(|e| BridgeError::device_open(&config.device_path, e.to_string()))?;

        tlog!(
            "[Serial] Opened {} at {} baud ({})",
            config.device_path,
            config.baud_rate,
            config.line.describe()
        );

        Ok(Box::new(SerialLink { port }))
    }

    fn kind(&self) -> &'static str {
        "serial"
    }
}

// ============================================================================
// Device I/O Worker
// ============================================================================

/// Handle on the running I/O worker
pub(crate) struct DeviceIo {
    cancel_flag: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl DeviceIo {
    /// Spawn the worker on the blocking pool. Returns the worker handle and
    /// the sink the poll scheduler writes requests into.
    pub(crate) fn spawn(
        link: Box<dyn DeviceLink>,
        framing: FramingEncoding,
        events: mpsc::Sender<DeviceEvent>,
    ) -> (Self, RequestSender) {
        // Capacity 1: at most one request waits while another is being written
        let (request_tx, request_rx) = std_mpsc::sync_channel::<Vec<u8>>(1);
        let in_flight = Arc::new(AtomicBool::new(false));
        let cancel_flag = Arc::new(AtomicBool::new(false));

        let worker_cancel = cancel_flag.clone();
        let worker_in_flight = in_flight.clone();
        let handle = tokio::task::spawn_blocking(move || {
            run_device_io_blocking(link, framing, worker_cancel, request_rx, worker_in_flight, events)
        });

        (
            DeviceIo {
                cancel_flag,
                handle,
            },
            RequestSender {
                tx: request_tx,
                in_flight,
            },
        )
    }

    /// Ask the worker to exit without waiting for it
    pub(crate) fn cancel(&self) {
        self.cancel_flag.store(true, Ordering::Relaxed);
    }

    /// Signal the worker and wait for it to release the handle
    pub(crate) async fn stop(self) {
        self.cancel();
        if let Err(e) = self.handle.await {
            tlog!("[Serial] I/O worker panicked: {:?}", e);
        }
    }
}

/// Blocking I/O loop. Exits on cancellation, on a connection-level error,
/// or when the session stops listening.
fn run_device_io_blocking(
    mut link: Box<dyn DeviceLink>,
    framing: FramingEncoding,
    cancel_flag: Arc<AtomicBool>,
    request_rx: std_mpsc::Receiver<Vec<u8>>,
    in_flight: Arc<AtomicBool>,
    events: mpsc::Sender<DeviceEvent>,
) {
    let mut framer = SerialFramer::new(framing);
    let mut buf = [0u8; 256];

    loop {
        if cancel_flag.load(Ordering::Relaxed) {
            break;
        }

        // Write whatever the scheduler queued since the last read
        while let Ok(request) = request_rx.try_recv() {
            let result = link.write_frame(&request);
            in_flight.store(false, Ordering::Release);
            if let Err(e) = result {
                if events
                    .blocking_send(DeviceEvent::WriteFailed(format!("Serial write error: {}", e)))
                    .is_err()
                {
                    return;
                }
            }
        }

        match link.read_available(&mut buf) {
            Ok(0) => {
                // Zero-length read: the device went away
                let _ = events.blocking_send(DeviceEvent::Failed("device disconnected".to_string()));
                break;
            }
            Ok(n) => {
                for frame in framer.feed(&buf[..n]) {
                    if events.blocking_send(DeviceEvent::Frame(frame)).is_err() {
                        return;
                    }
                }
            }
            Err(ref e)
                if matches!(
                    e.kind(),
                    ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                ) =>
            {
                // No bytes this round
            }
            Err(e) => {
                let _ = events.blocking_send(DeviceEvent::Failed(format!("Read error: {}", e)));
                break;
            }
        }
    }
}

/// Poll-request sink backed by the worker's request channel.
/// A request is "in flight" from submission until the worker finished writing it.
#[derive(Clone)]
pub(crate) struct RequestSender {
    tx: std_mpsc::SyncSender<Vec<u8>>,
    in_flight: Arc<AtomicBool>,
}

impl RequestSink for RequestSender {
    fn try_submit(&self, frame: &[u8]) -> SubmitOutcome {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return SubmitOutcome::Busy;
        }

        match self.tx.try_send(frame.to_vec()) {
            Ok(()) => SubmitOutcome::Queued,
            Err(std_mpsc::TrySendError::Full(_)) => {
                self.in_flight.store(false, Ordering::Release);
                SubmitOutcome::Busy
            }
            Err(std_mpsc::TrySendError::Disconnected(_)) => {
                self.in_flight.store(false, Ordering::Release);
                SubmitOutcome::Closed
            }
        }
    }
}

// ============================================================================
// Port Enumeration
// ============================================================================

impl From<serialport::SerialPortInfo> for SerialPortInfo {
    fn from(port: serialport::SerialPortInfo) -> Self {
        let mut info = SerialPortInfo {
            port_name: port.port_name,
            port_type: String::new(),
            manufacturer: None,
            product: None,
            serial_number: None,
            vid: None,
            pid: None,
        };
        info.port_type = match port.port_type {
            serialport::SerialPortType::UsbPort(usb) => {
                info.manufacturer = usb.manufacturer;
                info.product = usb.product;
                info.serial_number = usb.serial_number;
                info.vid = Some(usb.vid);
                info.pid = Some(usb.pid);
                "USB"
            }
            serialport::SerialPortType::BluetoothPort => "Bluetooth",
            serialport::SerialPortType::PciPort => "PCI",
            serialport::SerialPortType::Unknown => "Unknown",
        }
        .to_string();
        info
    }
}

/// macOS lists each device twice; the /dev/tty.* twin blocks on open
/// waiting for carrier detect, so only /dev/cu.* is offered there.
fn is_usable_port(name: &str) -> bool {
    !(cfg!(target_os = "macos") && name.starts_with("/dev/tty."))
}

/// Serial ports a scale could be attached to
pub fn list_serial_ports() -> Result<Vec<SerialPortInfo>, String> {
    let ports = serialport::available_ports()
        .map_err(|e| format!("Failed to enumerate serial ports: {}", e))?;

    Ok(ports
        .into_iter()
        .filter(|p| is_usable_port(&p.port_name))
        .map(SerialPortInfo::from)
        .collect())
}
