// src/io/serial/mod.rs
//
// Serial link to the scale.
//
// Features:
// - Device link abstraction so the session can run against real ports,
//   the simulated scale, or test doubles
// - Line framing (delimiter or STX/ETX) ahead of the decoder
// - Blocking I/O worker that owns the open handle, writes poll requests
//   and forwards complete frames to the session

pub mod framer;
pub mod reader;
pub(crate) mod utils;

#[cfg(test)]
pub(crate) mod mock;

use async_trait::async_trait;

use crate::io::BridgeError;
use crate::scale::ConnectionConfig;

pub use framer::{FramingEncoding, SerialFramer};
pub use reader::{list_serial_ports, SerialConnector, SerialPortInfo};
pub use utils::{Parity, SerialLineSettings};

/// An open, exclusively owned device handle. Dropping it releases the device.
///
/// Both calls block; they are only ever made from the device I/O worker thread.
pub trait DeviceLink: Send {
    /// Write one complete request frame.
    fn write_frame(&mut self, bytes: &[u8]) -> std::io::Result<()>;

    /// Read whatever bytes are available into `buf`.
    /// `ErrorKind::TimedOut` means nothing arrived yet; `Ok(0)` means the device went away.
    fn read_available(&mut self, buf: &mut [u8]) -> std::io::Result<usize>;
}

/// Opens device links for a session.
#[async_trait]
pub trait DeviceConnector: Send + Sync {
    /// Open the device described by `config`. Resolves once the device is ready.
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn DeviceLink>, BridgeError>;

    /// Connector identifier for log lines (e.g., "serial", "simulated")
    fn kind(&self) -> &'static str;
}
