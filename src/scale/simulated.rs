// src/scale/simulated.rs
//
// Simulated scale for running the bridge without hardware.
// Answers each poll request with a frame, cycling through an empty pan,
// a settling period and a stable load.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::io::ErrorKind;
use std::time::Duration;

use super::ConnectionConfig;
use crate::io::serial::framer::{ETX, STX};
use crate::io::{BridgeError, DeviceConnector, DeviceLink};

/// Idle read wait, same order as a real port's read timeout
const IDLE_READ: Duration = Duration::from_millis(20);

/// Loads placed on the pan, in grams, one per cycle
const LOADS: [u64; 4] = [1_250, 2_480, 500, 14_385];

/// Requests per cycle
const CYCLE: usize = 16;

#[derive(Clone, Copy, Debug, Default)]
pub struct SimulatedConnector;

#[async_trait]
impl DeviceConnector for SimulatedConnector {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn DeviceLink>, BridgeError> {
        tlog!("[Simulated] Scale attached as {}", config.device_path);
        Ok(Box::new(SimulatedLink::new(config.request_frame.clone())))
    }

    fn kind(&self) -> &'static str {
        "simulated"
    }
}

struct SimulatedLink {
    request: Vec<u8>,
    requests_seen: usize,
    pending: VecDeque<u8>,
}

impl SimulatedLink {
    fn new(request: Vec<u8>) -> Self {
        Self {
            request,
            requests_seen: 0,
            pending: VecDeque::new(),
        }
    }

    /// Reply to the n-th request
    fn reply(n: usize) -> Vec<u8> {
        let load = LOADS[(n / CYCLE) % LOADS.len()];
        let payload = match n % CYCLE {
            0..=3 => "000000000000".to_string(),
            4..=6 => format!("{:05}{:02}11111", load / 1000, (load % 1000) / 10),
            7..=13 => format!("{:07}", load),
            _ => format!("{:05}{:02}11111", load / 1000, (load % 1000) / 10),
        };

        let mut frame = vec![STX];
        frame.extend_from_slice(payload.as_bytes());
        frame.push(ETX);
        frame.extend_from_slice(b"\r\n");
        frame
    }
}

impl DeviceLink for SimulatedLink {
    fn write_frame(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        if bytes == self.request.as_slice() {
            self.pending.extend(Self::reply(self.requests_seen));
            self.requests_seen += 1;
        }
        Ok(())
    }

    fn read_available(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.pending.is_empty() {
            std::thread::sleep(IDLE_READ);
            return Err(std::io::Error::new(ErrorKind::TimedOut, "no data"));
        }
        let n = buf.len().min(self.pending.len());
        for (slot, byte) in buf.iter_mut().zip(self.pending.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}
