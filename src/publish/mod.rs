// src/publish/mod.rs
//
// Reading publishers: everything downstream of the session.
//
// Push-style consumers (WebSocket clients, the terminal display) implement
// ReadingPublisher and are called once per decoded frame. The HTTP endpoint
// is pull-style and reads the session's ReadingView at request time.

pub mod display;
pub mod http;
pub mod websocket;

pub use display::DisplaySink;
pub use http::HttpServer;
pub use websocket::WsServer;

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::io::{ValidationError, WeightReading};

/// Receives every decoded reading, in device order. Must not block.
pub trait ReadingPublisher: Send + Sync {
    fn publish(&self, reading: &WeightReading);

    /// Publisher identifier for log lines
    fn name(&self) -> &'static str;
}

/// Fans one reading out to several publishers
#[derive(Clone, Default)]
pub struct PublisherSet {
    publishers: Vec<Arc<dyn ReadingPublisher>>,
}

impl PublisherSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, publisher: Arc<dyn ReadingPublisher>) {
        self.publishers.push(publisher);
    }

    pub fn len(&self) -> usize {
        self.publishers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.publishers.is_empty()
    }
}

impl ReadingPublisher for PublisherSet {
    fn publish(&self, reading: &WeightReading) {
        for publisher in &self.publishers {
            publisher.publish(reading);
        }
    }

    fn name(&self) -> &'static str {
        "set"
    }
}

// ============================================================================
// Payload
// ============================================================================

/// `{"data":{"peso":N}}`, shared by HTTP and WebSocket so clients can use either
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PesoPayload {
    pub data: PesoData,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PesoData {
    /// Integer grams, 0 when there is no valid reading
    pub peso: u64,
}

impl PesoPayload {
    pub fn from_grams(grams: u64) -> Self {
        Self {
            data: PesoData { peso: grams },
        }
    }

    pub fn from_reading(reading: &WeightReading) -> Self {
        Self::from_grams(reading.published_grams())
    }

    pub fn to_json(&self) -> String {
        // Two integer fields; serialization cannot fail
        serde_json::to_string(self).unwrap_or_else(|_| format!("{{\"data\":{{\"peso\":{}}}}}", self.data.peso))
    }
}

// ============================================================================
// Publish Configuration
// ============================================================================

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

/// Publish side of a bridge start request
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublishConfig {
    pub http_port: Option<u16>,
    pub ws_port: Option<u16>,
    pub bind_address: String,
    /// Echo readings to the terminal
    pub display: bool,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            http_port: None,
            ws_port: None,
            bind_address: default_bind_address(),
            display: false,
        }
    }
}

impl PublishConfig {
    /// Turn raw port numbers into a config. Ports must be in 1..=65535.
    pub fn from_raw(
        http_port: Option<i64>,
        ws_port: Option<i64>,
        bind_address: Option<String>,
        display: bool,
    ) -> Result<Self, ValidationError> {
        let http_port = http_port
            .map(|p| checked_port(p).ok_or_else(|| ValidationError::InvalidHttpPort(p.to_string())))
            .transpose()?;
        let ws_port = ws_port
            .map(|p| checked_port(p).ok_or_else(|| ValidationError::InvalidWsPort(p.to_string())))
            .transpose()?;

        Ok(Self {
            http_port,
            ws_port,
            bind_address: bind_address.unwrap_or_else(default_bind_address),
            display,
        })
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.http_port == Some(0) {
            return Err(ValidationError::InvalidHttpPort("0".to_string()));
        }
        if self.ws_port == Some(0) {
            return Err(ValidationError::InvalidWsPort("0".to_string()));
        }
        Ok(())
    }
}

fn checked_port(port: i64) -> Option<u16> {
    u16::try_from(port).ok().filter(|p| *p > 0)
}
