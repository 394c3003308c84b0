// src/io/mod.rs
//
// Device-side plumbing and the shared runtime types that flow from the
// serial link through the decoder to the publishers.

mod error;
pub mod serial;

pub use error::{BridgeError, ValidationError};
pub use serial::{
    list_serial_ports, DeviceConnector, DeviceLink, FramingEncoding, Parity, SerialConnector,
    SerialLineSettings, SerialPortInfo,
};

use serde::Serialize;
use std::sync::{Arc, RwLock};

// ============================================================================
// Weight Reading
// ============================================================================

/// Wire format a frame was recognised as.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameFormat {
    /// `ppppppp` + `iiiii`: 7 weight digits (5 integer + 2 fractional kg) and a status token
    FixedStatus,
    /// `<flag> I <ddddd>.<dd>kg`
    LabeledStability,
    /// Digits only, integer grams
    BareDigits,
    /// First run of digits anywhere in the line (permissive mode only)
    FirstNumber,
}

impl FrameFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            FrameFormat::FixedStatus => "fixed_status",
            FrameFormat::LabeledStability => "labeled_stability",
            FrameFormat::BareDigits => "bare_digits",
            FrameFormat::FirstNumber => "first_number",
        }
    }
}

/// Why a reading is not usable as a weight.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Anomaly {
    /// Scale is still settling
    Unstable,
    /// Load exceeds capacity
    Overload,
    /// Non-zero value under the zero/negative status: a negative weight the scale cannot show
    Negative,
    /// Status token outside the known set
    UnknownStatus,
    /// No known framing matched
    Unparsable,
}

/// One decoded frame. Built by the decoder, never mutated afterwards; the
/// next frame supersedes it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct WeightReading {
    grams: u64,
    valid: bool,
    raw: Vec<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<FrameFormat>,
    #[serde(skip_serializing_if = "Option::is_none")]
    anomaly: Option<Anomaly>,
}

impl WeightReading {
    pub fn valid(grams: u64, raw: &[u8], format: FrameFormat) -> Self {
        Self {
            grams,
            valid: true,
            raw: raw.to_vec(),
            format: Some(format),
            anomaly: None,
        }
    }

    /// A recognised frame whose status marks the value as unusable. The
    /// decoded grams are kept for diagnostics; consumers see the reading as invalid.
    pub fn rejected(grams: u64, raw: &[u8], format: FrameFormat, anomaly: Anomaly) -> Self {
        Self {
            grams,
            valid: false,
            raw: raw.to_vec(),
            format: Some(format),
            anomaly: Some(anomaly),
        }
    }

    pub fn unparsable(raw: &[u8]) -> Self {
        Self {
            grams: 0,
            valid: false,
            raw: raw.to_vec(),
            format: None,
            anomaly: Some(Anomaly::Unparsable),
        }
    }

    pub fn grams(&self) -> u64 {
        self.grams
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn format(&self) -> Option<FrameFormat> {
        self.format
    }

    pub fn anomaly(&self) -> Option<Anomaly> {
        self.anomaly
    }

    /// Weight as published to clients: grams when valid, 0 otherwise.
    pub fn published_grams(&self) -> u64 {
        if self.valid {
            self.grams
        } else {
            0
        }
    }
}

// ============================================================================
// Latest Reading
// ============================================================================

/// Writer side of the session's latest reading. Only the session holds one.
#[derive(Clone, Default)]
pub(crate) struct LatestReading {
    slot: Arc<RwLock<Option<WeightReading>>>,
}

impl LatestReading {
    pub(crate) fn set(&self, reading: WeightReading) {
        match self.slot.write() {
            Ok(mut guard) => *guard = Some(reading),
            Err(poisoned) => *poisoned.into_inner() = Some(reading),
        }
    }

    pub(crate) fn clear(&self) {
        match self.slot.write() {
            Ok(mut guard) => *guard = None,
            Err(poisoned) => *poisoned.into_inner() = None,
        }
    }

    pub(crate) fn view(&self) -> ReadingView {
        ReadingView {
            slot: self.slot.clone(),
        }
    }
}

/// Read-only handle on the latest reading, handed to publishers.
/// Readers always get a copy.
#[derive(Clone, Default)]
pub struct ReadingView {
    slot: Arc<RwLock<Option<WeightReading>>>,
}

impl ReadingView {
    pub fn snapshot(&self) -> Option<WeightReading> {
        match self.slot.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Grams to publish right now: 0 when there is no reading or it is invalid.
    pub fn published_grams(&self) -> u64 {
        self.snapshot().map(|r| r.published_grams()).unwrap_or(0)
    }
}

// ============================================================================
// Session State
// ============================================================================

/// Lifecycle state of a connection session
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "message")]
pub enum SessionState {
    Closed,
    Opening,
    Open,
    Failed(String),
}

impl SessionState {
    pub fn is_open(&self) -> bool {
        matches!(self, SessionState::Open)
    }
}
