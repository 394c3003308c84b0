// src/scale/mod.rs
//
// Scale protocol: frame decoding, poll scheduling and the connection
// session that ties them to a device link.

pub mod decoder;
pub mod scheduler;
pub mod session;
pub mod simulated;

pub use decoder::{
    DecodeObserver, DecoderConfig, DecoderMode, FrameDecoder, LabeledFlagPolicy, SilentObserver,
};
pub use scheduler::{PollObserver, PollScheduler, RequestSink, SubmitOutcome};
pub use session::{ConnectionConfig, ConnectionSession, SessionObserver, SessionObservers};
pub use simulated::SimulatedConnector;

use crate::io::{BridgeError, FrameFormat, SessionState, WeightReading};
use crate::logging::describe_bytes;

/// Observer that writes every event to the log
#[derive(Clone, Copy, Debug, Default)]
pub struct LogObserver {
    /// Also log each matched frame (noisy at short poll intervals)
    pub verbose: bool,
}

impl DecodeObserver for LogObserver {
    fn format_matched(&self, format: FrameFormat, reading: &WeightReading) {
        if self.verbose || !reading.is_valid() {
            tlog!(
                "[Decoder] {} -> {} g valid={} anomaly={:?} raw={}",
                format.as_str(),
                reading.grams(),
                reading.is_valid(),
                reading.anomaly(),
                describe_bytes(reading.raw())
            );
        }
    }

    fn frame_rejected(&self, raw: &[u8]) {
        tlog!("[Decoder] Unrecognised frame {}", describe_bytes(raw));
    }
}

impl PollObserver for LogObserver {
    fn poll_skipped(&self) {
        if self.verbose {
            tlog!("[Poll] Previous request still in flight, skipping tick");
        }
    }
}

impl SessionObserver for LogObserver {
    fn state_changed(&self, device_path: &str, state: &SessionState) {
        match state {
            SessionState::Failed(reason) => {
                tlog!("[Session] {} -> Failed: {}", device_path, reason)
            }
            other => tlog!("[Session] {} -> {:?}", device_path, other),
        }
    }

    fn write_failed(&self, device_path: &str, reason: &str) {
        tlog!("[Session] Poll write to {} failed: {}", device_path, reason);
    }

    fn runtime_error(&self, error: &BridgeError) {
        tlog!("[Session] {}", error);
    }
}
