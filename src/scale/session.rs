// src/scale/session.rs
//
// Connection session: owns one scale connection at a time.
//
// State machine:
//   Closed --open()--> Opening --device open--> Open --close()--> Closed
//   Opening/Open --device error--> Failed (terminal until the next open())
//
// The session owns the device I/O worker, the poll scheduler and the event
// pump that decodes frames and hands readings to the publisher. Every open()
// and close() bumps an epoch counter; work started under an older epoch
// (a pending open, a late frame, a late error) is discarded when it lands.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use super::decoder::{DecodeObserver, DecoderConfig, FrameDecoder, SilentObserver};
use super::scheduler::{PollObserver, PollScheduler};
use crate::io::serial::reader::{DeviceEvent, DeviceIo};
use crate::io::{
    BridgeError, DeviceConnector, FramingEncoding, LatestReading, ReadingView, SerialLineSettings,
    SessionState, ValidationError,
};
use crate::publish::ReadingPublisher;

/// Pending device events between the I/O worker and the pump
const EVENT_CHANNEL_CAPACITY: usize = 64;

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_request_frame() -> Vec<u8> {
    // ENQ
    vec![0x05]
}

fn default_open_timeout_ms() -> u64 {
    3_000
}

// ============================================================================
// Configuration
// ============================================================================

/// Everything needed to open one connection. Immutable once handed to open().
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub device_path: String,
    pub baud_rate: u32,
    pub line: SerialLineSettings,
    pub poll_interval_ms: u64,
    pub request_frame: Vec<u8>,
    pub framing: FramingEncoding,
    pub decoder: DecoderConfig,
    pub open_timeout_ms: u64,
}

impl ConnectionConfig {
    pub fn new(device_path: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            device_path: device_path.into(),
            baud_rate,
            line: SerialLineSettings::default(),
            poll_interval_ms: default_poll_interval_ms(),
            request_frame: default_request_frame(),
            framing: FramingEncoding::default(),
            decoder: DecoderConfig::default(),
            open_timeout_ms: default_open_timeout_ms(),
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.device_path.trim().is_empty() {
            return Err(ValidationError::EmptyDevicePath);
        }
        if self.baud_rate == 0 {
            return Err(ValidationError::InvalidBaudRate(self.baud_rate.to_string()));
        }
        self.line.validate()?;
        if self.poll_interval_ms == 0 {
            return Err(ValidationError::InvalidPollInterval(
                self.poll_interval_ms.to_string(),
            ));
        }
        if self.request_frame.is_empty() {
            return Err(ValidationError::InvalidRequestFrame(String::new()));
        }
        if self.open_timeout_ms == 0 {
            return Err(ValidationError::InvalidOpenTimeout(
                self.open_timeout_ms.to_string(),
            ));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }
}

// ============================================================================
// Observers
// ============================================================================

/// Lifecycle notifications. All methods default to no-ops.
pub trait SessionObserver: Send + Sync {
    fn state_changed(&self, _device_path: &str, _state: &SessionState) {}
    fn write_failed(&self, _device_path: &str, _reason: &str) {}
    /// Device failed after open; nobody is waiting on a result any more
    fn runtime_error(&self, _error: &BridgeError) {}
}

impl SessionObserver for SilentObserver {}
impl PollObserver for SilentObserver {}

/// The observer hooks a session hands to its parts
#[derive(Clone)]
pub struct SessionObservers {
    session: Arc<dyn SessionObserver>,
    decode: Arc<dyn DecodeObserver>,
    poll: Arc<dyn PollObserver>,
}

impl SessionObservers {
    pub fn silent() -> Self {
        Self::from_one(Arc::new(SilentObserver))
    }

    /// Use one object for every hook
    pub fn from_one<O>(observer: Arc<O>) -> Self
    where
        O: SessionObserver + DecodeObserver + PollObserver + 'static,
    {
        Self {
            session: observer.clone(),
            decode: observer.clone(),
            poll: observer,
        }
    }
}

// ============================================================================
// Session
// ============================================================================

/// State the event pump shares with the session
struct Shared {
    state: RwLock<SessionState>,
    latest: LatestReading,
    epoch: watch::Sender<u64>,
    observers: SessionObservers,
    publisher: Arc<dyn ReadingPublisher>,
}

impl Shared {
    fn state(&self) -> SessionState {
        match self.state.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set_state(&self, device_path: &str, state: SessionState) {
        match self.state.write() {
            Ok(mut guard) => *guard = state.clone(),
            Err(poisoned) => *poisoned.into_inner() = state.clone(),
        }
        self.observers.session.state_changed(device_path, &state);
    }

    fn current_epoch(&self) -> u64 {
        *self.epoch.borrow()
    }

    /// Invalidate everything started under the current epoch
    fn bump_epoch(&self) -> u64 {
        let mut next = 0;
        self.epoch.send_modify(|epoch| {
            *epoch += 1;
            next = *epoch;
        });
        next
    }
}

/// Resources of an open connection
struct ActiveLink {
    device_path: String,
    scheduler: PollScheduler,
    io: DeviceIo,
    pump: JoinHandle<()>,
}

impl ActiveLink {
    /// Stop polling first so nothing is written to a closing handle,
    /// then release the handle, then drop the pump.
    async fn shutdown(self) {
        self.scheduler.stop().await;
        self.io.stop().await;
        self.pump.abort();
        let _ = self.pump.await;
        tlog!("[Session] Released {}", self.device_path);
    }

    /// Best-effort stop when there is no runtime left to await on
    fn abort(self) {
        let _ = self.scheduler.stopper().send(true);
        self.io.cancel();
        self.pump.abort();
    }
}

pub struct ConnectionSession {
    connector: Arc<dyn DeviceConnector>,
    shared: Arc<Shared>,
    lifecycle: Mutex<Option<ActiveLink>>,
    live_schedulers: Arc<AtomicUsize>,
}

impl ConnectionSession {
    pub fn new(connector: Arc<dyn DeviceConnector>, publisher: Arc<dyn ReadingPublisher>) -> Self {
        Self::with_observers(connector, publisher, SessionObservers::silent())
    }

    pub fn with_observers(
        connector: Arc<dyn DeviceConnector>,
        publisher: Arc<dyn ReadingPublisher>,
        observers: SessionObservers,
    ) -> Self {
        let (epoch, _) = watch::channel(0u64);
        Self {
            connector,
            shared: Arc::new(Shared {
                state: RwLock::new(SessionState::Closed),
                latest: LatestReading::default(),
                epoch,
                observers,
                publisher,
            }),
            lifecycle: Mutex::new(None),
            live_schedulers: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Read-only view of the latest reading
    pub fn latest(&self) -> ReadingView {
        self.shared.latest.view()
    }

    /// Poll schedulers currently running for this session (0 or 1)
    pub fn live_schedulers(&self) -> usize {
        self.live_schedulers.load(Ordering::SeqCst)
    }

    pub fn connector_kind(&self) -> &'static str {
        self.connector.kind()
    }

    /// Open the device and start polling.
    ///
    /// Configuration is validated before anything is touched. Any previous
    /// connection is torn down first. Returns `Cancelled` when a close() or a
    /// newer open() arrives while this one is still waiting on the device.
    pub async fn open(&self, config: ConnectionConfig) -> Result<(), BridgeError> {
        config.validate()?;

        let epoch = self.shared.bump_epoch();
        let mut cancelled = self.shared.epoch.subscribe();

        let mut lifecycle = self.lifecycle.lock().await;
        if self.shared.current_epoch() != epoch {
            return Err(BridgeError::Cancelled);
        }

        if let Some(previous) = lifecycle.take() {
            tlog!(
                "[Session] Re-open: tearing down {} before opening {}",
                previous.device_path,
                config.device_path
            );
            previous.shutdown().await;
        }

        let path = config.device_path.clone();
        self.shared.latest.clear();
        self.shared.set_state(&path, SessionState::Opening);

        let connect = tokio::time::timeout(config.open_timeout(), self.connector.connect(&config));
        let outcome = tokio::select! {
            result = connect => match result {
                Ok(result) => result,
                Err(_) => Err(BridgeError::device_open(
                    &path,
                    format!("timed out after {} ms", config.open_timeout_ms),
                )),
            },
            _ = cancelled.changed() => Err(BridgeError::Cancelled),
        };

        let link = match outcome {
            Ok(link) => link,
            Err(BridgeError::Cancelled) => return Err(BridgeError::Cancelled),
            Err(e) => {
                if self.shared.current_epoch() == epoch {
                    self.shared.set_state(&path, SessionState::Failed(e.to_string()));
                }
                return Err(e);
            }
        };

        // Superseded while the connector was finishing: the link drops here
        if self.shared.current_epoch() != epoch {
            return Err(BridgeError::Cancelled);
        }

        self.shared.set_state(&path, SessionState::Open);

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (io, requests) = DeviceIo::spawn(link, config.framing.clone(), events_tx);
        let scheduler = PollScheduler::start(
            config.poll_interval(),
            config.request_frame.clone(),
            Arc::new(requests),
            self.shared.observers.poll.clone(),
            self.live_schedulers.clone(),
        );
        let decoder = FrameDecoder::new(config.decoder.clone())
            .with_observer(self.shared.observers.decode.clone());
        let pump = tokio::spawn(run_event_pump(
            self.shared.clone(),
            epoch,
            path.clone(),
            decoder,
            events_rx,
            scheduler.stopper(),
        ));

        tlog!(
            "[Session] Polling {} every {} ms with {}",
            path,
            config.poll_interval_ms,
            crate::logging::describe_bytes(&config.request_frame)
        );

        *lifecycle = Some(ActiveLink {
            device_path: path,
            scheduler,
            io,
            pump,
        });
        Ok(())
    }

    /// Stop polling, release the device and reset the latest reading.
    /// Cancels a pending open(). Closing a closed session does nothing.
    pub async fn close(&self) {
        self.shared.bump_epoch();

        let mut lifecycle = self.lifecycle.lock().await;
        let active = lifecycle.take();
        let path = active
            .as_ref()
            .map(|a| a.device_path.clone())
            .unwrap_or_default();

        if let Some(active) = active {
            active.shutdown().await;
        }

        self.shared.latest.clear();
        if self.shared.state() != SessionState::Closed {
            self.shared.set_state(&path, SessionState::Closed);
        }
    }
}

impl Drop for ConnectionSession {
    fn drop(&mut self) {
        if let Some(active) = self.lifecycle.get_mut().take() {
            active.abort();
        }
    }
}

/// Decode frames from the worker and publish each reading once.
/// Exits on a connection-level failure, which also stops the scheduler.
async fn run_event_pump(
    shared: Arc<Shared>,
    epoch: u64,
    device_path: String,
    decoder: FrameDecoder,
    mut events: mpsc::Receiver<DeviceEvent>,
    stop_polling: Arc<watch::Sender<bool>>,
) {
    while let Some(event) = events.recv().await {
        if shared.current_epoch() != epoch {
            break;
        }

        match event {
            DeviceEvent::Frame(raw) => {
                let reading = decoder.decode(&raw);
                shared.latest.set(reading.clone());
                shared.publisher.publish(&reading);
            }
            DeviceEvent::WriteFailed(reason) => {
                shared.observers.session.write_failed(&device_path, &reason);
            }
            DeviceEvent::Failed(reason) => {
                let _ = stop_polling.send(true);
                shared.latest.clear();
                shared.set_state(&device_path, SessionState::Failed(reason.clone()));
                shared
                    .observers
                    .session
                    .runtime_error(&BridgeError::device_runtime(&device_path, reason));
                break;
            }
        }
    }
}
