// src/bridge.rs
//
// Start/stop surface of the bridge.
//
// start() validates everything up front, brings up the publish transports,
// then opens the scale. If any step fails, whatever already started is torn
// down before the error is returned. stop() closes the scale and the
// transports and may be called any number of times. A stop() that lands while
// a start() is still waiting on the device cancels it; that start() returns
// `Cancelled`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::io::{BridgeError, DeviceConnector, ReadingView, SerialConnector, SessionState};
use crate::publish::{DisplaySink, HttpServer, PublishConfig, PublisherSet, WsServer};
use crate::scale::{ConnectionConfig, ConnectionSession, LogObserver, SessionObservers};

/// Everything a successful start() brought up
#[derive(Default)]
struct Running {
    session: Option<Arc<ConnectionSession>>,
    http: Option<HttpServer>,
    ws: Option<Arc<WsServer>>,
}

impl Running {
    /// Scale first so nothing new is published into closing transports
    async fn shutdown(mut self) {
        if let Some(session) = self.session.take() {
            session.close().await;
        }
        if let Some(http) = self.http.take() {
            http.stop().await;
        }
        if let Some(ws) = self.ws.take() {
            ws.stop().await;
        }
    }
}

pub struct ScaleBridge {
    connector: Arc<dyn DeviceConnector>,
    observers: SessionObservers,
    running: Mutex<Option<Running>>,
    /// Held for the whole of start(); stop() never takes it
    starting: Mutex<()>,
    /// Session whose open() is in progress, reachable by stop()
    pending: std::sync::Mutex<Option<Arc<ConnectionSession>>>,
    /// Bumped by every stop(); a start() that sees it move gives up
    generation: AtomicU64,
}

impl Default for ScaleBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl ScaleBridge {
    /// Bridge on real serial ports, logging every event
    pub fn new() -> Self {
        Self::with_connector(Arc::new(SerialConnector))
    }

    pub fn with_connector(connector: Arc<dyn DeviceConnector>) -> Self {
        Self {
            connector,
            observers: SessionObservers::from_one(Arc::new(LogObserver::default())),
            running: Mutex::new(None),
            starting: Mutex::new(()),
            pending: std::sync::Mutex::new(None),
            generation: AtomicU64::new(0),
        }
    }

    pub fn with_observers(mut self, observers: SessionObservers) -> Self {
        self.observers = observers;
        self
    }

    fn swap_pending(&self, session: Option<Arc<ConnectionSession>>) -> Option<Arc<ConnectionSession>> {
        match self.pending.lock() {
            Ok(mut guard) => std::mem::replace(&mut *guard, session),
            Err(poisoned) => std::mem::replace(&mut *poisoned.into_inner(), session),
        }
    }

    fn superseded(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) != generation
    }

    /// Open the scale and start publishing. A running bridge is stopped first.
    pub async fn start(
        &self,
        connection: ConnectionConfig,
        publish: PublishConfig,
    ) -> Result<String, BridgeError> {
        connection.validate()?;
        publish.validate()?;

        let _starting = self.starting.lock().await;
        let generation = self.generation.load(Ordering::SeqCst);

        let previous = self.running.lock().await.take();
        if let Some(previous) = previous {
            tlog!("[Bridge] Restart requested, stopping running services");
            previous.shutdown().await;
        }

        tlog!(
            "[Bridge] Starting on {} ({} connector)",
            connection.device_path,
            self.connector.kind()
        );

        let mut starting = Running::default();
        let mut publishers = PublisherSet::new();

        if let Some(port) = publish.ws_port {
            match WsServer::start(&publish.bind_address, port).await {
                Ok(ws) => {
                    let ws = Arc::new(ws);
                    publishers.push(ws.clone());
                    starting.ws = Some(ws);
                }
                Err(e) => {
                    starting.shutdown().await;
                    return Err(e);
                }
            }
        }
        if publish.display {
            publishers.push(Arc::new(DisplaySink::new()));
        }

        let session = Arc::new(ConnectionSession::with_observers(
            self.connector.clone(),
            Arc::new(publishers),
            self.observers.clone(),
        ));

        if let Some(port) = publish.http_port {
            match HttpServer::start(&publish.bind_address, port, session.latest()).await {
                Ok(http) => starting.http = Some(http),
                Err(e) => {
                    starting.shutdown().await;
                    return Err(e);
                }
            }
        }

        // Publish the session before checking the generation, so a concurrent
        // stop() either shows up here or finds the session to close.
        self.swap_pending(Some(session.clone()));
        let opened = if self.superseded(generation) {
            Err(BridgeError::Cancelled)
        } else {
            session.open(connection.clone()).await
        };
        self.swap_pending(None);

        let mut running = self.running.lock().await;
        let opened = match opened {
            Ok(()) if self.superseded(generation) => Err(BridgeError::Cancelled),
            other => other,
        };
        if let Err(e) = opened {
            drop(running);
            tlog!("[Bridge] {}", e);
            session.close().await;
            starting.shutdown().await;
            return Err(e);
        }

        let message = start_message(&connection, &starting);
        starting.session = Some(session);
        *running = Some(starting);

        tlog!("[Bridge] {}", message);
        Ok(message)
    }

    /// Close the scale and stop every transport. Stopping a stopped bridge is fine.
    /// A start() still in progress is cancelled.
    pub async fn stop(&self) -> String {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(pending) = self.swap_pending(None) {
            tlog!("[Bridge] Cancelling start in progress");
            pending.close().await;
        }

        let previous = self.running.lock().await.take();
        if let Some(previous) = previous {
            previous.shutdown().await;
            tlog!("[Bridge] Services stopped");
        }
        "Services stopped".to_string()
    }

    /// Session state, `Closed` when the bridge is not running
    pub async fn state(&self) -> SessionState {
        match self.running.lock().await.as_ref().and_then(|r| r.session.as_ref()) {
            Some(session) => session.state(),
            None => SessionState::Closed,
        }
    }

    pub async fn latest(&self) -> Option<ReadingView> {
        self.running
            .lock()
            .await
            .as_ref()
            .and_then(|r| r.session.as_ref())
            .map(|s| s.latest())
    }
}

fn start_message(connection: &ConnectionConfig, running: &Running) -> String {
    let mut message = format!(
        "Connected to {} at {} baud",
        connection.device_path, connection.baud_rate
    );
    if let Some(http) = &running.http {
        message.push_str(&format!(", HTTP on port {}", http.port()));
    }
    if let Some(ws) = &running.ws {
        message.push_str(&format!(", WebSocket on port {}", ws.port()));
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::serial::mock::{wait_until, MockScale};
    use crate::io::ValidationError;
    use futures::StreamExt;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_tungstenite::{connect_async, tungstenite::Message};

    const WAIT: Duration = Duration::from_secs(3);

    fn bridge(scale: &Arc<MockScale>) -> ScaleBridge {
        ScaleBridge::with_connector(scale.clone()).with_observers(SessionObservers::silent())
    }

    fn connection() -> ConnectionConfig {
        ConnectionConfig {
            poll_interval_ms: 20,
            ..ConnectionConfig::new("/dev/mock0", 9600)
        }
    }

    fn local(http_port: Option<u16>, ws_port: Option<u16>) -> PublishConfig {
        PublishConfig {
            http_port,
            ws_port,
            bind_address: "127.0.0.1".to_string(),
            display: false,
        }
    }

    fn free_port() -> u16 {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        probe.local_addr().unwrap().port()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_start_and_stop() {
        let scale = MockScale::new();
        let bridge = bridge(&scale);

        let message = bridge.start(connection(), local(None, None)).await.unwrap();
        assert_eq!(message, "Connected to /dev/mock0 at 9600 baud");
        assert_eq!(bridge.state().await, SessionState::Open);

        assert_eq!(bridge.stop().await, "Services stopped");
        assert_eq!(bridge.stop().await, "Services stopped");
        assert_eq!(bridge.state().await, SessionState::Closed);
        assert_eq!(scale.live_links(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_validation_touches_nothing() {
        let scale = MockScale::new();
        let bridge = bridge(&scale);
        let ws_port = free_port();

        let err = bridge
            .start(ConnectionConfig::new("", 9600), local(None, Some(ws_port)))
            .await
            .unwrap_err();
        assert_eq!(err, BridgeError::Validation(ValidationError::EmptyDevicePath));

        let err = bridge
            .start(ConnectionConfig::new("/dev/mock0", 0), local(None, None))
            .await
            .unwrap_err();
        assert_eq!(err, BridgeError::Validation(ValidationError::InvalidBaudRate("0".into())));

        let err = bridge
            .start(connection(), local(Some(0), None))
            .await
            .unwrap_err();
        assert_eq!(err, BridgeError::Validation(ValidationError::InvalidHttpPort("0".into())));

        assert_eq!(scale.opens(), 0);
        // WS port never bound
        assert!(std::net::TcpListener::bind(("127.0.0.1", ws_port)).is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_ws_bind_failure_leaves_device_untouched() {
        let scale = MockScale::new();
        let bridge = bridge(&scale);
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();

        let err = bridge
            .start(connection(), local(None, Some(port)))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::PublishTransport { transport: "WebSocket", .. }));
        assert_eq!(scale.opens(), 0);
        assert_eq!(bridge.state().await, SessionState::Closed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_device_failure_tears_down_transports() {
        let scale = MockScale::new();
        scale.fail_open(true);
        let bridge = bridge(&scale);
        let ws_port = free_port();

        let err = bridge
            .start(connection(), local(None, Some(ws_port)))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::DeviceOpen { .. }));
        assert_eq!(bridge.state().await, SessionState::Closed);

        // Port released again
        assert!(tokio::net::TcpListener::bind(("127.0.0.1", ws_port)).await.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_cancels_start_waiting_on_device() {
        let scale = MockScale::new();
        scale.set_open_delay(Duration::from_secs(2));
        let bridge = Arc::new(bridge(&scale));
        let ws_port = free_port();

        let starter = {
            let bridge = bridge.clone();
            tokio::spawn(async move { bridge.start(connection(), local(None, Some(ws_port))).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        let begun = std::time::Instant::now();
        assert_eq!(bridge.stop().await, "Services stopped");
        assert!(begun.elapsed() < Duration::from_millis(500));

        let result = tokio::time::timeout(Duration::from_millis(500), starter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, Err(BridgeError::Cancelled));
        assert_eq!(scale.live_links(), 0);
        assert_eq!(bridge.state().await, SessionState::Closed);

        // Half-started WebSocket server was torn down
        assert!(tokio::net::TcpListener::bind(("127.0.0.1", ws_port)).await.is_ok());

        // The bridge starts normally afterwards
        scale.set_open_delay(Duration::ZERO);
        bridge.start(connection(), local(None, None)).await.unwrap();
        assert_eq!(bridge.state().await, SessionState::Open);
        bridge.stop().await;
        assert_eq!(scale.live_links(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_restart_keeps_one_device_handle() {
        let scale = MockScale::new();
        let bridge = bridge(&scale);

        bridge.start(connection(), local(None, None)).await.unwrap();
        bridge.start(connection(), local(None, None)).await.unwrap();

        assert_eq!(scale.opens(), 2);
        assert_eq!(scale.live_links(), 1);
        bridge.stop().await;
        assert_eq!(scale.live_links(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_readings_reach_http_and_websocket() {
        let scale = MockScale::new();
        let bridge = bridge(&scale);
        let (http_port, ws_port) = (free_port(), free_port());

        let message = bridge
            .start(connection(), local(Some(http_port), Some(ws_port)))
            .await
            .unwrap();
        assert!(message.contains(&format!("HTTP on port {}", http_port)));
        assert!(message.contains(&format!("WebSocket on port {}", ws_port)));

        let (mut client, _) = connect_async(format!("ws://127.0.0.1:{}", ws_port))
            .await
            .unwrap();
        // Give the server a moment to register the subscriber
        tokio::time::sleep(Duration::from_millis(50)).await;

        scale.push(b"00252\r\n");
        let latest = bridge.latest().await.unwrap();
        assert!(wait_until(WAIT, || latest.published_grams() == 252).await);

        let pushed = loop {
            match tokio::time::timeout(WAIT, client.next()).await {
                Ok(Some(Ok(Message::Text(text)))) => break text.as_str().to_string(),
                Ok(Some(Ok(_))) => continue,
                other => panic!("expected a reading, got {:?}", other),
            }
        };
        assert_eq!(pushed, r#"{"data":{"peso":252}}"#);

        let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", http_port))
            .await
            .unwrap();
        stream
            .write_all(b"GET /peso HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.ends_with(r#"{"data":{"peso":252}}"#));

        bridge.stop().await;
    }
}
