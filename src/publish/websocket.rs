// src/publish/websocket.rs
//
// WebSocket push: every connected client receives `{"data":{"peso":N}}`
// once per decoded frame. Readings go through a broadcast channel; a client
// that falls behind skips the readings it missed and carries on.

use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio_tungstenite::{accept_async, tungstenite::Message};

use super::{PesoPayload, ReadingPublisher};
use crate::io::{BridgeError, WeightReading};

const TRANSPORT: &str = "WebSocket";

/// Readings buffered per client before it starts skipping
const BROADCAST_CAPACITY: usize = 32;

pub struct WsServer {
    port: u16,
    tx: broadcast::Sender<String>,
    stop_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl WsServer {
    /// Bind the listener and start accepting clients
    pub async fn start(bind_address: &str, port: u16) -> Result<Self, BridgeError> {
        let listener = TcpListener::bind((bind_address, port)).await.map_err(|e| {
            BridgeError::PublishTransport {
                transport: TRANSPORT,
                port,
                reason: e.to_string(),
            }
        })?;
        let bound = listener.local_addr().map(|a| a.port()).unwrap_or(port);

        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(accept_loop(listener, tx.clone(), stop_rx));

        tlog!("[WS] Listening on {}:{}", bind_address, bound);

        Ok(Self {
            port: bound,
            tx,
            stop_tx,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Clients currently connected
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Close every client and the listener. Safe to call more than once.
    pub async fn stop(&self) {
        let _ = self.stop_tx.send(true);
        let handle = self.handle.lock().ok().and_then(|mut guard| guard.take());
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tlog!("[WS] Accept task failed: {}", e);
            }
            tlog!("[WS] Server on port {} stopped", self.port);
        }
    }
}

impl ReadingPublisher for WsServer {
    fn publish(&self, reading: &WeightReading) {
        // No subscribers is not an error
        let _ = self.tx.send(PesoPayload::from_reading(reading).to_json());
    }

    fn name(&self) -> &'static str {
        "websocket"
    }
}

async fn accept_loop(
    listener: TcpListener,
    tx: broadcast::Sender<String>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut clients = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    // Subscribe before the handshake so no reading is missed after connect
                    let readings = tx.subscribe();
                    clients.spawn(serve_client(stream, peer, readings, stop_rx.clone()));
                }
                Err(e) => tlog!("[WS] Accept failed: {}", e),
            },
            _ = stop_rx.changed() => break,
            Some(_) = clients.join_next(), if !clients.is_empty() => {}
        }
    }

    // Clients saw the stop signal too; wait for their close frames
    while clients.join_next().await.is_some() {}
}

async fn serve_client(
    stream: TcpStream,
    peer: SocketAddr,
    mut readings: broadcast::Receiver<String>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            tlog!("[WS] Handshake with {} failed: {}", peer, e);
            return;
        }
    };
    tlog!("[WS] Client {} connected", peer);

    let (mut sink, mut source) = ws.split();

    loop {
        tokio::select! {
            reading = readings.recv() => match reading {
                Ok(json) => {
                    if sink.send(Message::text(json)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tlog!("[WS] Client {} lagging, skipped {} readings", peer, skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = source.next() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                // Pings are answered by tungstenite; anything else is ignored
                Some(Ok(_)) => {}
            },
            _ = stop_rx.changed() => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
        }
    }

    tlog!("[WS] Client {} disconnected", peer);
}
