// src/publish/http.rs
//
// HTTP endpoint: `GET /peso` returns the latest reading as
// `{"data":{"peso":N}}`. Pull-based, no decoding happens here.
// Responses carry permissive CORS headers so browser pages on any origin
// can poll the scale.

use rocket::config::LogLevel;
use rocket::fairing::{AdHoc, Fairing, Info, Kind};
use rocket::figment::Figment;
use rocket::http::Header;
use rocket::serde::json::Json;
use rocket::{get, options, routes, Build, Ignite, Request, Response, Rocket, Shutdown, State};
use std::path::PathBuf;
use std::sync::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::PesoPayload;
use crate::io::{BridgeError, ReadingView};

const TRANSPORT: &str = "HTTP";

// ============================================================================
// CORS
// ============================================================================

/// Adds CORS headers to every response
pub struct Cors;

#[rocket::async_trait]
impl Fairing for Cors {
    fn info(&self) -> Info {
        Info {
            name: "Add CORS headers to responses",
            kind: Kind::Response,
        }
    }

    async fn on_response<'r>(&self, _request: &'r Request<'_>, response: &mut Response<'r>) {
        response.set_header(Header::new("Access-Control-Allow-Origin", "*"));
        response.set_header(Header::new("Access-Control-Allow-Methods", "GET, OPTIONS"));
        response.set_header(Header::new("Access-Control-Allow-Headers", "*"));
    }
}

// ============================================================================
// Routes
// ============================================================================

#[get("/peso")]
fn peso(view: &State<ReadingView>) -> Json<PesoPayload> {
    Json(PesoPayload::from_grams(view.published_grams()))
}

/// Preflight requests; the CORS fairing fills in the headers
#[options("/<_path..>")]
fn preflight(_path: PathBuf) {}

pub fn build_rocket(figment: Figment, view: ReadingView) -> Rocket<Build> {
    rocket::custom(figment)
        .attach(Cors)
        .mount("/", routes![peso, preflight])
        .manage(view)
}

fn server_figment(bind_address: &str, port: u16) -> Figment {
    rocket::Config::figment()
        .merge(("address", bind_address))
        .merge(("port", port))
        .merge(("log_level", LogLevel::Off))
        // Ctrl-C belongs to the bridge, not to Rocket
        .merge(("shutdown.ctrlc", false))
        .merge(("shutdown.grace", 1))
        .merge(("shutdown.mercy", 1))
}

// ============================================================================
// Server
// ============================================================================

pub struct HttpServer {
    port: u16,
    shutdown: Shutdown,
    handle: JoinHandle<Result<Rocket<Ignite>, rocket::Error>>,
}

impl HttpServer {
    /// Bind and start serving. Resolves once the listener is up.
    pub async fn start(bind_address: &str, port: u16, view: ReadingView) -> Result<Self, BridgeError> {
        let transport_error = |reason: String| BridgeError::PublishTransport {
            transport: TRANSPORT,
            port,
            reason,
        };

        let (ready_tx, ready_rx) = oneshot::channel::<u16>();
        let ready_tx = Mutex::new(Some(ready_tx));

        let rocket = build_rocket(server_figment(bind_address, port), view).attach(AdHoc::on_liftoff(
            "Liftoff signal",
            move |rocket| {
                let tx = ready_tx.lock().ok().and_then(|mut guard| guard.take());
                let bound = rocket.config().port;
                Box::pin(async move {
                    if let Some(tx) = tx {
                        let _ = tx.send(bound);
                    }
                })
            },
        ));

        let ignited = rocket
            .ignite()
            .await
            .map_err(|e| transport_error(e.kind().to_string()))?;
        let shutdown = ignited.shutdown();
        let handle = tokio::spawn(ignited.launch());

        match ready_rx.await {
            Ok(bound) => {
                tlog!("[HTTP] Serving GET /peso on {}:{}", bind_address, bound);
                Ok(Self {
                    port: bound,
                    shutdown,
                    handle,
                })
            }
            // Launch failed before liftoff and dropped the signal
            Err(_) => {
                let reason = match handle.await {
                    Ok(Err(e)) => e.kind().to_string(),
                    Ok(Ok(_)) => "server exited before it was ready".to_string(),
                    Err(e) => format!("server task failed: {}", e),
                };
                tlog!("[HTTP] Failed to start on port {}: {}", port, reason);
                Err(transport_error(reason))
            }
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Stop accepting requests and wait for the server to wind down
    pub async fn stop(self) {
        self.shutdown.notify();
        match self.handle.await {
            Ok(Ok(_)) => tlog!("[HTTP] Server on port {} stopped", self.port),
            Ok(Err(e)) => tlog!("[HTTP] Server on port {} exited with error: {}", self.port, e.kind()),
            Err(e) => tlog!("[HTTP] Server task failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{FrameFormat, LatestReading, WeightReading};
    use rocket::http::Status;
    use rocket::local::asynchronous::Client;

    fn test_figment() -> Figment {
        rocket::Config::figment()
            .merge(("address", "127.0.0.1"))
            .merge(("port", 0))
            .merge(("log_level", LogLevel::Off))
    }

    #[rocket::async_test]
    async fn test_peso_reflects_latest_reading() {
        let latest = LatestReading::default();
        let client = Client::tracked(build_rocket(test_figment(), latest.view()))
            .await
            .unwrap();

        let response = client.get("/peso").dispatch().await;
        assert_eq!(response.status(), Status::Ok);
        assert_eq!(
            response.into_json::<PesoPayload>().await,
            Some(PesoPayload::from_grams(0))
        );

        latest.set(WeightReading::valid(252, b"00252", FrameFormat::BareDigits));
        let response = client.get("/peso").dispatch().await;
        assert_eq!(response.into_string().await.as_deref(), Some(r#"{"data":{"peso":252}}"#));

        latest.set(WeightReading::unparsable(b"garbage"));
        let response = client.get("/peso").dispatch().await;
        assert_eq!(
            response.into_json::<PesoPayload>().await,
            Some(PesoPayload::from_grams(0))
        );
    }

    #[rocket::async_test]
    async fn test_cors_headers_and_preflight() {
        let client = Client::tracked(build_rocket(test_figment(), ReadingView::default()))
            .await
            .unwrap();

        let response = client.get("/peso").dispatch().await;
        assert_eq!(
            response.headers().get_one("Access-Control-Allow-Origin"),
            Some("*")
        );

        let response = client.options("/peso").dispatch().await;
        assert_eq!(response.status(), Status::Ok);
        assert_eq!(
            response.headers().get_one("Access-Control-Allow-Methods"),
            Some("GET, OPTIONS")
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_bind_conflict_is_transport_error() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();

        match HttpServer::start("127.0.0.1", port, ReadingView::default()).await {
            Err(BridgeError::PublishTransport { transport, port: p, .. }) => {
                assert_eq!(transport, "HTTP");
                assert_eq!(p, port);
            }
            Ok(server) => {
                server.stop().await;
                panic!("expected bind failure");
            }
            Err(other) => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_start_and_stop() {
        let port = {
            let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            probe.local_addr().unwrap().port()
        };

        let server = HttpServer::start("127.0.0.1", port, ReadingView::default())
            .await
            .unwrap();
        assert_eq!(server.port(), port);
        assert!(tokio::net::TcpStream::connect(("127.0.0.1", port)).await.is_ok());

        server.stop().await;
    }
}
