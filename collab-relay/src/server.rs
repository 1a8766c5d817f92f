//! HTTP front door: WebSocket upgrades become sessions, plain HTTP gets the
//! liveness string.
//!
//! ```text
//!                 axum::serve
//! listener ─────────► fallback handler
//!                        │
//!          ┌─────────────┴──────────────┐
//!   WebSocketUpgrade               anything else
//!          │                            │
//!   on_upgrade (room key =         200 text/plain
//!   path + query)                   health body
//!          │
//!   Session::admit → Session::run
//! ```

use axum::extract::ws::{self, WebSocket};
use axum::extract::{ConnectInfo, OriginalUri, State, WebSocketUpgrade};
use axum::http::Uri;
use axum::response::{IntoResponse, Response};
use axum::Router;
use futures_util::{future, SinkExt, StreamExt};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tower_http::timeout::TimeoutLayer;

use crate::config::RelayConfig;
use crate::error::Result;
use crate::registry::RoomRegistry;
use crate::session::Session;

/// Snapshot of relay counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStatsSnapshot {
    pub total_connections: u64,
    pub active_connections: u64,
    pub frames_relayed: u64,
    pub deliveries: u64,
    pub failed_deliveries: u64,
    pub malformed_frames: u64,
    pub evictions: u64,
    pub health_checks: u64,
}

/// Relay counters. Lock-free; read via [`RelayStats::snapshot`].
#[derive(Debug, Default)]
pub struct RelayStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    frames_relayed: AtomicU64,
    deliveries: AtomicU64,
    failed_deliveries: AtomicU64,
    malformed_frames: AtomicU64,
    evictions: AtomicU64,
    health_checks: AtomicU64,
}

impl RelayStats {
    pub fn record_connected(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_disconnected(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_relayed(&self, delivered: usize, failed: usize) {
        self.frames_relayed.fetch_add(1, Ordering::Relaxed);
        self.deliveries.fetch_add(delivered as u64, Ordering::Relaxed);
        self.failed_deliveries.fetch_add(failed as u64, Ordering::Relaxed);
    }

    pub fn record_malformed(&self) {
        self.malformed_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_health_check(&self) {
        self.health_checks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RelayStatsSnapshot {
        RelayStatsSnapshot {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            frames_relayed: self.frames_relayed.load(Ordering::Relaxed),
            deliveries: self.deliveries.load(Ordering::Relaxed),
            failed_deliveries: self.failed_deliveries.load(Ordering::Relaxed),
            malformed_frames: self.malformed_frames.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            health_checks: self.health_checks.load(Ordering::Relaxed),
        }
    }
}

/// State shared by every request handler.
struct AppState {
    config: RelayConfig,
    registry: Arc<RoomRegistry>,
    stats: Arc<RelayStats>,
}

/// The relay server.
pub struct RelayServer {
    state: Arc<AppState>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            state: Arc::new(AppState {
                config,
                registry: Arc::new(RoomRegistry::new()),
                stats: Arc::new(RelayStats::default()),
            }),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    pub fn bind_addr(&self) -> &str {
        &self.state.config.bind_addr
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.state.registry
    }

    pub fn stats(&self) -> RelayStatsSnapshot {
        self.state.stats.snapshot()
    }

    /// Every path is a room, so the whole surface is one fallback handler.
    fn router(&self) -> Router {
        Router::new()
            .fallback(handle_request)
            .with_state(self.state.clone())
            .layer(TimeoutLayer::new(self.state.config.handshake_timeout))
    }

    /// Bind `bind_addr` and serve until Ctrl-C.
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.state.config.bind_addr).await?;
        let addr = listener.local_addr()?;
        log::info!("Relay listening on {addr}");
        log::info!("- HTTP: http://{addr}");
        log::info!("- WebSocket: ws://{addr}/<room>");

        self.serve_until(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::warn!("Failed to install Ctrl-C handler: {e}");
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Serve connections from an already-bound listener forever.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        self.serve_until(listener, std::future::pending()).await
    }

    /// Serve connections until `shutdown` resolves.
    ///
    /// Upgraded sessions run on their own tasks and are not waited for.
    pub async fn serve_until<F>(&self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let app = self
            .router()
            .into_make_service_with_connect_info::<SocketAddr>();
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await?;

        log::info!("Relay shutting down");
        Ok(())
    }
}

/// Upgrade requests join the room named by their target; everything else is
/// a health check.
async fn handle_request(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    OriginalUri(uri): OriginalUri,
    upgrade: Option<WebSocketUpgrade>,
) -> Response {
    let Some(upgrade) = upgrade else {
        state.stats.record_health_check();
        log::debug!("Health check from {addr}");
        return state.config.health_body.clone().into_response();
    };

    let room_key = request_target(&uri);
    upgrade
        .on_upgrade(move |socket| run_session(socket, addr, room_key, state))
        .into_response()
}

async fn run_session(socket: WebSocket, addr: SocketAddr, room_key: String, state: Arc<AppState>) {
    state.stats.record_connected();
    log::info!("WebSocket connection from {addr} for room {room_key:?}");

    let socket = socket
        .with(|frame: Message| future::ready(Ok::<_, axum::Error>(to_axum(frame))))
        .map(|inbound| inbound.map(from_axum));

    let session = Session::admit(
        state.registry.clone(),
        state.stats.clone(),
        &room_key,
        Some(addr),
        state.config.outbound_capacity,
        state.config.send_timeout,
    )
    .await;
    session.run(socket).await;

    state.stats.record_disconnected();
}

/// Room key for an upgrade: the raw request target, query included.
fn request_target(uri: &Uri) -> String {
    uri.path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| uri.path().to_string())
}

fn from_axum(frame: ws::Message) -> Message {
    match frame {
        ws::Message::Text(text) => Message::text(text),
        ws::Message::Binary(data) => Message::binary(data),
        ws::Message::Ping(data) => Message::Ping(data.into()),
        ws::Message::Pong(data) => Message::Pong(data.into()),
        ws::Message::Close(close) => Message::Close(close.map(|c| CloseFrame {
            code: CloseCode::from(c.code),
            reason: c.reason.into_owned().into(),
        })),
    }
}

fn to_axum(frame: Message) -> ws::Message {
    match frame {
        Message::Text(text) => ws::Message::Text(text.as_str().to_owned()),
        Message::Ping(data) => ws::Message::Ping(data.to_vec()),
        Message::Pong(data) => ws::Message::Pong(data.to_vec()),
        Message::Close(close) => ws::Message::Close(close.map(|c| ws::CloseFrame {
            code: u16::from(c.code),
            reason: c.reason.as_str().to_owned().into(),
        })),
        other => ws::Message::Binary(other.into_data().to_vec()),
    }
}
