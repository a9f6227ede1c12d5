//! WebSocket sync server with room-based routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐                     ┌─────────────────────────────┐
//!             ├── /ws/{room_id} ──►│ Session (one task each)     │
//! Client B ──┘                     │   verify ─► RoomGateway     │
//!                                  │   register ─► Registry      │
//!                                  │   dispatch ─► MessageRouter │
//!                                  └──────────┬──────────────────┘
//!                                             │ Broadcaster
//!                          ┌──────────────────┼──────────────────┐
//!                          ▼                  ▼                  ▼
//!                     outbox A           outbox B           outbox C
//!                     writer task        writer task        writer task
//!                          │                  │                  │
//!                       Client A           Client B          Client C
//! ```
//!
//! Each accepted socket gets:
//! - A bounded outbox drained by its own writer task
//! - A session task reading frames and driving the room lifecycle
//!
//! Rooms are never created here. Connecting to an unknown room id closes
//! the socket with code 1008 before any envelope is sent.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message, Utf8Bytes};
use tokio_util::sync::CancellationToken;

use crate::broadcast::BroadcastStats;
use crate::config::{ConfigError, SeedRoom};
use crate::connection::{CloseReason, Connection, ConnectionHandle, Frame};
use crate::gateway::RoomGateway;
use crate::registry::ConnectionRegistry;
use crate::router::{Incoming, TransportError};
use crate::session::{Session, SessionContext, SessionOutcome};

/// Path prefix every room endpoint lives under.
pub const ROOM_PATH_PREFIX: &str = "/ws/";

/// How long a finished connection waits for its writer before aborting it.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// How long the writer tries to deliver the close frame to the peer.
const CLOSE_SEND_TIMEOUT: Duration = Duration::from_secs(1);

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Outbound frames buffered per connection before it counts as failed
    pub outbox_capacity: usize,
    /// Close connections silent for this long (None = never)
    pub idle_timeout_secs: Option<u64>,
    /// RocksDB directory for room records (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// Rooms created at startup when the store is empty
    pub seed_rooms: Vec<SeedRoom>,
    /// Verbose logging
    pub debug: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8000".to_string(),
            outbox_capacity: 256,
            idle_timeout_secs: None,
            storage_path: None,
            seed_rooms: vec![SeedRoom::default()],
            debug: false,
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.outbox_capacity == 0 {
            return Err(ConfigError::Invalid("outbox_capacity must be greater than 0".into()));
        }
        if self.idle_timeout_secs == Some(0) {
            return Err(ConfigError::Invalid("idle_timeout_secs must be greater than 0".into()));
        }
        Ok(())
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs.map(Duration::from_secs)
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    /// Handshakes refused or sessions rejected during verification
    pub rejected_connections: u64,
    pub total_messages: u64,
    pub active_rooms: usize,
}

#[derive(Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    rejected_connections: AtomicU64,
    total_messages: AtomicU64,
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    ctx: SessionContext,
    stats: Arc<AtomicServerStats>,
}

impl SyncServer {
    /// Create a server over `gateway`. Fails if `config` does not validate.
    pub fn new(config: ServerConfig, gateway: Arc<dyn RoomGateway>) -> Result<Self, ServerError> {
        config.validate()?;
        let ctx = SessionContext::new(gateway, config.idle_timeout());
        Ok(Self {
            config,
            ctx,
            stats: Arc::new(AtomicServerStats::default()),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.ctx.registry
    }

    /// Bind to the configured address and serve until the process exits.
    pub async fn run(&self) -> Result<(), ServerError> {
        self.run_until(CancellationToken::new()).await
    }

    /// Bind to the configured address and serve until `shutdown` is cancelled.
    pub async fn run_until(&self, shutdown: CancellationToken) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", listener.local_addr()?);
        self.serve(listener, shutdown).await
    }

    /// Accept connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) -> Result<(), ServerError> {
        loop {
            let (stream, addr) = tokio::select! {
                _ = shutdown.cancelled() => {
                    log::info!("Sync server shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => accepted?,
            };
            log::debug!("New TCP connection from {addr}");

            let ctx = self.ctx.clone();
            let stats = self.stats.clone();
            let capacity = self.config.outbox_capacity;

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, ctx, stats, capacity).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        ctx: SessionContext,
        stats: Arc<AtomicServerStats>,
        capacity: usize,
    ) -> Result<(), ServerError> {
        let mut room_id = None;
        let handshake = tokio_tungstenite::accept_hdr_async(
            stream,
            |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                match parse_room_path(req.uri().path()) {
                    Some(id) => {
                        room_id = Some(id.to_string());
                        Ok(resp)
                    }
                    None => Err(not_found()),
                }
            },
        )
        .await;

        let ws_stream = match handshake {
            Ok(ws_stream) => ws_stream,
            Err(WsError::Http(response)) => {
                stats.rejected_connections.fetch_add(1, Ordering::Relaxed);
                log::info!("Refused connection from {addr}: HTTP {}", response.status());
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        let Some(room_id) = room_id else {
            return Ok(());
        };

        stats.total_connections.fetch_add(1, Ordering::Relaxed);
        stats.active_connections.fetch_add(1, Ordering::Relaxed);
        log::info!("WebSocket connection established from {addr} for room {room_id}");

        let (sink, source) = ws_stream.split();
        let (connection, outbox) = Connection::channel(capacity);
        let mut writer = tokio::spawn(write_frames(sink, outbox, connection.clone()));

        let inbound = inbound_frames(source, stats.clone());
        let outcome = Session::new(ctx, room_id, connection).run(inbound).await;

        if let SessionOutcome::Rejected(reason) = &outcome {
            stats.rejected_connections.fetch_add(1, Ordering::Relaxed);
            log::debug!("Session from {addr} rejected: {} {}", reason.code, reason.reason);
        }

        if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await.is_err() {
            log::warn!("Writer for {addr} did not finish in time; aborting");
            writer.abort();
        }

        stats.active_connections.fetch_sub(1, Ordering::Relaxed);
        log::info!("Connection closed from {addr}");
        Ok(())
    }

    /// Get current server statistics.
    pub fn stats(&self) -> ServerStats {
        ServerStats {
            total_connections: self.stats.total_connections.load(Ordering::Relaxed),
            active_connections: self.stats.active_connections.load(Ordering::Relaxed),
            rejected_connections: self.stats.rejected_connections.load(Ordering::Relaxed),
            total_messages: self.stats.total_messages.load(Ordering::Relaxed),
            active_rooms: self.ctx.registry.room_count(),
        }
    }

    pub fn broadcast_stats(&self) -> BroadcastStats {
        self.ctx.broadcaster.stats()
    }
}

/// Extract the room id from `/ws/{room_id}`.
fn parse_room_path(path: &str) -> Option<&str> {
    let room_id = path.strip_prefix(ROOM_PATH_PREFIX)?;
    if room_id.is_empty() || room_id.contains('/') {
        return None;
    }
    Some(room_id)
}

fn not_found() -> ErrorResponse {
    let mut response = ErrorResponse::new(Some("Not Found".to_string()));
    *response.status_mut() = StatusCode::NOT_FOUND;
    response
}

/// Adapt raw WebSocket messages into router input.
///
/// Ping/pong are answered by tungstenite itself and never reach the router.
fn inbound_frames<S>(
    source: S,
    stats: Arc<AtomicServerStats>,
) -> impl Stream<Item = Result<Incoming, TransportError>> + Send
where
    S: Stream<Item = Result<Message, WsError>> + Send,
{
    source.filter_map(move |msg| {
        let incoming = match msg {
            Ok(Message::Text(text)) => Some(Ok(Incoming::Text(text.to_string()))),
            Ok(Message::Binary(data)) => Some(Ok(Incoming::Binary(data.to_vec()))),
            Ok(Message::Close(_)) => Some(Ok(Incoming::Close)),
            Ok(_) => None,
            Err(e) => Some(Err(TransportError(e.to_string()))),
        };
        if matches!(incoming, Some(Ok(Incoming::Text(_) | Incoming::Binary(_)))) {
            stats.total_messages.fetch_add(1, Ordering::Relaxed);
        }
        futures_util::future::ready(incoming)
    })
}

/// Drain a connection's outbox into the socket until the connection is
/// closed, then send the close frame for its recorded reason.
///
/// Frames still queued at close are dropped. A send stuck on a peer that
/// stopped reading is abandoned as soon as the connection closes.
async fn write_frames<S>(mut sink: S, mut outbox: mpsc::Receiver<Frame>, connection: ConnectionHandle)
where
    S: futures_util::Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    loop {
        let frame = tokio::select! {
            biased;
            _ = connection.closed() => break,
            frame = outbox.recv() => frame,
        };
        let Some(Frame::Text(text)) = frame else {
            break;
        };
        tokio::select! {
            biased;
            _ = connection.closed() => break,
            sent = sink.send(Message::text(text.to_string())) => {
                if let Err(e) = sent {
                    log::debug!("Sink send error; writer task exiting: {e}");
                    return;
                }
            }
        }
    }

    let reason = connection.close_reason().unwrap_or(CloseReason::NORMAL);
    let close = async {
        sink.send(Message::Close(Some(close_frame(reason)))).await?;
        sink.close().await
    };
    match tokio::time::timeout(CLOSE_SEND_TIMEOUT, close).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => log::debug!("Failed to send close frame: {e}"),
        Err(_) => log::debug!("Peer did not accept close frame in time"),
    }
}

fn close_frame(reason: CloseReason) -> CloseFrame {
    CloseFrame {
        code: CloseCode::from(reason.code),
        reason: Utf8Bytes::from_static(reason.reason),
    }
}
