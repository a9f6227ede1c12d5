//! Live participant connection handle.
//!
//! A [`Connection`] is the server's side of one WebSocket. The transport
//! writer task owns the receiving end of its outbox; everything else
//! (session, registry, broadcaster) only pushes [`Frame`]s into it.
//! Pushing never blocks: a full or closed outbox is a delivery failure.
//!
//! Closing does not go through the outbox. The reason is stored on the
//! connection and the token is cancelled; the writer sends the close frame
//! itself, so a full outbox never swallows it.

use std::fmt;
use std::sync::{Arc, OnceLock};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::protocol::ServerEvent;

/// Shared handle to a connection.
pub type ConnectionHandle = Arc<Connection>;

/// Process-unique connection identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Close code and reason sent in the transport close frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseReason {
    pub code: u16,
    pub reason: &'static str,
}

impl CloseReason {
    /// The requested room does not exist (policy violation).
    pub const ROOM_NOT_FOUND: CloseReason = CloseReason { code: 1008, reason: "Room not found" };
    /// The room gateway failed while verifying the room.
    pub const INTERNAL_ERROR: CloseReason = CloseReason { code: 1011, reason: "Internal server error" };
    /// The connection stopped accepting deliveries and was evicted.
    pub const DELIVERY_FAILED: CloseReason = CloseReason { code: 1011, reason: "Delivery failed" };
    /// No inbound traffic within the configured idle timeout.
    pub const IDLE_TIMEOUT: CloseReason = CloseReason { code: 1001, reason: "Idle timeout" };
    /// Regular shutdown after the peer went away.
    pub const NORMAL: CloseReason = CloseReason { code: 1000, reason: "" };
}

/// Unit pushed into a connection's outbox.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Pre-encoded envelope text
    Text(Arc<str>),
}

/// Why a frame could not be queued.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DeliveryError {
    #[error("connection closed")]
    Closed,
    #[error("outbox full")]
    Full,
    #[error("failed to encode message: {0}")]
    Encode(String),
}

/// Server side of one participant's channel.
pub struct Connection {
    id: ConnectionId,
    outbox: mpsc::Sender<Frame>,
    shutdown: CancellationToken,
    close_reason: OnceLock<CloseReason>,
}

impl Connection {
    /// Wrap an outbox sender.
    pub fn new(outbox: mpsc::Sender<Frame>) -> Self {
        Self {
            id: ConnectionId::new(),
            outbox,
            shutdown: CancellationToken::new(),
            close_reason: OnceLock::new(),
        }
    }

    /// Create a connection with a fresh bounded outbox and return its receiving end.
    pub fn channel(capacity: usize) -> (ConnectionHandle, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Arc::new(Self::new(tx)), rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queue a frame without waiting.
    pub fn deliver(&self, frame: Frame) -> Result<(), DeliveryError> {
        if self.shutdown.is_cancelled() {
            return Err(DeliveryError::Closed);
        }
        self.outbox.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Full,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }

    /// Encode and queue a single event for this connection only.
    pub fn send_event(&self, event: ServerEvent) -> Result<(), DeliveryError> {
        let text = event
            .encode()
            .map_err(|e| DeliveryError::Encode(e.to_string()))?;
        self.deliver(Frame::Text(text))
    }

    /// Record `reason` and cancel the connection.
    ///
    /// Only the first call's reason is kept.
    pub fn close(&self, reason: CloseReason) {
        if self.close_reason.set(reason).is_err() {
            return;
        }
        self.shutdown.cancel();
    }

    /// Reason passed to the first [`Connection::close`], if any.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason.get().copied()
    }

    /// Whether [`Connection::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Resolves once the connection has been closed by the server side.
    pub async fn closed(&self) {
        self.shutdown.cancelled().await
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Connection {}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .field("close_reason", &self.close_reason())
            .finish()
    }
}
