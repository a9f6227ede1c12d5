//! Inbound frame dispatch for one connection.
//!
//! ```text
//! frame ──► decode ──┬─ error ───────────────► `error` to sender
//!                    ├─ code_update ─► persist ─┬─ ok ──► broadcast (excl. sender)
//!                    │                          └─ fail ► `error` to sender
//!                    ├─ cursor_position ──────► broadcast (excl. sender)
//!                    ├─ cursor_update ─► stamp ► broadcast (excl. sender)
//!                    └─ unknown ──────────────► `error` to sender
//! ```
//!
//! Nothing a client sends can end its session; only the transport closing,
//! the connection being evicted, or the idle timeout does.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{Stream, StreamExt};
use serde_json::Value;

use crate::broadcast::{announce_departures, BroadcastReport, Broadcaster};
use crate::connection::{ConnectionHandle, DeliveryError};
use crate::gateway::{GatewayError, RoomGateway};
use crate::protocol::{ClientEvent, ProtocolError, ServerEvent, MSG_SAVE_FAILED};
use crate::registry::ParticipantId;

/// Raw inbound transport message.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Text(String),
    Binary(Vec<u8>),
    /// Peer sent a close frame
    Close,
}

/// Transport read failure.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("transport error: {0}")]
pub struct TransportError(pub String);

/// The registered sender of a frame.
#[derive(Debug, Clone)]
pub struct Peer {
    pub connection: ConnectionHandle,
    pub room_id: String,
    pub participant_id: ParticipantId,
}

/// What the router did with one frame.
#[derive(Debug)]
pub enum Dispatch {
    Broadcast {
        kind: &'static str,
        report: BroadcastReport,
    },
    /// Malformed input; an `error` was sent back
    Rejected(ProtocolError),
    /// Persistence failed; an `error` was sent back and nothing was broadcast
    PersistFailed(GatewayError),
    /// Unrecognized type; an `error` was sent back
    UnknownType(String),
    /// Control frame with nothing to route
    Ignored,
}

/// Why the dispatch loop stopped.
#[derive(Debug, Clone, PartialEq)]
pub enum LoopExit {
    /// Peer closed the transport
    PeerClosed,
    Transport(TransportError),
    /// Server closed the connection (eviction)
    Evicted,
    IdleTimeout,
    /// The sender's own outbox stopped accepting frames
    SenderGone(DeliveryError),
}

pub struct MessageRouter {
    gateway: Arc<dyn RoomGateway>,
    broadcaster: Arc<Broadcaster>,
    idle_timeout: Option<Duration>,
}

impl MessageRouter {
    pub fn new(
        gateway: Arc<dyn RoomGateway>,
        broadcaster: Arc<Broadcaster>,
        idle_timeout: Option<Duration>,
    ) -> Self {
        Self {
            gateway,
            broadcaster,
            idle_timeout,
        }
    }

    /// Handle one inbound message.
    ///
    /// `Err` only when a reply to the sender cannot be queued, meaning the
    /// sender's connection is gone.
    pub async fn route(&self, peer: &Peer, incoming: Incoming) -> Result<Dispatch, DeliveryError> {
        let decoded = match incoming {
            Incoming::Text(text) => ClientEvent::decode(&text),
            Incoming::Binary(bytes) => ClientEvent::decode_bytes(&bytes),
            Incoming::Close => return Ok(Dispatch::Ignored),
        };

        let event = match decoded {
            Ok(event) => event,
            Err(e) => {
                log::warn!("Invalid frame from {} in room {}: {e}", peer.participant_id, peer.room_id);
                peer.connection
                    .send_event(ServerEvent::error(e.client_message()))?;
                return Ok(Dispatch::Rejected(e));
            }
        };

        match event {
            ClientEvent::CodeUpdate { code, data } => {
                if let Err(e) = self.gateway.persist_code(&peer.room_id, &code).await {
                    log::error!("Failed to update room {}: {e}", peer.room_id);
                    peer.connection.send_event(ServerEvent::error(MSG_SAVE_FAILED))?;
                    return Ok(Dispatch::PersistFailed(e));
                }
                let report = self.fan_out(peer, ServerEvent::CodeUpdate(data));
                log::debug!("Code updated in room {} by {}", peer.room_id, peer.participant_id);
                Ok(Dispatch::Broadcast {
                    kind: "code_update",
                    report,
                })
            }
            ClientEvent::CursorPosition(data) => Ok(Dispatch::Broadcast {
                kind: "cursor_position",
                report: self.fan_out(peer, ServerEvent::CursorPosition(data)),
            }),
            ClientEvent::CursorUpdate(mut data) => {
                data.insert(
                    "user_id".into(),
                    Value::String(peer.participant_id.to_string()),
                );
                data.insert(
                    "user_name".into(),
                    Value::String(peer.participant_id.display_name()),
                );
                Ok(Dispatch::Broadcast {
                    kind: "cursor_update",
                    report: self.fan_out(peer, ServerEvent::CursorUpdate(data)),
                })
            }
            ClientEvent::Unknown(kind) => {
                log::debug!("Unknown message type '{kind}' from room {}", peer.room_id);
                peer.connection
                    .send_event(ServerEvent::error(format!("Unknown message type: {kind}")))?;
                Ok(Dispatch::UnknownType(kind))
            }
        }
    }

    /// Broadcast excluding the sender, then announce anyone evicted by it.
    fn fan_out(&self, peer: &Peer, event: ServerEvent) -> BroadcastReport {
        let report = self
            .broadcaster
            .broadcast(&peer.room_id, event, Some(&peer.connection));
        if !report.evictions.is_empty() {
            announce_departures(&self.broadcaster, report.evictions.clone());
        }
        report
    }

    /// Route frames from `inbound` until the connection ends.
    pub async fn dispatch_loop<S>(&self, peer: &Peer, inbound: S) -> LoopExit
    where
        S: Stream<Item = Result<Incoming, TransportError>> + Send,
    {
        let mut inbound = std::pin::pin!(inbound);

        loop {
            let next = tokio::select! {
                biased;
                _ = peer.connection.closed() => return LoopExit::Evicted,
                next = Self::next_frame(&mut inbound, self.idle_timeout) => next,
            };

            let incoming = match next {
                None => return LoopExit::IdleTimeout,
                Some(None) | Some(Some(Ok(Incoming::Close))) => return LoopExit::PeerClosed,
                Some(Some(Err(e))) => return LoopExit::Transport(e),
                Some(Some(Ok(incoming))) => incoming,
            };

            if let Err(e) = self.route(peer, incoming).await {
                return LoopExit::SenderGone(e);
            }
        }
    }

    /// `None` on idle timeout, `Some(None)` at end of stream.
    async fn next_frame<S>(
        inbound: &mut std::pin::Pin<&mut S>,
        idle_timeout: Option<Duration>,
    ) -> Option<Option<Result<Incoming, TransportError>>>
    where
        S: Stream<Item = Result<Incoming, TransportError>>,
    {
        match idle_timeout {
            Some(limit) => tokio::time::timeout(limit, inbound.next()).await.ok(),
            None => Some(inbound.next().await),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Connection, Frame};
    use crate::gateway::StoreGateway;
    use crate::protocol::Envelope;
    use crate::registry::ConnectionRegistry;
    use crate::storage::{MemoryRoomStore, Room, RoomStore};
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    struct FailingGateway;

    #[async_trait]
    impl RoomGateway for FailingGateway {
        async fn fetch_snapshot(
            &self,
            _room_id: &str,
        ) -> Result<Option<crate::gateway::RoomSnapshot>, GatewayError> {
            Err(GatewayError::Unavailable("down".into()))
        }

        async fn persist_code(&self, _room_id: &str, _code: &str) -> Result<(), GatewayError> {
            Err(GatewayError::Unavailable("down".into()))
        }
    }

    struct Fixture {
        registry: Arc<ConnectionRegistry>,
        store: Arc<MemoryRoomStore>,
        router: MessageRouter,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryRoomStore::new());
        store.insert_room(Room::with_id("r1", "Room", None)).unwrap();
        let registry = Arc::new(ConnectionRegistry::new());
        let broadcaster = Arc::new(Broadcaster::new(registry.clone()));
        let router = MessageRouter::new(
            Arc::new(StoreGateway::new(store.clone())),
            broadcaster,
            None,
        );
        Fixture {
            registry,
            store,
            router,
        }
    }

    fn join(registry: &ConnectionRegistry) -> (Peer, mpsc::Receiver<Frame>) {
        let (connection, rx) = Connection::channel(16);
        let membership = registry.register("r1", connection.clone()).unwrap();
        (
            Peer {
                connection,
                room_id: "r1".into(),
                participant_id: membership.participant_id,
            },
            rx,
        )
    }

    fn next_envelope(rx: &mut mpsc::Receiver<Frame>) -> Option<Envelope> {
        match rx.try_recv() {
            Ok(Frame::Text(text)) => Some(Envelope::decode(&text).unwrap()),
            _ => None,
        }
    }

    fn text(s: &str) -> Incoming {
        Incoming::Text(s.to_string())
    }

    #[tokio::test]
    async fn test_code_update_persists_and_broadcasts() {
        let f = fixture();
        let (a, mut rx_a) = join(&f.registry);
        let (_b, mut rx_b) = join(&f.registry);

        let dispatch = f
            .router
            .route(&a, text(r#"{"type":"code_update","data":{"code":"x=1"}}"#))
            .await
            .unwrap();
        assert!(matches!(dispatch, Dispatch::Broadcast { kind: "code_update", ref report } if report.delivered == 1));

        let got = next_envelope(&mut rx_b).unwrap();
        assert_eq!(got.kind, "code_update");
        assert_eq!(got.data["code"], "x=1");
        assert!(next_envelope(&mut rx_a).is_none());
        assert_eq!(f.store.get_room("r1").unwrap().unwrap().code, "x=1");
    }

    #[tokio::test]
    async fn test_code_update_persist_failure_suppresses_broadcast() {
        let registry = Arc::new(ConnectionRegistry::new());
        let router = MessageRouter::new(
            Arc::new(FailingGateway),
            Arc::new(Broadcaster::new(registry.clone())),
            None,
        );
        let (a, mut rx_a) = join(&registry);
        let (_b, mut rx_b) = join(&registry);

        let dispatch = router
            .route(&a, text(r#"{"type":"code_update","data":{"code":"x=1"}}"#))
            .await
            .unwrap();
        assert!(matches!(dispatch, Dispatch::PersistFailed(_)));

        let err = next_envelope(&mut rx_a).unwrap();
        assert_eq!(err.kind, "error");
        assert_eq!(err.data["message"], "Failed to save code");
        assert!(next_envelope(&mut rx_b).is_none());
    }

    #[tokio::test]
    async fn test_code_update_for_deleted_room_is_save_failure() {
        let f = fixture();
        let (a, mut rx_a) = join(&f.registry);
        let (_b, mut rx_b) = join(&f.registry);
        f.store.delete_room("r1").unwrap();

        let dispatch = f
            .router
            .route(&a, text(r#"{"type":"code_update","data":{"code":"x"}}"#))
            .await
            .unwrap();
        assert!(matches!(dispatch, Dispatch::PersistFailed(GatewayError::RoomNotFound(_))));
        assert_eq!(next_envelope(&mut rx_a).unwrap().data["message"], "Failed to save code");
        assert!(next_envelope(&mut rx_b).is_none());
    }

    #[tokio::test]
    async fn test_code_update_missing_code() {
        let f = fixture();
        let (a, mut rx_a) = join(&f.registry);
        let (_b, mut rx_b) = join(&f.registry);

        let dispatch = f
            .router
            .route(&a, text(r#"{"type":"code_update","data":{"text":"x"}}"#))
            .await
            .unwrap();
        assert!(matches!(dispatch, Dispatch::Rejected(ProtocolError::InvalidCodeUpdate)));
        assert_eq!(
            next_envelope(&mut rx_a).unwrap().data["message"],
            "Invalid code_update format"
        );
        assert!(next_envelope(&mut rx_b).is_none());
        assert_eq!(
            f.store.get_room("r1").unwrap().unwrap().code,
            crate::storage::DEFAULT_CODE
        );
    }

    #[tokio::test]
    async fn test_invalid_json_yields_single_error() {
        let f = fixture();
        let (a, mut rx_a) = join(&f.registry);
        let (_b, mut rx_b) = join(&f.registry);

        f.router.route(&a, text("{{{ nope")).await.unwrap();

        let err = next_envelope(&mut rx_a).unwrap();
        assert_eq!(err.kind, "error");
        assert_eq!(err.data["message"], "Invalid JSON format");
        assert!(next_envelope(&mut rx_a).is_none());
        assert!(next_envelope(&mut rx_b).is_none());
        assert_eq!(f.registry.count_of("r1"), 2);
    }

    #[tokio::test]
    async fn test_cursor_position_broadcast_verbatim() {
        let f = fixture();
        let (a, mut rx_a) = join(&f.registry);
        let (_b, mut rx_b) = join(&f.registry);

        f.router
            .route(&a, text(r#"{"type":"cursor_position","data":{"line":2,"column":5}}"#))
            .await
            .unwrap();

        let got = next_envelope(&mut rx_b).unwrap();
        assert_eq!(got.kind, "cursor_position");
        assert_eq!(Value::Object(got.data), serde_json::json!({"line": 2, "column": 5}));
        assert!(next_envelope(&mut rx_a).is_none());
    }

    #[tokio::test]
    async fn test_cursor_update_is_stamped() {
        let f = fixture();
        let (a, _rx_a) = join(&f.registry);
        let (_b, mut rx_b) = join(&f.registry);

        f.router
            .route(
                &a,
                text(r#"{"type":"cursor_update","data":{"line":1,"user_id":"spoofed"}}"#),
            )
            .await
            .unwrap();

        let got = next_envelope(&mut rx_b).unwrap();
        assert_eq!(got.kind, "cursor_update");
        assert_eq!(got.data["line"], 1);
        assert_eq!(got.data["user_id"], a.participant_id.as_str());
        assert_eq!(got.data["user_name"], format!("User-{}", a.participant_id));
    }

    #[tokio::test]
    async fn test_unknown_type_replies_error() {
        let f = fixture();
        let (a, mut rx_a) = join(&f.registry);
        let (_b, mut rx_b) = join(&f.registry);

        let dispatch = f
            .router
            .route(&a, text(r#"{"type":"unknown_type","data":{}}"#))
            .await
            .unwrap();
        assert!(matches!(dispatch, Dispatch::UnknownType(ref k) if k == "unknown_type"));
        assert_eq!(
            next_envelope(&mut rx_a).unwrap().data["message"],
            "Unknown message type: unknown_type"
        );
        assert!(next_envelope(&mut rx_b).is_none());
    }

    #[tokio::test]
    async fn test_reply_to_dead_sender_is_error() {
        let f = fixture();
        let (a, rx_a) = join(&f.registry);
        drop(rx_a);

        let result = f.router.route(&a, text("garbage")).await;
        assert_eq!(result.unwrap_err(), DeliveryError::Closed);
    }

    #[tokio::test]
    async fn test_broadcast_eviction_is_announced() {
        let f = fixture();
        let (a, _rx_a) = join(&f.registry);
        let (b, mut rx_b) = join(&f.registry);
        let (dead, dead_rx) = join(&f.registry);
        drop(dead_rx);

        f.router
            .route(&a, text(r#"{"type":"cursor_position","data":{}}"#))
            .await
            .unwrap();

        assert_eq!(next_envelope(&mut rx_b).unwrap().kind, "cursor_position");
        let left = next_envelope(&mut rx_b).unwrap();
        assert_eq!(left.kind, "user_left");
        assert_eq!(left.data["user_id"], dead.participant_id.as_str());
        assert_eq!(left.data["user_count"], 2);
        assert!(f.registry.participant_of(&b.connection).is_some());
    }

    #[tokio::test]
    async fn test_dispatch_loop_survives_bad_input_until_close() {
        let f = fixture();
        let (a, mut rx_a) = join(&f.registry);

        let frames = futures_util::stream::iter(vec![
            Ok(text("nope")),
            Ok(text(r#"{"type":"mystery"}"#)),
            Ok(Incoming::Binary(vec![0xFF])),
            Ok(text(r#"{"type":"cursor_position","data":{}}"#)),
            Ok(Incoming::Close),
            Ok(text(r#"{"type":"mystery"}"#)),
        ]);

        let exit = f.router.dispatch_loop(&a, frames).await;
        assert_eq!(exit, LoopExit::PeerClosed);

        let errors: Vec<_> = std::iter::from_fn(|| next_envelope(&mut rx_a)).collect();
        assert_eq!(errors.len(), 3);
        assert!(errors.iter().all(|e| e.kind == "error"));
    }

    #[tokio::test]
    async fn test_dispatch_loop_end_of_stream() {
        let f = fixture();
        let (a, _rx_a) = join(&f.registry);
        let exit = f.router.dispatch_loop(&a, futures_util::stream::empty()).await;
        assert_eq!(exit, LoopExit::PeerClosed);
    }

    #[tokio::test]
    async fn test_dispatch_loop_transport_error() {
        let f = fixture();
        let (a, _rx_a) = join(&f.registry);
        let frames = futures_util::stream::iter(vec![Err(TransportError("reset".into()))]);
        let exit = f.router.dispatch_loop(&a, frames).await;
        assert_eq!(exit, LoopExit::Transport(TransportError("reset".into())));
    }

    #[tokio::test]
    async fn test_dispatch_loop_stops_on_eviction() {
        let f = fixture();
        let (a, _rx_a) = join(&f.registry);
        a.connection.close(crate::connection::CloseReason::DELIVERY_FAILED);

        let exit = f.router.dispatch_loop(&a, futures_util::stream::pending()).await;
        assert_eq!(exit, LoopExit::Evicted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_loop_idle_timeout() {
        let registry = Arc::new(ConnectionRegistry::new());
        let store = Arc::new(MemoryRoomStore::new());
        let router = MessageRouter::new(
            Arc::new(StoreGateway::new(store)),
            Arc::new(Broadcaster::new(registry.clone())),
            Some(Duration::from_secs(5)),
        );
        let (a, _rx_a) = join(&registry);

        let exit = router.dispatch_loop(&a, futures_util::stream::pending()).await;
        assert_eq!(exit, LoopExit::IdleTimeout);
    }
}
