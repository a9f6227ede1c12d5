//! Per-connection lifecycle.
//!
//! ```text
//! Accepting ──► Verifying ──┬─ room missing / gateway down ──────────────► Closed
//!                           │
//!                           └─► Registered ──► Active ──► Closing ──► Closed
//!                                  │             │           │
//!                               register    init, user_joined │
//!                                            dispatch loop   unregister, user_left
//! ```
//!
//! A rejected connection never touches the registry. Every registered
//! connection leaves through `Closing` exactly once, whatever ended its loop.

use std::sync::Arc;
use std::time::Duration;

use futures_util::Stream;

use crate::broadcast::{announce_departures, Broadcaster};
use crate::connection::{CloseReason, ConnectionHandle};
use crate::gateway::{RoomGateway, RoomSnapshot};
use crate::protocol::ServerEvent;
use crate::registry::{ConnectionRegistry, Membership, ParticipantId, RegistryError};
use crate::router::{Incoming, LoopExit, MessageRouter, Peer, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Accepting,
    Verifying,
    Registered,
    Active,
    Closing,
    Closed,
}

/// Shared components every session works against.
#[derive(Clone)]
pub struct SessionContext {
    pub registry: Arc<ConnectionRegistry>,
    pub broadcaster: Arc<Broadcaster>,
    pub gateway: Arc<dyn RoomGateway>,
    pub router: Arc<MessageRouter>,
}

impl SessionContext {
    /// Wire up a registry, broadcaster and router around `gateway`.
    pub fn new(gateway: Arc<dyn RoomGateway>, idle_timeout: Option<Duration>) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let broadcaster = Arc::new(Broadcaster::new(registry.clone()));
        let router = Arc::new(MessageRouter::new(
            gateway.clone(),
            broadcaster.clone(),
            idle_timeout,
        ));
        Self {
            registry,
            broadcaster,
            gateway,
            router,
        }
    }
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionOutcome {
    /// Closed during verification; nothing was registered
    Rejected(CloseReason),
    Completed {
        participant_id: ParticipantId,
        exit: LoopExit,
    },
}

pub struct Session {
    ctx: SessionContext,
    room_id: String,
    connection: ConnectionHandle,
    state: SessionState,
}

impl Session {
    pub fn new(ctx: SessionContext, room_id: impl Into<String>, connection: ConnectionHandle) -> Self {
        Self {
            ctx,
            room_id: room_id.into(),
            connection,
            state: SessionState::Accepting,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Drive the connection from verification to close.
    pub async fn run<S>(&mut self, inbound: S) -> SessionOutcome
    where
        S: Stream<Item = Result<Incoming, TransportError>> + Send,
    {
        self.state = SessionState::Verifying;
        let snapshot = match self.verify().await {
            Ok(snapshot) => snapshot,
            Err(reason) => {
                self.connection.close(reason);
                self.state = SessionState::Closed;
                return SessionOutcome::Rejected(reason);
            }
        };

        let membership = match self.register() {
            Ok(membership) => membership,
            Err(e) => {
                log::error!("Registration failed for room {}: {e}", self.room_id);
                self.connection.close(CloseReason::INTERNAL_ERROR);
                self.state = SessionState::Closed;
                return SessionOutcome::Rejected(CloseReason::INTERNAL_ERROR);
            }
        };
        let participant_id = membership.participant_id.clone();
        let snapshot = self.latest_snapshot(snapshot).await;

        let peer = Peer {
            connection: self.connection.clone(),
            room_id: self.room_id.clone(),
            participant_id: participant_id.clone(),
        };

        self.state = SessionState::Active;
        let exit = match self.activate(&peer, snapshot, membership.member_count) {
            Ok(()) => self.ctx.router.dispatch_loop(&peer, inbound).await,
            Err(exit) => exit,
        };
        log::debug!("Session for {participant_id} in room {} ended: {exit:?}", self.room_id);

        self.close(&participant_id, &exit);
        SessionOutcome::Completed {
            participant_id,
            exit,
        }
    }

    /// `Err` carries the close reason for a rejected connection.
    async fn verify(&self) -> Result<RoomSnapshot, CloseReason> {
        match self.ctx.gateway.fetch_snapshot(&self.room_id).await {
            Ok(Some(snapshot)) => Ok(snapshot),
            Ok(None) => {
                log::info!("Connection rejected - room not found: {}", self.room_id);
                Err(CloseReason::ROOM_NOT_FOUND)
            }
            Err(e) => {
                log::error!("Failed to load room {}: {e}", self.room_id);
                Err(CloseReason::INTERNAL_ERROR)
            }
        }
    }

    /// Re-read the room once registered, so `init` includes any code
    /// persisted between verification and registration. Falls back to the
    /// verified snapshot if the re-read fails or finds nothing.
    async fn latest_snapshot(&self, verified: RoomSnapshot) -> RoomSnapshot {
        match self.ctx.gateway.fetch_snapshot(&self.room_id).await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => verified,
            Err(e) => {
                log::warn!("Re-reading room {} failed, using verified snapshot: {e}", self.room_id);
                verified
            }
        }
    }

    fn register(&mut self) -> Result<Membership, RegistryError> {
        let membership = self
            .ctx
            .registry
            .register(&self.room_id, self.connection.clone())?;
        self.state = SessionState::Registered;
        log::info!(
            "User {} joined room {}. Total users: {}",
            membership.participant_id,
            self.room_id,
            membership.member_count
        );
        Ok(membership)
    }

    /// Send `init`, then announce the join to everyone else.
    fn activate(&self, peer: &Peer, snapshot: RoomSnapshot, user_count: usize) -> Result<(), LoopExit> {
        let init = ServerEvent::Init {
            room_id: self.room_id.clone(),
            code: snapshot.code,
            language: snapshot.language,
        };
        if let Err(e) = self.connection.send_event(init) {
            log::warn!("Failed to send init to {}: {e}", peer.participant_id);
            return Err(LoopExit::SenderGone(e));
        }

        let report = self.ctx.broadcaster.broadcast(
            &self.room_id,
            ServerEvent::UserJoined {
                room_id: self.room_id.clone(),
                user_count,
            },
            Some(&self.connection),
        );
        announce_departures(&self.ctx.broadcaster, report.evictions);
        Ok(())
    }

    /// Leave the room and close the transport. A no-op once `Closed`.
    fn close(&mut self, participant_id: &ParticipantId, exit: &LoopExit) {
        if self.state == SessionState::Closed {
            return;
        }
        self.state = SessionState::Closing;

        if let Some(departure) = self.ctx.registry.unregister(&self.connection, &self.room_id) {
            log::info!(
                "User {} left room {}. Remaining users: {}",
                departure.participant_id,
                self.room_id,
                departure.remaining
            );
            let report = self.ctx.broadcaster.broadcast(
                &self.room_id,
                ServerEvent::UserLeft {
                    room_id: self.room_id.clone(),
                    user_id: departure.participant_id.into(),
                    user_count: departure.remaining,
                },
                None,
            );
            announce_departures(&self.ctx.broadcaster, report.evictions);
        } else {
            log::debug!("{participant_id} already removed from room {}", self.room_id);
        }

        let reason = match exit {
            LoopExit::IdleTimeout => CloseReason::IDLE_TIMEOUT,
            _ => CloseReason::NORMAL,
        };
        self.connection.close(reason);
        self.state = SessionState::Closed;
    }
}
