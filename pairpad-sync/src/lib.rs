//! # pairpad-sync — Real-time core for collaborative code rooms
//!
//! Keeps every participant of a room in sync over WebSocket: who is
//! connected, code edits, and cursor movement.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   JSON envelopes   ┌─────────────┐
//! │ Browser tab │ ◄────────────────► │ SyncServer  │
//! │ (per user)  │   /ws/{room_id}    │ (central)   │
//! └─────────────┘                    └──────┬──────┘
//!                                           │ one Session per socket
//!                       ┌───────────────────┼───────────────────┐
//!                       ▼                   ▼                   ▼
//!               ┌──────────────┐   ┌────────────────┐   ┌──────────────┐
//!               │ RoomGateway  │   │ MessageRouter  │   │ Connection   │
//!               │ (room store) │   │ (dispatch)     │──►│ Registry     │
//!               └──────────────┘   └───────┬────────┘   └──────┬───────┘
//!                                          │                   │
//!                                          └──► Broadcaster ◄──┘
//!                                               (fan-out)
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — `{type, data, timestamp}` envelopes and typed events
//! - [`connection`] — Per-participant outbox and close handling
//! - [`registry`] — Room membership table
//! - [`broadcast`] — Room fan-out with eviction of dead connections
//! - [`router`] — Inbound frame dispatch
//! - [`session`] — Connection lifecycle from verification to close
//! - [`gateway`] — Boundary to room storage
//! - [`storage`] — Room records (in-memory, or RocksDB with the `rocksdb` feature)
//! - [`server`] — WebSocket server
//! - [`config`] — Layered configuration

pub mod protocol;
pub mod connection;
pub mod registry;
pub mod broadcast;
pub mod router;
pub mod session;
pub mod gateway;
pub mod storage;
pub mod server;
pub mod config;

// Re-exports for convenience
pub use protocol::{ClientEvent, Envelope, Payload, ProtocolError, ServerEvent};
pub use connection::{CloseReason, Connection, ConnectionHandle, ConnectionId, DeliveryError, Frame};
pub use registry::{ConnectionRegistry, Departure, Membership, ParticipantId, RegistryError};
pub use broadcast::{announce_departures, BroadcastReport, BroadcastStats, Broadcaster, Eviction};
pub use router::{Dispatch, Incoming, LoopExit, MessageRouter, Peer, TransportError};
pub use session::{Session, SessionContext, SessionOutcome, SessionState};
pub use gateway::{GatewayError, RoomGateway, RoomSnapshot, StoreGateway};
pub use storage::{MemoryRoomStore, Room, RoomStore, StoreError};
#[cfg(feature = "rocksdb")]
pub use storage::{RocksRoomStore, StoreConfig};
pub use server::{ServerConfig, ServerError, ServerStats, SyncServer};
pub use crate::config::{ConfigError, SeedRoom};
