//! Room membership table.
//!
//! ```text
//! rooms:   room_id ──► [ (Connection, ParticipantId), ... ]   (registration order)
//! members: ConnectionId ──► (room_id, ParticipantId)
//! ```
//!
//! Both maps live behind one mutex so every operation observes and leaves a
//! consistent state. A room key exists only while its member list is
//! non-empty. Nothing here performs I/O or awaits.

use std::collections::{HashMap, HashSet};
use std::fmt;

use parking_lot::Mutex;
use uuid::Uuid;

use crate::connection::{ConnectionHandle, ConnectionId};

/// Ephemeral per-connection participant token.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ParticipantId(String);

impl ParticipantId {
    /// Length of generated ids (hex characters).
    pub const LEN: usize = 8;

    fn generate() -> Self {
        let mut id = Uuid::new_v4().simple().to_string();
        id.truncate(Self::LEN);
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name shown to other participants next to this participant's cursor.
    pub fn display_name(&self) -> String {
        format!("User-{}", self.0)
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<ParticipantId> for String {
    fn from(id: ParticipantId) -> Self {
        id.0
    }
}

/// Result of a successful registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Membership {
    pub participant_id: ParticipantId,
    /// Members in the room right after this registration
    pub member_count: usize,
}

/// Result of removing a registered connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    pub participant_id: ParticipantId,
    /// Members left in the room right after this removal
    pub remaining: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("connection {connection} is already registered in room {room_id}")]
    AlreadyRegistered {
        connection: ConnectionId,
        room_id: String,
    },
}

struct Member {
    connection: ConnectionHandle,
    participant_id: ParticipantId,
}

#[derive(Default)]
struct RegistryState {
    rooms: HashMap<String, Vec<Member>>,
    members: HashMap<ConnectionId, (String, ParticipantId)>,
    live_ids: HashSet<ParticipantId>,
}

/// Process-wide table of which connection is in which room.
///
/// Construct one per server (or per test) and share it behind an `Arc`.
#[derive(Default)]
pub struct ConnectionRegistry {
    state: Mutex<RegistryState>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `connection` to `room_id` under a freshly generated participant id.
    pub fn register(
        &self,
        room_id: &str,
        connection: ConnectionHandle,
    ) -> Result<Membership, RegistryError> {
        let mut state = self.state.lock();

        if let Some((existing, _)) = state.members.get(&connection.id()) {
            return Err(RegistryError::AlreadyRegistered {
                connection: connection.id(),
                room_id: existing.clone(),
            });
        }

        let participant_id = loop {
            let candidate = ParticipantId::generate();
            if !state.live_ids.contains(&candidate) {
                break candidate;
            }
        };

        state.live_ids.insert(participant_id.clone());
        state
            .members
            .insert(connection.id(), (room_id.to_string(), participant_id.clone()));

        if !state.rooms.contains_key(room_id) {
            log::info!("Room {room_id} entry created");
        }
        let members = state.rooms.entry(room_id.to_string()).or_default();
        members.push(Member {
            connection,
            participant_id: participant_id.clone(),
        });
        let member_count = members.len();

        log::info!(
            "Participant {participant_id} registered in room {room_id} ({member_count} connected)"
        );

        Ok(Membership {
            participant_id,
            member_count,
        })
    }

    /// Remove `connection` from `room_id`.
    ///
    /// Returns `None` if the connection is not (or no longer) registered
    /// there; a second call for the same connection is a no-op.
    pub fn unregister(&self, connection: &ConnectionHandle, room_id: &str) -> Option<Departure> {
        let mut state = self.state.lock();

        match state.members.get(&connection.id()) {
            Some((registered_room, _)) if registered_room == room_id => {}
            _ => return None,
        }
        let (_, participant_id) = state.members.remove(&connection.id())?;
        state.live_ids.remove(&participant_id);

        let remaining = match state.rooms.get_mut(room_id) {
            Some(members) => {
                members.retain(|m| m.connection.id() != connection.id());
                members.len()
            }
            None => 0,
        };

        if remaining == 0 {
            state.rooms.remove(room_id);
            log::info!("Room {room_id} entry removed (no active connections)");
        }

        log::info!(
            "Participant {participant_id} unregistered from room {room_id} ({remaining} remaining)"
        );

        Some(Departure {
            participant_id,
            remaining,
        })
    }

    /// Connections currently in `room_id`, in registration order.
    pub fn members_of(&self, room_id: &str) -> Vec<ConnectionHandle> {
        self.state
            .lock()
            .rooms
            .get(room_id)
            .map(|members| members.iter().map(|m| m.connection.clone()).collect())
            .unwrap_or_default()
    }

    /// Connections in `room_id` paired with their participant ids.
    pub fn participants_of(&self, room_id: &str) -> Vec<(ConnectionHandle, ParticipantId)> {
        self.state
            .lock()
            .rooms
            .get(room_id)
            .map(|members| {
                members
                    .iter()
                    .map(|m| (m.connection.clone(), m.participant_id.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn count_of(&self, room_id: &str) -> usize {
        self.state.lock().rooms.get(room_id).map_or(0, Vec::len)
    }

    pub fn participant_of(&self, connection: &ConnectionHandle) -> Option<ParticipantId> {
        self.state
            .lock()
            .members
            .get(&connection.id())
            .map(|(_, participant_id)| participant_id.clone())
    }

    /// Room the connection is registered in, if any.
    pub fn room_of(&self, connection: &ConnectionHandle) -> Option<String> {
        self.state
            .lock()
            .members
            .get(&connection.id())
            .map(|(room_id, _)| room_id.clone())
    }

    pub fn contains_room(&self, room_id: &str) -> bool {
        self.state.lock().rooms.contains_key(room_id)
    }

    /// Ids of all rooms with at least one live connection.
    pub fn active_rooms(&self) -> Vec<String> {
        self.state.lock().rooms.keys().cloned().collect()
    }

    pub fn room_count(&self) -> usize {
        self.state.lock().rooms.len()
    }

    pub fn connection_count(&self) -> usize {
        self.state.lock().members.len()
    }
}
