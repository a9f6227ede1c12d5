//! Room record storage.
//!
//! ```text
//! ┌─────────────┐  fetch_snapshot / persist_code  ┌──────────────┐
//! │ SyncServer  │ ──────────────────────────────► │ StoreGateway │
//! │ (sessions)  │                                 └──────┬───────┘
//! └─────────────┘                                        │ RoomStore
//!                                            ┌───────────┴───────────┐
//!                                            ▼                       ▼
//!                                   MemoryRoomStore          RocksRoomStore
//!                                   (always built)          (feature "rocksdb")
//! ```
//!
//! Rooms are created and deleted here, never by the real-time core.

pub mod memory;
#[cfg(feature = "rocksdb")]
pub mod rocks;

pub use memory::MemoryRoomStore;
#[cfg(feature = "rocksdb")]
pub use rocks::{RocksRoomStore, StoreConfig};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Code placed in every newly created room.
pub const DEFAULT_CODE: &str = "# Start coding here...";
/// Language used when a room is created without one.
pub const DEFAULT_LANGUAGE: &str = "python";
/// Longest accepted room name, in characters.
pub const MAX_NAME_LEN: usize = 255;

/// A collaborative coding room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Room {
    pub id: String,
    pub name: String,
    pub code: String,
    pub language: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Room {
    /// New room with a random id.
    pub fn new(name: impl Into<String>, language: Option<&str>) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), name, language)
    }

    /// New room with an explicit id.
    pub fn with_id(id: impl Into<String>, name: impl Into<String>, language: Option<&str>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            code: DEFAULT_CODE.to_string(),
            language: language.unwrap_or(DEFAULT_LANGUAGE).to_string(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Storage errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    #[error("invalid room name: must be 1-255 characters")]
    InvalidName,
    #[error("room already exists: {0}")]
    AlreadyExists(String),
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("compression error: {0}")]
    Compression(String),
}

pub(crate) fn validate_name(name: &str) -> Result<(), StoreError> {
    let len = name.trim().chars().count();
    if len == 0 || len > MAX_NAME_LEN {
        return Err(StoreError::InvalidName);
    }
    Ok(())
}

/// Room record operations shared by every backend.
pub trait RoomStore: Send + Sync {
    /// Insert a fully formed room. Fails if the id is taken.
    fn insert_room(&self, room: Room) -> Result<Room, StoreError>;

    fn get_room(&self, room_id: &str) -> Result<Option<Room>, StoreError>;

    /// Rooms in creation order.
    fn list_rooms(&self, skip: usize, limit: usize) -> Result<Vec<Room>, StoreError>;

    /// Replace the code and refresh `updated_at`. `None` if the room does not exist.
    fn update_code(&self, room_id: &str, code: &str) -> Result<Option<Room>, StoreError>;

    /// `false` if the room did not exist.
    fn delete_room(&self, room_id: &str) -> Result<bool, StoreError>;

    fn room_count(&self) -> Result<usize, StoreError>;

    /// Create a room with default code and a fresh id.
    fn create_room(&self, name: &str, language: Option<&str>) -> Result<Room, StoreError> {
        validate_name(name)?;
        let room = self.insert_room(Room::new(name.trim(), language))?;
        log::info!("Created room: {} - {}", room.id, room.name);
        Ok(room)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_defaults() {
        let room = Room::new("Pairing", None);
        assert_eq!(room.code, DEFAULT_CODE);
        assert_eq!(room.language, "python");
        assert_eq!(room.created_at, room.updated_at);
        assert!(Uuid::parse_str(&room.id).is_ok());
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("ok").is_ok());
        assert_eq!(validate_name("   "), Err(StoreError::InvalidName));
        assert_eq!(validate_name(""), Err(StoreError::InvalidName));
        assert!(validate_name(&"a".repeat(MAX_NAME_LEN)).is_ok());
        assert_eq!(
            validate_name(&"a".repeat(MAX_NAME_LEN + 1)),
            Err(StoreError::InvalidName)
        );
    }

    #[test]
    fn test_store_error_display() {
        assert_eq!(
            StoreError::InvalidName.to_string(),
            "invalid room name: must be 1-255 characters"
        );
        assert_eq!(
            StoreError::AlreadyExists("r1".into()).to_string(),
            "room already exists: r1"
        );
    }
}
