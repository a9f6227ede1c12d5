//! In-memory room store. Contents are lost on restart.

use std::collections::HashMap;

use chrono::Utc;
use parking_lot::RwLock;

use super::{Room, RoomStore, StoreError};

#[derive(Default)]
struct Rooms {
    by_id: HashMap<String, Room>,
    /// Room ids in creation order
    order: Vec<String>,
}

#[derive(Default)]
pub struct MemoryRoomStore {
    rooms: RwLock<Rooms>,
}

impl MemoryRoomStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RoomStore for MemoryRoomStore {
    fn insert_room(&self, room: Room) -> Result<Room, StoreError> {
        let mut rooms = self.rooms.write();
        if rooms.by_id.contains_key(&room.id) {
            return Err(StoreError::AlreadyExists(room.id));
        }
        rooms.order.push(room.id.clone());
        rooms.by_id.insert(room.id.clone(), room.clone());
        Ok(room)
    }

    fn get_room(&self, room_id: &str) -> Result<Option<Room>, StoreError> {
        let room = self.rooms.read().by_id.get(room_id).cloned();
        if room.is_none() {
            log::debug!("Room not found: {room_id}");
        }
        Ok(room)
    }

    fn list_rooms(&self, skip: usize, limit: usize) -> Result<Vec<Room>, StoreError> {
        let rooms = self.rooms.read();
        Ok(rooms
            .order
            .iter()
            .skip(skip)
            .take(limit)
            .filter_map(|id| rooms.by_id.get(id).cloned())
            .collect())
    }

    fn update_code(&self, room_id: &str, code: &str) -> Result<Option<Room>, StoreError> {
        let mut rooms = self.rooms.write();
        let Some(room) = rooms.by_id.get_mut(room_id) else {
            log::warn!("Cannot update code - room not found: {room_id}");
            return Ok(None);
        };
        room.code = code.to_string();
        room.updated_at = Utc::now();
        log::debug!("Updated code in room: {room_id}");
        Ok(Some(room.clone()))
    }

    fn delete_room(&self, room_id: &str) -> Result<bool, StoreError> {
        let mut rooms = self.rooms.write();
        if rooms.by_id.remove(room_id).is_none() {
            return Ok(false);
        }
        rooms.order.retain(|id| id != room_id);
        log::info!("Deleted room: {room_id}");
        Ok(true)
    }

    fn room_count(&self) -> Result<usize, StoreError> {
        Ok(self.rooms.read().by_id.len())
    }
}
