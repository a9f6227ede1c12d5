//! Boundary to the room storage subsystem.
//!
//! Sessions only ever read a room snapshot when a participant connects and
//! write the full code text on every accepted `code_update`. Calls may block
//! on I/O; callers never hold the registry lock across them.
//! [`StoreGateway`] runs store calls on tokio's blocking pool.

use std::sync::Arc;

use async_trait::async_trait;

use crate::storage::{RoomStore, StoreError};

/// The part of a room a newly connected participant needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomSnapshot {
    pub code: String,
    pub language: String,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GatewayError {
    /// The room disappeared between verification and a write
    #[error("room not found: {0}")]
    RoomNotFound(String),
    #[error("room storage unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Read/write access to room state, keyed by room id.
#[async_trait]
pub trait RoomGateway: Send + Sync {
    /// `Ok(None)` means the room does not exist, which is an expected outcome.
    async fn fetch_snapshot(&self, room_id: &str) -> Result<Option<RoomSnapshot>, GatewayError>;

    /// Overwrite the room's code (last write wins).
    async fn persist_code(&self, room_id: &str, code: &str) -> Result<(), GatewayError>;
}

/// [`RoomGateway`] backed by any [`RoomStore`].
#[derive(Clone)]
pub struct StoreGateway {
    store: Arc<dyn RoomStore>,
}

impl StoreGateway {
    pub fn new(store: Arc<dyn RoomStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn RoomStore> {
        &self.store
    }

    /// Run `op` against the store off the async worker threads.
    async fn blocking<T, F>(&self, op: F) -> Result<T, GatewayError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn RoomStore) -> Result<T, StoreError> + Send + 'static,
    {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || op(&*store))
            .await
            .map_err(|e| GatewayError::Unavailable(format!("store task failed: {e}")))?
            .map_err(GatewayError::from)
    }
}

#[async_trait]
impl RoomGateway for StoreGateway {
    async fn fetch_snapshot(&self, room_id: &str) -> Result<Option<RoomSnapshot>, GatewayError> {
        let id = room_id.to_string();
        let room = self.blocking(move |store| store.get_room(&id)).await?;
        Ok(room.map(|room| RoomSnapshot {
            code: room.code,
            language: room.language,
        }))
    }

    async fn persist_code(&self, room_id: &str, code: &str) -> Result<(), GatewayError> {
        let (id, code) = (room_id.to_string(), code.to_string());
        match self.blocking(move |store| store.update_code(&id, &code)).await? {
            Some(_) => Ok(()),
            None => Err(GatewayError::RoomNotFound(room_id.to_string())),
        }
    }
}
