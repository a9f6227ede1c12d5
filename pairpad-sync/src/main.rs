//! pairpad-server — WebSocket sync server for collaborative code rooms.
//!
//! Usage: `pairpad-server [CONFIG_PATH]`. See [`pairpad_sync::config`] for
//! how settings are layered.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use env_logger::Env;
use tokio_util::sync::CancellationToken;

use pairpad_sync::{MemoryRoomStore, RoomStore, ServerConfig, StoreGateway, SyncServer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = pairpad_sync::config::load(config_path.as_deref()).context("loading configuration")?;

    let default_level = if config.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(Env::default().default_filter_or(default_level))
        .try_init()
        .ok();

    let store = open_store(&config)?;
    seed_rooms(store.as_ref(), &config)?;

    let gateway = Arc::new(StoreGateway::new(store));
    let server = SyncServer::new(config, gateway).context("creating server")?;

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Received Ctrl+C, stopping");
        }
        signal_token.cancel();
    });

    server.run_until(shutdown).await.context("running server")?;
    Ok(())
}

#[cfg(feature = "rocksdb")]
fn open_store(config: &ServerConfig) -> anyhow::Result<Arc<dyn RoomStore>> {
    use pairpad_sync::{RocksRoomStore, StoreConfig};

    match &config.storage_path {
        Some(path) => {
            let store = RocksRoomStore::open(StoreConfig {
                path: path.clone(),
                ..StoreConfig::default()
            })
            .with_context(|| format!("opening room store at {}", path.display()))?;
            log::info!("Room store opened at {}", path.display());
            Ok(Arc::new(store))
        }
        None => {
            log::info!("Using in-memory room store");
            Ok(Arc::new(MemoryRoomStore::new()))
        }
    }
}

#[cfg(not(feature = "rocksdb"))]
fn open_store(config: &ServerConfig) -> anyhow::Result<Arc<dyn RoomStore>> {
    if let Some(path) = &config.storage_path {
        log::warn!(
            "storage_path {} ignored: built without the `rocksdb` feature",
            path.display()
        );
    }
    log::info!("Using in-memory room store");
    Ok(Arc::new(MemoryRoomStore::new()))
}

/// Create the configured rooms if the store is empty and log their ids.
fn seed_rooms(store: &dyn RoomStore, config: &ServerConfig) -> anyhow::Result<()> {
    if store.room_count()? > 0 {
        for room in store.list_rooms(0, 100)? {
            log::info!("Room available: {} ({}) at /ws/{}", room.name, room.language, room.id);
        }
        return Ok(());
    }

    for seed in &config.seed_rooms {
        let room = store
            .create_room(&seed.name, seed.language.as_deref())
            .with_context(|| format!("creating seed room {:?}", seed.name))?;
        log::info!("Room available: {} ({}) at /ws/{}", room.name, room.language, room.id);
    }
    Ok(())
}
