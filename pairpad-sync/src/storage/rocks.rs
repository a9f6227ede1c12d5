//! RocksDB-backed room store.
//!
//! Column families:
//! - `rooms`      — room records keyed by room id (bincode, code LZ4-compressed)
//! - `room_index` — creation sequence (u64 big-endian) → room id, for ordered listing
//!
//! Record and index entries are always written together in one `WriteBatch`.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};

use super::{Room, RoomStore, StoreError};

const CF_ROOMS: &str = "rooms";
const CF_ROOM_INDEX: &str = "room_index";

const COLUMN_FAMILIES: &[&str] = &[CF_ROOMS, CF_ROOM_INDEX];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("pairpad_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 256,
        }
    }
}

impl StoreConfig {
    /// Small caches, caller-provided directory.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024,
            max_open_files: 64,
            ..Self::default()
        }
    }
}

/// On-disk room record.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredRoom {
    id: String,
    name: String,
    language: String,
    /// LZ4 block with prepended size
    code_lz4: Vec<u8>,
    created_at_ms: i64,
    updated_at_ms: i64,
    /// Creation sequence, key into `room_index`
    seq: u64,
}

impl StoredRoom {
    fn from_room(room: &Room, seq: u64) -> Self {
        Self {
            id: room.id.clone(),
            name: room.name.clone(),
            language: room.language.clone(),
            code_lz4: lz4_flex::compress_prepend_size(room.code.as_bytes()),
            created_at_ms: room.created_at.timestamp_millis(),
            updated_at_ms: room.updated_at.timestamp_millis(),
            seq,
        }
    }

    fn into_room(self) -> Result<Room, StoreError> {
        let code = lz4_flex::decompress_size_prepended(&self.code_lz4)
            .map_err(|e| StoreError::Compression(e.to_string()))?;
        let code =
            String::from_utf8(code).map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(Room {
            id: self.id,
            name: self.name,
            code,
            language: self.language,
            created_at: millis_to_datetime(self.created_at_ms)?,
            updated_at: millis_to_datetime(self.updated_at_ms)?,
        })
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (record, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(record)
    }
}

fn millis_to_datetime(ms: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::Deserialization(format!("timestamp out of range: {ms}")))
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Durable room store.
pub struct RocksRoomStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Next creation sequence number
    sequence: AtomicU64,
    /// Serializes read-modify-write operations
    write_lock: Mutex<()>,
}

impl RocksRoomStore {
    /// Open the store, creating the database and column families if needed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        let sequence = Self::recover_sequence(&db);
        log::info!(
            "Opened room store at {} (next sequence {sequence})",
            config.path.display()
        );

        Ok(Self {
            db,
            config,
            sequence: AtomicU64::new(sequence),
            write_lock: Mutex::new(()),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);

        match name {
            CF_ROOMS => {
                // Code is already LZ4-compressed inside the record
                opts.set_compression_type(DBCompressionType::None);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_ROOM_INDEX => {
                opts.set_compression_type(DBCompressionType::Lz4);
            }
            _ => {}
        }

        opts
    }

    /// Highest index key + 1, or 0 for an empty store.
    fn recover_sequence(db: &DBWithThreadMode<SingleThreaded>) -> u64 {
        let Some(cf) = db.cf_handle(CF_ROOM_INDEX) else {
            return 0;
        };
        match db.iterator_cf(cf, IteratorMode::End).next() {
            Some(Ok((key, _))) if key.len() >= 8 => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&key[..8]);
                u64::from_be_bytes(buf) + 1
            }
            _ => 0,
        }
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("missing column family {name}")))
    }

    fn write_options(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }

    fn load_record(&self, room_id: &str) -> Result<Option<StoredRoom>, StoreError> {
        let cf = self.cf(CF_ROOMS)?;
        match self.db.get_cf(cf, room_id.as_bytes())? {
            Some(bytes) => Ok(Some(StoredRoom::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Flush memtables to disk.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }
}

impl RoomStore for RocksRoomStore {
    fn insert_room(&self, room: Room) -> Result<Room, StoreError> {
        let _guard = self.write_lock.lock();
        if self.load_record(&room.id)?.is_some() {
            return Err(StoreError::AlreadyExists(room.id));
        }

        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        let record = StoredRoom::from_room(&room, seq);

        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_ROOMS)?, room.id.as_bytes(), record.encode()?);
        batch.put_cf(self.cf(CF_ROOM_INDEX)?, seq.to_be_bytes(), room.id.as_bytes());
        self.db.write_opt(batch, &self.write_options())?;

        Ok(room)
    }

    fn get_room(&self, room_id: &str) -> Result<Option<Room>, StoreError> {
        match self.load_record(room_id)? {
            Some(record) => Ok(Some(record.into_room()?)),
            None => {
                log::debug!("Room not found: {room_id}");
                Ok(None)
            }
        }
    }

    fn list_rooms(&self, skip: usize, limit: usize) -> Result<Vec<Room>, StoreError> {
        let cf = self.cf(CF_ROOM_INDEX)?;
        let mut rooms = Vec::new();
        for entry in self.db.iterator_cf(cf, IteratorMode::Start).skip(skip) {
            if rooms.len() >= limit {
                break;
            }
            let (_, room_id) = entry?;
            let room_id = String::from_utf8_lossy(&room_id);
            if let Some(room) = self.get_room(&room_id)? {
                rooms.push(room);
            }
        }
        Ok(rooms)
    }

    fn update_code(&self, room_id: &str, code: &str) -> Result<Option<Room>, StoreError> {
        let _guard = self.write_lock.lock();
        let Some(record) = self.load_record(room_id)? else {
            log::warn!("Cannot update code - room not found: {room_id}");
            return Ok(None);
        };

        let seq = record.seq;
        let mut room = record.into_room()?;
        room.code = code.to_string();
        room.updated_at = Utc::now();

        let encoded = StoredRoom::from_room(&room, seq).encode()?;
        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_ROOMS)?, room_id.as_bytes(), encoded);
        self.db.write_opt(batch, &self.write_options())?;

        log::debug!("Updated code in room: {room_id}");
        Ok(Some(room))
    }

    fn delete_room(&self, room_id: &str) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock();
        let Some(record) = self.load_record(room_id)? else {
            return Ok(false);
        };

        let mut batch = WriteBatch::default();
        batch.delete_cf(self.cf(CF_ROOMS)?, room_id.as_bytes());
        batch.delete_cf(self.cf(CF_ROOM_INDEX)?, record.seq.to_be_bytes());
        self.db.write_opt(batch, &self.write_options())?;

        log::info!("Deleted room: {room_id}");
        Ok(true)
    }

    fn room_count(&self) -> Result<usize, StoreError> {
        let cf = self.cf(CF_ROOM_INDEX)?;
        let mut count = 0;
        for entry in self.db.iterator_cf(cf, IteratorMode::Start) {
            entry?;
            count += 1;
        }
        Ok(count)
    }
}
