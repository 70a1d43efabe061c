//! RocksDB-backed room store.
//!
//! Column families:
//! - `rooms`        — Room records, keyed by room code
//! - `users`        — User records, keyed by user id
//! - `participants` — Participant records, keyed by `room_id:user_id`
//! - `messages`     — Chat messages, keyed by `room_id:seq` (seq big-endian)
//!
//! Values are bincode-encoded (serde mode, standard config).

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use super::{
    username_or_id, LifecycleFlags, ParticipantRecord, PersistenceGateway, RoomRecord, StoreError,
    StoredMessage, UserRecord,
};
use crate::protocol::{ChatMessage, ParticipantInfo};
use crate::state::PlaybackSnapshot;

const CF_ROOMS: &str = "rooms";
const CF_USERS: &str = "users";
const CF_PARTICIPANTS: &str = "participants";
const CF_MESSAGES: &str = "messages";

const COLUMN_FAMILIES: &[&str] = &[CF_ROOMS, CF_USERS, CF_PARTICIPANTS, CF_MESSAGES];

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
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("watchsync_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Small caches, for tests.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// RocksDB-backed implementation of [`PersistenceGateway`].
pub struct RoomStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Serializes message sequence allocation.
    append_lock: Mutex<()>,
    /// Serializes read-modify-write of room records.
    room_lock: Mutex<()>,
}

impl RoomStore {
    /// Open the store, creating the database and column families if missing.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        Ok(Self {
            db,
            config,
            append_lock: Mutex::new(()),
            room_lock: Mutex::new(()),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_ROOMS | CF_USERS => {
                // Small values, point lookups only
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_MESSAGES => {
                // Append-mostly, range-scanned by room
                opts.set_max_write_buffer_number(4);
            }
            _ => {}
        }

        opts
    }

    // ─── Rooms ────────────────────────────────────────────────────────

    pub fn load_room(&self, code: &str) -> Result<Option<RoomRecord>, StoreError> {
        self.get(CF_ROOMS, code.as_bytes())
    }

    pub fn save_room(&self, room: &RoomRecord) -> Result<(), StoreError> {
        self.put(CF_ROOMS, room.code.as_bytes(), room)
    }

    /// Read-modify-write of a room record. Snapshot writes and lifecycle
    /// flags touch different fields of the same record, so neither may
    /// save over the other.
    fn update_room(
        &self,
        code: &str,
        f: impl FnOnce(&mut RoomRecord),
    ) -> Result<(), StoreError> {
        let _guard = self.room_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut room = self
            .load_room(code)?
            .ok_or_else(|| StoreError::NotFound(format!("room {code}")))?;
        f(&mut room);
        self.save_room(&room)
    }

    /// All room codes in the store.
    pub fn list_rooms(&self) -> Result<Vec<String>, StoreError> {
        let cf = self.cf(CF_ROOMS)?;
        let mut codes = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            codes.push(String::from_utf8_lossy(&key).into_owned());
        }
        Ok(codes)
    }

    // ─── Users ────────────────────────────────────────────────────────

    pub fn load_user(&self, user_id: &str) -> Result<Option<UserRecord>, StoreError> {
        self.get(CF_USERS, user_id.as_bytes())
    }

    fn username(&self, user_id: &str) -> Result<String, StoreError> {
        Ok(username_or_id(self.load_user(user_id)?, user_id))
    }

    // ─── Participants ─────────────────────────────────────────────────

    pub fn load_participant(
        &self,
        room_id: Uuid,
        user_id: &str,
    ) -> Result<Option<ParticipantRecord>, StoreError> {
        self.get(CF_PARTICIPANTS, &Self::participant_key(room_id, user_id))
    }

    fn participants_of(&self, room_id: Uuid) -> Result<Vec<ParticipantRecord>, StoreError> {
        let cf = self.cf(CF_PARTICIPANTS)?;
        let prefix = &room_id.as_bytes()[..];

        let mut records = Vec::new();
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(prefix, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if key.len() < 16 || &key[..16] != prefix {
                break;
            }
            records.push(decode::<ParticipantRecord>(&value)?);
        }
        records.sort_by_key(|p| p.joined_at);
        Ok(records)
    }

    // ─── Messages ─────────────────────────────────────────────────────

    /// Next free message sequence number of a room.
    fn next_message_seq(&self, room_id: Uuid) -> Result<u64, StoreError> {
        let cf = self.cf(CF_MESSAGES)?;
        let end = Self::message_key(room_id, u64::MAX);
        let mut iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&end, Direction::Reverse));
        match iter.next() {
            Some(item) => {
                let (key, _) = item?;
                if key.len() == 24 && &key[..16] == room_id.as_bytes() {
                    let mut buf = [0u8; 8];
                    buf.copy_from_slice(&key[16..24]);
                    Ok(u64::from_be_bytes(buf) + 1)
                } else {
                    Ok(0)
                }
            }
            None => Ok(0),
        }
    }

    fn recent_messages(&self, room_id: Uuid, limit: usize) -> Result<Vec<StoredMessage>, StoreError> {
        let cf = self.cf(CF_MESSAGES)?;
        let end = Self::message_key(room_id, u64::MAX);

        let mut messages = Vec::new();
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&end, Direction::Reverse));
        for item in iter {
            if messages.len() >= limit {
                break;
            }
            let (key, value) = item?;
            if key.len() < 24 || &key[..16] != room_id.as_bytes() {
                break;
            }
            messages.push(decode::<StoredMessage>(&value)?);
        }
        messages.reverse();
        Ok(messages)
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Flush memtables to disk.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }

    fn get<T: DeserializeOwned>(&self, cf: &str, key: &[u8]) -> Result<Option<T>, StoreError> {
        let cf = self.cf(cf)?;
        match self.db.get_cf(cf, key)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn put<T: Serialize>(&self, cf: &str, key: &[u8], value: &T) -> Result<(), StoreError> {
        let cf = self.cf(cf)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(cf, key, encode(value)?);
        self.write(batch)
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    /// room_id (16 bytes) + user_id (utf-8)
    fn participant_key(room_id: Uuid, user_id: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(16 + user_id.len());
        key.extend_from_slice(room_id.as_bytes());
        key.extend_from_slice(user_id.as_bytes());
        key
    }

    /// room_id (16 bytes) + seq (8 bytes big-endian)
    fn message_key(room_id: Uuid, seq: u64) -> Vec<u8> {
        let mut key = Vec::with_capacity(24);
        key.extend_from_slice(room_id.as_bytes());
        key.extend_from_slice(&seq.to_be_bytes());
        key
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::Deserialization(e.to_string()))?;
    Ok(value)
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[async_trait]
impl PersistenceGateway for RoomStore {
    async fn find_room_by_code(&self, code: &str) -> Result<Option<RoomRecord>, StoreError> {
        self.load_room(code)
    }

    async fn create_room(&self, room: RoomRecord) -> Result<(), StoreError> {
        self.save_room(&room)
    }

    async fn put_user(&self, user: UserRecord) -> Result<(), StoreError> {
        self.put(CF_USERS, user.id.as_bytes(), &user)
    }

    async fn find_user(&self, user_id: &str) -> Result<Option<UserRecord>, StoreError> {
        self.load_user(user_id)
    }

    async fn upsert_participant(&self, room_id: Uuid, user_id: &str, at: u64) -> Result<(), StoreError> {
        let record = match self.load_participant(room_id, user_id)? {
            Some(mut existing) => {
                existing.is_active = true;
                existing.last_ping_at = at;
                existing.left_at = None;
                existing
            }
            None => ParticipantRecord {
                room_id,
                user_id: user_id.to_string(),
                is_active: true,
                joined_at: at,
                last_ping_at: at,
                left_at: None,
            },
        };
        self.put(CF_PARTICIPANTS, &Self::participant_key(room_id, user_id), &record)
    }

    async fn mark_participant_inactive(
        &self,
        room_id: Uuid,
        user_id: &str,
        left_at: u64,
    ) -> Result<(), StoreError> {
        if let Some(mut record) = self.load_participant(room_id, user_id)? {
            record.is_active = false;
            record.left_at = Some(left_at);
            self.put(CF_PARTICIPANTS, &Self::participant_key(room_id, user_id), &record)?;
        }
        Ok(())
    }

    async fn list_active_participants(&self, room_id: Uuid) -> Result<Vec<ParticipantInfo>, StoreError> {
        self.participants_of(room_id)?
            .into_iter()
            .filter(|p| p.is_active)
            .map(|p| {
                let username = self.username(&p.user_id)?;
                Ok(ParticipantInfo {
                    id: p.user_id,
                    username,
                })
            })
            .collect()
    }

    async fn update_room_playback_snapshot(
        &self,
        code: &str,
        snapshot: &PlaybackSnapshot,
    ) -> Result<(), StoreError> {
        self.update_room(code, |room| {
            room.current_time = snapshot.position;
            room.is_playing = snapshot.is_playing;
            room.last_sync_at = Some(snapshot.timestamp);
        })
    }

    async fn set_room_lifecycle_flags(&self, code: &str, flags: LifecycleFlags) -> Result<(), StoreError> {
        self.update_room(code, |room| {
            room.is_active = flags.is_active;
            room.is_paused = flags.is_paused;
        })
    }

    async fn fetch_recent_messages(&self, room_id: Uuid, limit: usize) -> Result<Vec<ChatMessage>, StoreError> {
        self.recent_messages(room_id, limit)?
            .into_iter()
            .map(|m| {
                let username = self.username(&m.user_id)?;
                Ok(ChatMessage {
                    id: m.id,
                    user_id: m.user_id,
                    username,
                    message: m.content,
                    timestamp: m.created_at,
                })
            })
            .collect()
    }

    async fn append_message(
        &self,
        room_id: Uuid,
        user_id: &str,
        content: &str,
        at: u64,
    ) -> Result<ChatMessage, StoreError> {
        let stored = StoredMessage {
            id: Uuid::new_v4(),
            room_id,
            user_id: user_id.to_string(),
            content: content.to_string(),
            created_at: at,
        };
        {
            let _guard = self.append_lock.lock().unwrap_or_else(|e| e.into_inner());
            let seq = self.next_message_seq(room_id)?;
            self.put(CF_MESSAGES, &Self::message_key(room_id, seq), &stored)?;
        }

        Ok(ChatMessage {
            id: stored.id,
            user_id: stored.user_id,
            username: self.username(user_id)?,
            message: stored.content,
            timestamp: at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn temp_store() -> (RoomStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = RoomStore::open(StoreConfig::for_testing(dir.path())).unwrap();
        (store, dir)
    }

    #[test]
    fn test_open_creates_column_families() {
        let (store, _dir) = temp_store();
        for name in COLUMN_FAMILIES {
            assert!(store.cf(name).is_ok());
        }
    }

    #[test]
    fn test_room_roundtrip_and_listing() {
        let (store, _dir) = temp_store();
        let room = RoomRecord::new("R1", "Room", "h").with_guest_control(true);
        store.save_room(&room).unwrap();
        store.save_room(&RoomRecord::new("R2", "Other", "h")).unwrap();

        assert_eq!(store.load_room("R1").unwrap(), Some(room));
        assert!(store.load_room("R9").unwrap().is_none());

        let mut codes = store.list_rooms().unwrap();
        codes.sort();
        assert_eq!(codes, vec!["R1", "R2"]);
    }

    #[test]
    fn test_message_sequence_is_per_room() {
        let (store, _dir) = temp_store();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert_eq!(store.next_message_seq(a).unwrap(), 0);

        let msg = StoredMessage {
            id: Uuid::new_v4(),
            room_id: a,
            user_id: "u".into(),
            content: "hi".into(),
            created_at: 1,
        };
        store.put(CF_MESSAGES, &RoomStore::message_key(a, 0), &msg).unwrap();
        store.put(CF_MESSAGES, &RoomStore::message_key(a, 1), &msg).unwrap();

        assert_eq!(store.next_message_seq(a).unwrap(), 2);
        assert_eq!(store.next_message_seq(b).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_update_missing_room_is_not_found() {
        let (store, _dir) = temp_store();
        let err = store
            .set_room_lifecycle_flags(
                "nope",
                LifecycleFlags {
                    is_active: false,
                    is_paused: false,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn test_concurrent_room_updates_keep_both_fields() {
        let (store, _dir) = temp_store();
        store.save_room(&RoomRecord::new("R1", "Room", "h")).unwrap();

        std::thread::scope(|scope| {
            scope.spawn(|| {
                for _ in 0..200 {
                    store.update_room("R1", |room| room.current_time += 1.0).unwrap();
                }
            });
            scope.spawn(|| {
                for _ in 0..200 {
                    store
                        .update_room("R1", |room| {
                            room.last_sync_at = Some(room.last_sync_at.unwrap_or(0) + 1)
                        })
                        .unwrap();
                }
            });
        });

        let room = store.load_room("R1").unwrap().unwrap();
        assert_eq!(room.current_time, 200.0);
        assert_eq!(room.last_sync_at, Some(200));
    }

    #[tokio::test]
    async fn test_snapshot_write_keeps_pause_flag() {
        let (store, _dir) = temp_store();
        store.save_room(&RoomRecord::new("R1", "Room", "h")).unwrap();
        store
            .set_room_lifecycle_flags(
                "R1",
                LifecycleFlags {
                    is_active: true,
                    is_paused: true,
                },
            )
            .await
            .unwrap();
        let snapshot = crate::state::RoomPlaybackState::new(12.0, false, 5).snapshot();
        store.update_room_playback_snapshot("R1", &snapshot).await.unwrap();

        let room = store.load_room("R1").unwrap().unwrap();
        assert!(room.is_paused);
        assert_eq!(room.current_time, 12.0);
    }
}
