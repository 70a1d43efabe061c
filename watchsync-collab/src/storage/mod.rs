//! Durable storage behind the sync engine.
//!
//! ```text
//! ┌─────────────┐  cold-start reads   ┌────────────────────┐
//! │ SyncEngine  │ ◄────────────────── │ PersistenceGateway │
//! │ (in-memory, │                     │  MemoryStore       │
//! │  authority) │ ──────────────────► │  RoomStore (Rocks) │
//! └─────────────┘  trailing writes    └────────────────────┘
//! ```
//!
//! The store is never the source of truth for a live room. It is read when a
//! room has no in-memory state yet and written as an eventually-consistent
//! echo afterwards, so duplicate or reordered writes are harmless.

pub mod memory;
pub mod rocks;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::protocol::{ChatMessage, ParticipantInfo, RoomInfo, UserId};
use crate::state::PlaybackSnapshot;

pub use memory::MemoryStore;
pub use rocks::{RoomStore, StoreConfig};

/// Durable room record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomRecord {
    pub id: Uuid,
    pub code: String,
    pub name: String,
    #[serde(default)]
    pub video_url: Option<String>,
    pub creator_id: UserId,
    #[serde(default)]
    pub allow_guest_control: bool,
    #[serde(default = "default_true")]
    pub is_public: bool,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub is_paused: bool,
    /// Last persisted playback position in seconds.
    #[serde(default)]
    pub current_time: f64,
    #[serde(default)]
    pub is_playing: bool,
    /// Epoch milliseconds of the last persisted playback snapshot.
    #[serde(default)]
    pub last_sync_at: Option<u64>,
}

fn default_true() -> bool {
    true
}

impl RoomRecord {
    pub fn new(code: impl Into<String>, name: impl Into<String>, creator_id: impl Into<UserId>) -> Self {
        Self {
            id: Uuid::new_v4(),
            code: code.into(),
            name: name.into(),
            video_url: None,
            creator_id: creator_id.into(),
            allow_guest_control: false,
            is_public: true,
            is_active: true,
            is_paused: false,
            current_time: 0.0,
            is_playing: false,
            last_sync_at: None,
        }
    }

    pub fn with_guest_control(mut self, allow: bool) -> Self {
        self.allow_guest_control = allow;
        self
    }

    pub fn with_video_url(mut self, url: impl Into<String>) -> Self {
        self.video_url = Some(url.into());
        self
    }

    pub fn info(&self) -> RoomInfo {
        RoomInfo {
            id: self.id,
            name: self.name.clone(),
            code: self.code.clone(),
            video_url: self.video_url.clone(),
            creator_id: self.creator_id.clone(),
            allow_guest_control: self.allow_guest_control,
        }
    }

    pub fn lifecycle(&self) -> LifecycleFlags {
        LifecycleFlags {
            is_active: self.is_active,
            is_paused: self.is_paused,
        }
    }

    /// The persisted playback snapshot, if one was ever written.
    pub fn playback(&self) -> PlaybackSnapshot {
        PlaybackSnapshot {
            position: self.current_time,
            is_playing: self.is_playing,
            timestamp: self.last_sync_at.unwrap_or(0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: UserId,
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantRecord {
    pub room_id: Uuid,
    pub user_id: UserId,
    pub is_active: bool,
    pub joined_at: u64,
    pub last_ping_at: u64,
    pub left_at: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: Uuid,
    pub room_id: Uuid,
    pub user_id: UserId,
    pub content: String,
    pub created_at: u64,
}

/// Administrative flags of a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleFlags {
    pub is_active: bool,
    pub is_paused: bool,
}

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Not found: {0}")]
    NotFound(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Durable collaborator consulted by the sync engine.
///
/// Implementations must tolerate at-least-once calls: every write is an
/// idempotent overwrite or an append.
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    async fn find_room_by_code(&self, code: &str) -> Result<Option<RoomRecord>, StoreError>;

    /// Insert or replace a room record (keyed by code).
    async fn create_room(&self, room: RoomRecord) -> Result<(), StoreError>;

    async fn put_user(&self, user: UserRecord) -> Result<(), StoreError>;

    async fn find_user(&self, user_id: &str) -> Result<Option<UserRecord>, StoreError>;

    /// Mark `user_id` active in `room_id`, creating the record on first join.
    async fn upsert_participant(&self, room_id: Uuid, user_id: &str, at: u64) -> Result<(), StoreError>;

    async fn mark_participant_inactive(
        &self,
        room_id: Uuid,
        user_id: &str,
        left_at: u64,
    ) -> Result<(), StoreError>;

    /// Active participants of a room, in join order.
    async fn list_active_participants(&self, room_id: Uuid) -> Result<Vec<ParticipantInfo>, StoreError>;

    async fn update_room_playback_snapshot(
        &self,
        code: &str,
        snapshot: &PlaybackSnapshot,
    ) -> Result<(), StoreError>;

    async fn set_room_lifecycle_flags(&self, code: &str, flags: LifecycleFlags) -> Result<(), StoreError>;

    /// Up to `limit` most recent messages, oldest first.
    async fn fetch_recent_messages(&self, room_id: Uuid, limit: usize) -> Result<Vec<ChatMessage>, StoreError>;

    async fn append_message(
        &self,
        room_id: Uuid,
        user_id: &str,
        content: &str,
        at: u64,
    ) -> Result<ChatMessage, StoreError>;
}

/// Display name for `user_id`, falling back to the id itself.
pub(crate) fn username_or_id(user: Option<UserRecord>, user_id: &str) -> String {
    user.map(|u| u.username).unwrap_or_else(|| user_id.to_string())
}
