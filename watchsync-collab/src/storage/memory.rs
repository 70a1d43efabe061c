//! In-process store, used when no database path is configured and in tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{
    username_or_id, LifecycleFlags, ParticipantRecord, PersistenceGateway, RoomRecord, StoreError,
    StoredMessage, UserRecord,
};
use crate::protocol::{ChatMessage, ParticipantInfo};
use crate::state::PlaybackSnapshot;

#[derive(Default)]
pub struct MemoryStore {
    rooms: RwLock<HashMap<String, RoomRecord>>,
    users: RwLock<HashMap<String, UserRecord>>,
    /// Per room, in first-join order.
    participants: RwLock<HashMap<Uuid, Vec<ParticipantRecord>>>,
    messages: RwLock<HashMap<Uuid, Vec<StoredMessage>>>,
    snapshot_writes: AtomicU64,
    fail_snapshot_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful playback snapshot writes so far.
    pub fn snapshot_writes(&self) -> u64 {
        self.snapshot_writes.load(Ordering::SeqCst)
    }

    /// The persisted playback snapshot of a room, if it was ever written.
    pub async fn last_snapshot(&self, code: &str) -> Option<PlaybackSnapshot> {
        let rooms = self.rooms.read().await;
        let room = rooms.get(code)?;
        room.last_sync_at.map(|_| room.playback())
    }

    /// Make snapshot writes fail until reset, to exercise the flush error path.
    pub fn set_fail_snapshot_writes(&self, fail: bool) {
        self.fail_snapshot_writes.store(fail, Ordering::SeqCst);
    }

    pub async fn room(&self, code: &str) -> Option<RoomRecord> {
        self.rooms.read().await.get(code).cloned()
    }

    pub async fn participant(&self, room_id: Uuid, user_id: &str) -> Option<ParticipantRecord> {
        self.participants
            .read()
            .await
            .get(&room_id)?
            .iter()
            .find(|p| p.user_id == user_id)
            .cloned()
    }

    async fn username(&self, user_id: &str) -> String {
        let user = self.users.read().await.get(user_id).cloned();
        username_or_id(user, user_id)
    }
}

#[async_trait]
impl PersistenceGateway for MemoryStore {
    async fn find_room_by_code(&self, code: &str) -> Result<Option<RoomRecord>, StoreError> {
        Ok(self.rooms.read().await.get(code).cloned())
    }

    async fn create_room(&self, room: RoomRecord) -> Result<(), StoreError> {
        self.rooms.write().await.insert(room.code.clone(), room);
        Ok(())
    }

    async fn put_user(&self, user: UserRecord) -> Result<(), StoreError> {
        self.users.write().await.insert(user.id.clone(), user);
        Ok(())
    }

    async fn find_user(&self, user_id: &str) -> Result<Option<UserRecord>, StoreError> {
        Ok(self.users.read().await.get(user_id).cloned())
    }

    async fn upsert_participant(&self, room_id: Uuid, user_id: &str, at: u64) -> Result<(), StoreError> {
        let mut participants = self.participants.write().await;
        let list = participants.entry(room_id).or_default();
        match list.iter_mut().find(|p| p.user_id == user_id) {
            Some(existing) => {
                existing.is_active = true;
                existing.last_ping_at = at;
                existing.left_at = None;
            }
            None => list.push(ParticipantRecord {
                room_id,
                user_id: user_id.to_string(),
                is_active: true,
                joined_at: at,
                last_ping_at: at,
                left_at: None,
            }),
        }
        Ok(())
    }

    async fn mark_participant_inactive(
        &self,
        room_id: Uuid,
        user_id: &str,
        left_at: u64,
    ) -> Result<(), StoreError> {
        let mut participants = self.participants.write().await;
        if let Some(p) = participants
            .get_mut(&room_id)
            .and_then(|list| list.iter_mut().find(|p| p.user_id == user_id))
        {
            p.is_active = false;
            p.left_at = Some(left_at);
        }
        Ok(())
    }

    async fn list_active_participants(&self, room_id: Uuid) -> Result<Vec<ParticipantInfo>, StoreError> {
        let active: Vec<String> = self
            .participants
            .read()
            .await
            .get(&room_id)
            .map(|list| {
                list.iter()
                    .filter(|p| p.is_active)
                    .map(|p| p.user_id.clone())
                    .collect()
            })
            .unwrap_or_default();

        let mut infos = Vec::with_capacity(active.len());
        for user_id in active {
            let username = self.username(&user_id).await;
            infos.push(ParticipantInfo { id: user_id, username });
        }
        Ok(infos)
    }

    async fn update_room_playback_snapshot(
        &self,
        code: &str,
        snapshot: &PlaybackSnapshot,
    ) -> Result<(), StoreError> {
        if self.fail_snapshot_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Database("snapshot writes disabled".into()));
        }
        let mut rooms = self.rooms.write().await;
        let room = rooms
            .get_mut(code)
            .ok_or_else(|| StoreError::NotFound(format!("room {code}")))?;
        room.current_time = snapshot.position;
        room.is_playing = snapshot.is_playing;
        room.last_sync_at = Some(snapshot.timestamp);
        self.snapshot_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn set_room_lifecycle_flags(&self, code: &str, flags: LifecycleFlags) -> Result<(), StoreError> {
        let mut rooms = self.rooms.write().await;
        let room = rooms
            .get_mut(code)
            .ok_or_else(|| StoreError::NotFound(format!("room {code}")))?;
        room.is_active = flags.is_active;
        room.is_paused = flags.is_paused;
        Ok(())
    }

    async fn fetch_recent_messages(&self, room_id: Uuid, limit: usize) -> Result<Vec<ChatMessage>, StoreError> {
        let recent: Vec<StoredMessage> = {
            let messages = self.messages.read().await;
            match messages.get(&room_id) {
                Some(list) => list[list.len().saturating_sub(limit)..].to_vec(),
                None => Vec::new(),
            }
        };

        let mut out = Vec::with_capacity(recent.len());
        for m in recent {
            let username = self.username(&m.user_id).await;
            out.push(ChatMessage {
                id: m.id,
                user_id: m.user_id,
                username,
                message: m.content,
                timestamp: m.created_at,
            });
        }
        Ok(out)
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
        self.messages
            .write()
            .await
            .entry(room_id)
            .or_default()
            .push(stored.clone());

        Ok(ChatMessage {
            id: stored.id,
            user_id: stored.user_id,
            username: self.username(user_id).await,
            message: stored.content,
            timestamp: at,
        })
    }
}
