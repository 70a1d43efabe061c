//! Presence bookkeeping: which connection is in which room as which user,
//! and who the runtime host of each room is.
//!
//! ## Layout
//!
//! ```text
//! PresenceTracker (global)          RoomPresence (one per live room)
//! ┌──────────────────────────┐      ┌───────────────────────────────┐
//! │ ConnectionId → Entry     │      │ join_seq → (conn, user, name) │
//! │   room_code, user_id,    │      │ conn → join_seq               │
//! │   username, join_seq     │      │ host: Option<UserId>          │
//! └──────────────────────────┘      └───────────────────────────────┘
//! ```
//!
//! The global index answers "what room is this connection in"; the per-room
//! half answers "who is in this room" and is only touched while the room's
//! lock is held. Members are ordered by join sequence so host handover is
//! deterministic: the remaining connection that joined first wins.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::protocol::UserId;

/// Identity of one transport connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// One connection's membership.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceEntry {
    pub connection_id: ConnectionId,
    pub room_code: String,
    pub user_id: UserId,
    pub username: String,
    /// Process-wide join order, used for host tie-breaks.
    pub join_seq: u64,
}

/// Global connection → membership index.
pub struct PresenceTracker {
    connections: RwLock<HashMap<ConnectionId, PresenceEntry>>,
    next_seq: AtomicU64,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
        }
    }

    /// Record that `connection_id` joined `room_code`, replacing any previous entry.
    pub async fn register(
        &self,
        connection_id: ConnectionId,
        room_code: &str,
        user_id: &str,
        username: &str,
    ) -> PresenceEntry {
        let entry = PresenceEntry {
            connection_id,
            room_code: room_code.to_string(),
            user_id: user_id.to_string(),
            username: username.to_string(),
            join_seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
        };
        self.connections
            .write()
            .await
            .insert(connection_id, entry.clone());
        entry
    }

    pub async fn remove(&self, connection_id: ConnectionId) -> Option<PresenceEntry> {
        self.connections.write().await.remove(&connection_id)
    }

    pub async fn get(&self, connection_id: ConnectionId) -> Option<PresenceEntry> {
        self.connections.read().await.get(&connection_id).cloned()
    }

    pub async fn room_of(&self, connection_id: ConnectionId) -> Option<String> {
        self.connections
            .read()
            .await
            .get(&connection_id)
            .map(|e| e.room_code.clone())
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }
}

impl Default for PresenceTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Member {
    connection_id: ConnectionId,
    user_id: UserId,
    username: String,
}

/// Result of removing a connection from a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    pub user_id: UserId,
    pub username: String,
    /// Set when the host left and another member took over.
    pub new_host: Option<UserId>,
}

/// Members and runtime host of a single room.
#[derive(Debug, Default)]
pub struct RoomPresence {
    members: BTreeMap<u64, Member>,
    by_connection: HashMap<ConnectionId, u64>,
    host: Option<UserId>,
}

impl RoomPresence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a member. Returns `true` if they became the host.
    pub fn add(&mut self, entry: &PresenceEntry) -> bool {
        if let Some(old_seq) = self.by_connection.insert(entry.connection_id, entry.join_seq) {
            self.members.remove(&old_seq);
        }
        self.members.insert(
            entry.join_seq,
            Member {
                connection_id: entry.connection_id,
                user_id: entry.user_id.clone(),
                username: entry.username.clone(),
            },
        );
        if self.host.is_none() {
            self.host = Some(entry.user_id.clone());
            return true;
        }
        false
    }

    /// Remove a connection, handing the host role to the earliest remaining
    /// member if the departing user held it and has no other connection here.
    pub fn remove(&mut self, connection_id: ConnectionId) -> Option<Departure> {
        let seq = self.by_connection.remove(&connection_id)?;
        let member = self.members.remove(&seq)?;

        let mut new_host = None;
        if self.host.as_deref() == Some(member.user_id.as_str()) && !self.has_user(&member.user_id) {
            self.host = self.members.values().next().map(|m| m.user_id.clone());
            new_host = self.host.clone();
        }

        Some(Departure {
            user_id: member.user_id,
            username: member.username,
            new_host,
        })
    }

    /// Remove everyone, returning `(connection, user)` pairs in join order.
    pub fn drain(&mut self) -> Vec<(ConnectionId, UserId)> {
        self.by_connection.clear();
        self.host = None;
        std::mem::take(&mut self.members)
            .into_values()
            .map(|m| (m.connection_id, m.user_id))
            .collect()
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub fn contains(&self, connection_id: ConnectionId) -> bool {
        self.by_connection.contains_key(&connection_id)
    }

    /// The user behind a connection in this room.
    pub fn user_of(&self, connection_id: ConnectionId) -> Option<&str> {
        let seq = self.by_connection.get(&connection_id)?;
        self.members.get(seq).map(|m| m.user_id.as_str())
    }

    /// Whether any connection of `user_id` is still present.
    pub fn has_user(&self, user_id: &str) -> bool {
        self.members.values().any(|m| m.user_id == user_id)
    }

    /// Connections in join order.
    pub fn connections(&self) -> Vec<ConnectionId> {
        self.members.values().map(|m| m.connection_id).collect()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}
