//! The sync engine: single authority over what every live room is watching
//! and who may change it.
//!
//! Architecture:
//! ```text
//!                 rooms: RwLock<HashMap<code, Arc<Mutex<RoomSlot>>>>
//!                              │
//!            ┌─────────────────┼─────────────────┐
//!            ▼                 ▼                 ▼
//!      Mutex<RoomSlot>   Mutex<RoomSlot>   Mutex<RoomSlot>
//!       ├ RoomPlaybackState
//!       ├ RoomPresence (members + runtime host)
//!       ├ BroadcastGroup
//!       └ cached RoomControlPolicy
//! ```
//!
//! Every mutation of a room happens while holding that room's mutex, so
//! events for one room are applied one at a time in arrival order (tokio's
//! mutex is FIFO). Rooms never share a lock; the outer map is only locked
//! briefly to look a slot up or insert/remove one.
//!
//! A slot is created on the first join and evicted when its last
//! connection leaves or the room is paused/ended. Eviction flags the slot
//! before removing it from the map, so a task that looked the slot up just
//! before eviction notices and retries against the map.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::broadcast::{BroadcastGroup, RoomSubscription};
use crate::clock::{Clock, SystemClock};
use crate::debounce::PersistDebouncer;
use crate::error::SyncError;
use crate::presence::{ConnectionId, PresenceTracker, RoomPresence};
use crate::protocol::{
    Audience, ChatMessage, LifecycleTransition, ParticipantInfo, PlaybackAction, ProposedState,
    RoomInfo, RoomSnapshot, ServerEvent, StateUpdate, UserId,
};
use crate::state::{validate_position, PlaybackChange, RoomPlaybackState};
use crate::storage::{username_or_id, LifecycleFlags, PersistenceGateway, RoomRecord};

/// Engine tuning.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Delay before a playback change is written to durable storage
    pub persist_debounce: Duration,
    /// Drift (seconds) above which a periodic report gets a correction
    pub drift_threshold_secs: f64,
    /// Join / sync latency (ms) above which a warning is logged
    pub high_latency_ms: u64,
    /// Chat messages delivered on join and on history requests
    pub history_limit: usize,
    /// Broadcast buffer per room
    pub broadcast_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            persist_debounce: Duration::from_secs(5),
            drift_threshold_secs: 3.0,
            high_latency_ms: 500,
            history_limit: 50,
            broadcast_capacity: 256,
        }
    }
}

/// Who may control playback in a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomControlPolicy {
    /// Durable creator of the room (never changes).
    pub creator_id: UserId,
    pub allow_guest_control: bool,
}

impl RoomControlPolicy {
    pub fn from_record(record: &RoomRecord) -> Self {
        Self {
            creator_id: record.creator_id.clone(),
            allow_guest_control: record.allow_guest_control,
        }
    }

    pub fn permits(&self, user_id: &str) -> bool {
        self.allow_guest_control || self.creator_id == user_id
    }
}

/// Result of a successful join.
pub struct JoinOutcome {
    pub snapshot: RoomSnapshot,
    /// Recent chat, oldest first.
    pub history: Vec<ChatMessage>,
    pub subscription: RoomSubscription,
}

struct RoomSlot {
    code: String,
    room: RoomInfo,
    /// `None` until fetched, or after a refresh was requested.
    policy: Option<RoomControlPolicy>,
    state: RoomPlaybackState,
    presence: RoomPresence,
    broadcast: BroadcastGroup,
    evicted: bool,
}

impl RoomSlot {
    fn new(record: &RoomRecord, now_ms: u64, broadcast_capacity: usize) -> Self {
        Self {
            code: record.code.clone(),
            room: record.info(),
            policy: Some(RoomControlPolicy::from_record(record)),
            state: RoomPlaybackState::new(record.current_time, record.is_playing, now_ms),
            presence: RoomPresence::new(),
            broadcast: BroadcastGroup::new(broadcast_capacity),
            evicted: false,
        }
    }

    /// The user behind `connection_id`, if it is a member of this room.
    fn member(&self, connection_id: ConnectionId) -> Result<UserId, SyncError> {
        self.presence
            .user_of(connection_id)
            .map(str::to_string)
            .ok_or_else(|| SyncError::Forbidden(format!("You are not in room {}", self.code)))
    }

    fn publish(&self, audience: Audience, event: ServerEvent) {
        if let Err(e) = self.broadcast.publish(audience, event) {
            log::error!("Failed to publish to room {}: {}", self.code, e);
        }
    }
}

pub struct SyncEngine {
    config: EngineConfig,
    store: Arc<dyn PersistenceGateway>,
    clock: Arc<dyn Clock>,
    rooms: RwLock<HashMap<String, Arc<Mutex<RoomSlot>>>>,
    presence: PresenceTracker,
    debouncer: PersistDebouncer,
}

impl SyncEngine {
    pub fn new(config: EngineConfig, store: Arc<dyn PersistenceGateway>) -> Self {
        Self::with_clock(config, store, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: EngineConfig,
        store: Arc<dyn PersistenceGateway>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let debouncer = PersistDebouncer::new(config.persist_debounce);
        Self {
            config,
            store,
            clock,
            rooms: RwLock::new(HashMap::new()),
            presence: PresenceTracker::new(),
            debouncer,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn PersistenceGateway> {
        &self.store
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    // ─── Membership ───────────────────────────────────────────────────

    /// Join `room_code` as `user_id` on `connection_id`.
    ///
    /// A connection is in at most one room; joining another room leaves
    /// the current one first.
    pub async fn join(
        &self,
        connection_id: ConnectionId,
        room_code: &str,
        user_id: &str,
    ) -> Result<JoinOutcome, SyncError> {
        let started = self.clock.now_ms();

        if self.presence.get(connection_id).await.is_some() {
            self.leave(connection_id).await;
        }

        let record = self.find_room(room_code).await?;
        ensure_joinable(&record)?;

        let mut slot = self.lock_or_create(&record).await;
        let result = self
            .join_locked(&mut slot, connection_id, room_code, user_id, started)
            .await;
        if result.is_err() && slot.presence.is_empty() {
            self.evict(&mut slot, false).await;
        }
        result
    }

    async fn join_locked(
        &self,
        slot: &mut RoomSlot,
        connection_id: ConnectionId,
        room_code: &str,
        user_id: &str,
        started: u64,
    ) -> Result<JoinOutcome, SyncError> {
        // Lifecycle transitions flip the durable flags under this same lock.
        let record = self.find_room(room_code).await?;
        ensure_joinable(&record)?;
        slot.room = record.info();

        let now = self.clock.now_ms();
        if slot.presence.is_empty() {
            // Cold start: the record read before locking may predate an
            // eviction write that finished while this join waited.
            slot.state = RoomPlaybackState::new(record.current_time, record.is_playing, now);
            slot.policy = Some(RoomControlPolicy::from_record(&record));
        }
        self.store.upsert_participant(record.id, user_id, now).await?;
        let username = username_or_id(self.store.find_user(user_id).await?, user_id);
        let participants = self.store.list_active_participants(record.id).await?;
        let history = match self
            .store
            .fetch_recent_messages(record.id, self.config.history_limit)
            .await
        {
            Ok(history) => history,
            Err(e) => {
                log::warn!("Failed to load chat history for room {room_code}: {e}");
                Vec::new()
            }
        };

        let entry = self
            .presence
            .register(connection_id, room_code, user_id, &username)
            .await;
        if slot.presence.add(&entry) {
            log::info!("{user_id} is now host of room {room_code}");
        }
        let subscription = slot.broadcast.subscribe(connection_id, room_code);

        slot.publish(
            Audience::RoomExcept(connection_id),
            ServerEvent::UserJoined {
                user_id: user_id.to_string(),
                username,
            },
        );
        slot.publish(
            Audience::RoomExcept(connection_id),
            ServerEvent::ParticipantsUpdate {
                participants: participants.clone(),
            },
        );

        let latency = self.clock.now_ms().saturating_sub(started);
        if latency > self.config.high_latency_ms {
            log::warn!("High join latency: {latency}ms for user {user_id} in room {room_code}");
        }
        log::info!(
            "{user_id} joined room {room_code} ({} connections)",
            slot.presence.len()
        );

        Ok(JoinOutcome {
            snapshot: RoomSnapshot {
                room: slot.room.clone(),
                state: slot.state.snapshot(),
                participants,
                host_user_id: slot.presence.host().map(str::to_string),
                latency,
            },
            history,
            subscription,
        })
    }

    /// Remove `connection_id` from its room. Unknown connections are ignored.
    pub async fn leave(&self, connection_id: ConnectionId) {
        let Some(entry) = self.presence.remove(connection_id).await else {
            return;
        };
        let Some(mut slot) = self.lock_live(&entry.room_code).await else {
            return;
        };
        let Some(departure) = slot.presence.remove(connection_id) else {
            return;
        };

        let room_code = entry.room_code;
        let now = self.clock.now_ms();

        if !slot.presence.has_user(&departure.user_id) {
            if let Err(e) = self
                .store
                .mark_participant_inactive(slot.room.id, &departure.user_id, now)
                .await
            {
                log::warn!(
                    "Failed to mark {} inactive in room {room_code}: {e}",
                    departure.user_id
                );
            }
        }
        log::info!("{} left room {room_code}", departure.user_id);

        if slot.presence.is_empty() {
            self.evict(&mut slot, false).await;
            return;
        }

        if let Some(new_host) = departure.new_host {
            log::info!("Host of room {room_code} handed over to {new_host}");
            slot.publish(Audience::Room, ServerEvent::HostChanged { user_id: new_host });
        }

        slot.publish(
            Audience::RoomExcept(connection_id),
            ServerEvent::UserLeft {
                user_id: departure.user_id,
                username: departure.username,
            },
        );
        match self.store.list_active_participants(slot.room.id).await {
            Ok(participants) => slot.publish(
                Audience::RoomExcept(connection_id),
                ServerEvent::ParticipantsUpdate { participants },
            ),
            Err(e) => log::warn!("Failed to list participants of room {room_code}: {e}"),
        }
    }

    /// Active participants of a room, from durable storage.
    pub async fn request_participants(&self, room_code: &str) -> Result<Vec<ParticipantInfo>, SyncError> {
        let record = self.find_room(room_code).await?;
        Ok(self.store.list_active_participants(record.id).await?)
    }

    // ─── Playback ─────────────────────────────────────────────────────

    /// Apply a full state proposal. The update goes to every other member;
    /// the sender gets it back as the return value only.
    pub async fn apply_state_change(
        &self,
        connection_id: ConnectionId,
        room_code: &str,
        proposed: ProposedState,
        action: Option<PlaybackAction>,
        client_timestamp: Option<u64>,
    ) -> Result<StateUpdate, SyncError> {
        let position = validate_position(proposed.position)?;
        let action = action.unwrap_or(PlaybackAction::Update);
        let change = match action {
            PlaybackAction::Seek => PlaybackChange::seek(position),
            _ => PlaybackChange::set(position, proposed.is_playing),
        };
        self.apply_change(connection_id, room_code, change, action, client_timestamp)
            .await
    }

    /// Start playback at `position`, or where playback currently is.
    pub async fn play(
        &self,
        connection_id: ConnectionId,
        room_code: &str,
        position: Option<f64>,
        client_timestamp: Option<u64>,
    ) -> Result<StateUpdate, SyncError> {
        let position = position.map(validate_position).transpose()?;
        self.apply_change(
            connection_id,
            room_code,
            PlaybackChange::play(position),
            PlaybackAction::Play,
            client_timestamp,
        )
        .await
    }

    pub async fn pause(
        &self,
        connection_id: ConnectionId,
        room_code: &str,
        position: Option<f64>,
        client_timestamp: Option<u64>,
    ) -> Result<StateUpdate, SyncError> {
        let position = position.map(validate_position).transpose()?;
        self.apply_change(
            connection_id,
            room_code,
            PlaybackChange::pause(position),
            PlaybackAction::Pause,
            client_timestamp,
        )
        .await
    }

    pub async fn seek(
        &self,
        connection_id: ConnectionId,
        room_code: &str,
        position: f64,
        client_timestamp: Option<u64>,
    ) -> Result<StateUpdate, SyncError> {
        let position = validate_position(position)?;
        self.apply_change(
            connection_id,
            room_code,
            PlaybackChange::seek(position),
            PlaybackAction::Seek,
            client_timestamp,
        )
        .await
    }

    async fn apply_change(
        &self,
        connection_id: ConnectionId,
        room_code: &str,
        change: PlaybackChange,
        action: PlaybackAction,
        client_timestamp: Option<u64>,
    ) -> Result<StateUpdate, SyncError> {
        let mut slot = self.lock_member(connection_id, room_code).await?;
        let user_id = slot.member(connection_id)?;

        let policy = self.policy(&mut slot).await?;
        if !policy.permits(&user_id) {
            log::debug!("Rejected {action:?} from {user_id} in room {room_code}");
            return Err(SyncError::Forbidden(
                "Only the host can control video playback".to_string(),
            ));
        }

        let now = self.clock.now_ms();
        slot.state.apply(change, now);

        let latency = client_timestamp.map(|ts| now as i64 - ts as i64);
        if let Some(ms) = latency {
            if ms > self.config.high_latency_ms as i64 {
                log::warn!("High sync latency: {ms}ms in room {room_code}");
            }
        }

        let update = StateUpdate {
            position: slot.state.position(),
            is_playing: slot.state.is_playing(),
            action,
            latency,
            server_timestamp: now,
        };
        slot.broadcast.publish(
            Audience::RoomExcept(connection_id),
            ServerEvent::VideoStateUpdate(update.clone()),
        )?;
        self.debouncer
            .schedule(room_code, slot.state.snapshot(), self.store.clone());

        log::debug!(
            "{action:?} in room {room_code} by {user_id}: {:.2}s playing={}",
            update.position,
            update.is_playing
        );
        Ok(update)
    }

    /// Compare a member's locally observed playback with the authoritative
    /// state. Returns a correction for that member alone when it drifted
    /// past the threshold or disagrees on whether playback is running.
    pub async fn periodic_reconcile(
        &self,
        connection_id: ConnectionId,
        room_code: &str,
        reported_position: f64,
        reported_is_playing: bool,
        client_timestamp: Option<u64>,
    ) -> Result<Option<StateUpdate>, SyncError> {
        let reported_position = validate_position(reported_position)?;
        let slot = self.lock_member(connection_id, room_code).await?;

        let now = self.clock.now_ms();
        let drift = slot.state.drift(reported_position, now);
        if drift <= self.config.drift_threshold_secs
            && reported_is_playing == slot.state.is_playing()
        {
            return Ok(None);
        }

        log::debug!("Correcting drift of {drift:.2}s for {connection_id} in room {room_code}");
        Ok(Some(StateUpdate {
            position: slot.state.projected_position(now),
            is_playing: slot.state.is_playing(),
            action: PlaybackAction::SyncCheck,
            latency: client_timestamp.map(|ts| now as i64 - ts as i64),
            server_timestamp: now,
        }))
    }

    /// Forget the cached control policy so the next permission check reads
    /// the durable room record again. Returns whether the room is live.
    pub async fn refresh_room_policy(&self, room_code: &str) -> bool {
        match self.lock_live(room_code).await {
            Some(mut slot) => {
                slot.policy = None;
                true
            }
            None => false,
        }
    }

    // ─── Lifecycle ────────────────────────────────────────────────────

    /// Pause, resume or end a room. Reserved to the room's durable creator.
    ///
    /// Pause and end evict every member: each gets a `room-paused` /
    /// `room-ended` notice and must rejoin explicitly once resumed.
    pub async fn lifecycle_transition(
        &self,
        room_code: &str,
        requester_id: &str,
        transition: LifecycleTransition,
    ) -> Result<(), SyncError> {
        let record = self.find_room(room_code).await?;
        if record.creator_id != requester_id {
            return Err(SyncError::Forbidden(
                "Only the room creator can pause, resume or end the room".to_string(),
            ));
        }

        // Hold the room lock so joins serialize with the flag change.
        let mut slot = self.lock_or_create(&record).await;
        let result = self.transition_locked(&mut slot, transition).await;
        if slot.presence.is_empty() && !slot.evicted {
            self.evict(&mut slot, false).await;
        }
        result
    }

    async fn transition_locked(
        &self,
        slot: &mut RoomSlot,
        transition: LifecycleTransition,
    ) -> Result<(), SyncError> {
        let record = self.find_room(&slot.code).await?;
        let current = record.lifecycle();
        let next = next_lifecycle(current, transition)?;

        self.store
            .set_room_lifecycle_flags(&record.code, next)
            .await?;
        log::info!("Room {} {:?} by creator", record.code, transition);

        match transition {
            LifecycleTransition::Pause => {
                self.evict_all(
                    slot,
                    ServerEvent::RoomPaused {
                        room_code: record.code.clone(),
                        reason: "The host paused this room".to_string(),
                    },
                )
                .await
            }
            LifecycleTransition::End => {
                self.evict_all(
                    slot,
                    ServerEvent::RoomEnded {
                        room_code: record.code.clone(),
                        reason: "The host ended this room".to_string(),
                    },
                )
                .await
            }
            LifecycleTransition::Resume => {}
        }
        Ok(())
    }

    /// Disconnect every member of a room and discard its live state.
    async fn evict_all(&self, slot: &mut RoomSlot, notice: ServerEvent) {
        let now = self.clock.now_ms();
        slot.state.halt(now);

        let members = slot.presence.drain();
        let mut users = BTreeSet::new();
        for (connection_id, user_id) in members {
            self.presence.remove(connection_id).await;
            users.insert(user_id);
        }
        for user_id in &users {
            if let Err(e) = self
                .store
                .mark_participant_inactive(slot.room.id, user_id, now)
                .await
            {
                log::warn!("Failed to mark {user_id} inactive in room {}: {e}", slot.code);
            }
        }

        slot.publish(Audience::Room, notice);
        log::info!("Evicted {} users from room {}", users.len(), slot.code);
        self.evict(slot, true).await;
    }

    // ─── Chat & relays ────────────────────────────────────────────────

    /// Store a chat message and deliver it to the whole room, sender included.
    pub async fn send_chat_message(
        &self,
        connection_id: ConnectionId,
        room_code: &str,
        content: &str,
    ) -> Result<ChatMessage, SyncError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(SyncError::InvalidPayload("message must not be empty".to_string()));
        }

        let slot = self.lock_member(connection_id, room_code).await?;
        let user_id = slot.member(connection_id)?;
        let message = self
            .store
            .append_message(slot.room.id, &user_id, content, self.clock.now_ms())
            .await?;
        slot.broadcast
            .publish(Audience::Room, ServerEvent::ChatMessage(message.clone()))?;
        Ok(message)
    }

    /// Most recent chat messages of a room, oldest first.
    pub async fn message_history(&self, room_code: &str) -> Result<Vec<ChatMessage>, SyncError> {
        let record = self.find_room(room_code).await?;
        Ok(self
            .store
            .fetch_recent_messages(record.id, self.config.history_limit)
            .await?)
    }

    /// Relay a free-form activity notice to the other members.
    pub async fn user_activity(
        &self,
        connection_id: ConnectionId,
        room_code: &str,
        activity: &str,
    ) -> Result<(), SyncError> {
        let slot = self.lock_member(connection_id, room_code).await?;
        let user_id = slot.member(connection_id)?;
        slot.broadcast.publish(
            Audience::RoomExcept(connection_id),
            ServerEvent::UserActivity {
                user_id,
                activity: activity.to_string(),
            },
        )?;
        Ok(())
    }

    /// Answer a latency probe.
    pub fn pong(&self, client_timestamp: u64) -> ServerEvent {
        ServerEvent::Pong {
            client_timestamp,
            server_timestamp: self.clock.now_ms(),
        }
    }

    /// Write every pending debounced snapshot now instead of waiting for
    /// its timer. Called on shutdown; returns the number of rooms written.
    pub async fn flush_pending(&self) -> usize {
        let slots: Vec<_> = self.rooms.read().await.values().cloned().collect();
        let mut flushed = 0;
        for slot in slots {
            let slot = slot.lock().await;
            if slot.evicted || self.debouncer.cancel(&slot.code).is_none() {
                continue;
            }
            match self
                .store
                .update_room_playback_snapshot(&slot.code, &slot.state.snapshot())
                .await
            {
                Ok(()) => flushed += 1,
                Err(e) => log::warn!("Failed to flush room {}: {e}", slot.code),
            }
        }
        flushed
    }

    // ─── Introspection ────────────────────────────────────────────────

    pub async fn playback_state(&self, room_code: &str) -> Option<RoomPlaybackState> {
        self.lock_live(room_code).await.map(|slot| slot.state)
    }

    /// Runtime host of a live room.
    pub async fn host_of(&self, room_code: &str) -> Option<UserId> {
        let slot = self.lock_live(room_code).await?;
        slot.presence.host().map(str::to_string)
    }

    /// Connections of a live room, in join order.
    pub async fn members(&self, room_code: &str) -> Vec<ConnectionId> {
        match self.lock_live(room_code).await {
            Some(slot) => slot.presence.connections(),
            None => Vec::new(),
        }
    }

    pub async fn room_of(&self, connection_id: ConnectionId) -> Option<String> {
        self.presence.room_of(connection_id).await
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn connection_count(&self) -> usize {
        self.presence.connection_count().await
    }

    pub fn is_persist_pending(&self, room_code: &str) -> bool {
        self.debouncer.is_pending(room_code)
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    async fn find_room(&self, room_code: &str) -> Result<RoomRecord, SyncError> {
        self.store
            .find_room_by_code(room_code)
            .await?
            .ok_or_else(|| SyncError::NotFound(room_code.to_string()))
    }

    async fn policy(&self, slot: &mut RoomSlot) -> Result<RoomControlPolicy, SyncError> {
        if let Some(policy) = &slot.policy {
            return Ok(policy.clone());
        }
        let record = self.find_room(&slot.code).await?;
        let policy = RoomControlPolicy::from_record(&record);
        slot.policy = Some(policy.clone());
        Ok(policy)
    }

    /// Lock a live room, or `None` if it has no in-memory state.
    async fn lock_live(&self, room_code: &str) -> Option<OwnedMutexGuard<RoomSlot>> {
        loop {
            let slot = self.rooms.read().await.get(room_code).cloned()?;
            let guard = slot.lock_owned().await;
            if !guard.evicted {
                return Some(guard);
            }
        }
    }

    /// Lock a live room that `connection_id` is a member of.
    async fn lock_member(
        &self,
        connection_id: ConnectionId,
        room_code: &str,
    ) -> Result<OwnedMutexGuard<RoomSlot>, SyncError> {
        match self.lock_live(room_code).await {
            Some(slot) if slot.presence.contains(connection_id) => Ok(slot),
            _ => Err(SyncError::Forbidden(format!("You are not in room {room_code}"))),
        }
    }

    async fn lock_or_create(&self, record: &RoomRecord) -> OwnedMutexGuard<RoomSlot> {
        loop {
            let slot = self.slot_or_insert(record).await;
            let guard = slot.lock_owned().await;
            if !guard.evicted {
                return guard;
            }
        }
    }

    async fn slot_or_insert(&self, record: &RoomRecord) -> Arc<Mutex<RoomSlot>> {
        // Fast path: read lock
        if let Some(slot) = self.rooms.read().await.get(&record.code) {
            return slot.clone();
        }

        let mut rooms = self.rooms.write().await;
        // Double-check after acquiring write lock
        if let Some(slot) = rooms.get(&record.code) {
            return slot.clone();
        }

        let slot = Arc::new(Mutex::new(RoomSlot::new(
            record,
            self.clock.now_ms(),
            self.config.broadcast_capacity,
        )));
        rooms.insert(record.code.clone(), slot.clone());
        log::debug!("Room {} is live", record.code);
        slot
    }

    /// Discard a room's live state. A pending debounced write is canceled
    /// and replaced by an immediate write of the last state; `flush` forces
    /// that write even when nothing was pending.
    ///
    /// The write completes while the slot is still mapped and locked, so a
    /// join racing the eviction waits for it and then reads the new record.
    async fn evict(&self, slot: &mut RoomSlot, flush: bool) {
        let was_pending = self.debouncer.cancel(&slot.code).is_some();
        if was_pending || flush {
            let snapshot = slot.state.snapshot();
            if let Err(e) = self
                .store
                .update_room_playback_snapshot(&slot.code, &snapshot)
                .await
            {
                log::warn!("Failed to persist room {} on eviction: {e}", slot.code);
            }
        }
        slot.evicted = true;
        self.rooms.write().await.remove(&slot.code);
        log::info!("Room {} evicted", slot.code);
    }
}

fn ensure_joinable(record: &RoomRecord) -> Result<(), SyncError> {
    if !record.is_active {
        return Err(SyncError::RoomUnavailable(format!(
            "Room {} has ended",
            record.code
        )));
    }
    if record.is_paused {
        return Err(SyncError::RoomUnavailable(format!(
            "Room {} is paused by the host",
            record.code
        )));
    }
    Ok(())
}

fn next_lifecycle(
    current: LifecycleFlags,
    transition: LifecycleTransition,
) -> Result<LifecycleFlags, SyncError> {
    if !current.is_active {
        return Err(SyncError::InvalidTransition("room has already ended".to_string()));
    }
    match transition {
        LifecycleTransition::Pause if current.is_paused => Err(SyncError::InvalidTransition(
            "room is already paused".to_string(),
        )),
        LifecycleTransition::Pause => Ok(LifecycleFlags {
            is_active: true,
            is_paused: true,
        }),
        LifecycleTransition::Resume if !current.is_paused => Err(SyncError::InvalidTransition(
            "room is not paused".to_string(),
        )),
        LifecycleTransition::Resume => Ok(LifecycleFlags {
            is_active: true,
            is_paused: false,
        }),
        LifecycleTransition::End => Ok(LifecycleFlags {
            is_active: false,
            is_paused: false,
        }),
    }
}
