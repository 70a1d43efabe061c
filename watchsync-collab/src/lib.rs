//! # watchsync-collab — Room synchronization core for shared video watching
//!
//! Keeps the authoritative playback state of every live room in memory,
//! decides who may change it, fans changes out to the other members and
//! trails a debounced snapshot into durable storage.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   JSON over WS    ┌──────────────┐
//! │ SyncClient  │ ◄───────────────► │ SyncServer   │
//! │ (browser)   │                   │ (gateway)    │
//! └─────────────┘                   └──────┬───────┘
//!                                          │ ClientEvent
//!                                          ▼
//!                                   ┌──────────────┐      ┌──────────────────┐
//!                                   │ SyncEngine   │ ───► │ PersistDebouncer │
//!                                   │ (per-room    │      └────────┬─────────┘
//!                                   │  mutex)      │               ▼
//!                                   └──────┬───────┘      ┌──────────────────┐
//!                                          │              │ PersistenceGateway│
//!                         ┌────────────────┼──────────┐   │ (Memory / RocksDB)│
//!                         ▼                ▼          ▼   └──────────────────┘
//!                  RoomPlaybackState  RoomPresence  BroadcastGroup
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Wire events (`ClientEvent`, `ServerEvent`) and fan-out envelopes
//! - [`state`] — Per-room playback state, projection and drift
//! - [`presence`] — Connection ↔ user ↔ room bookkeeping and host handover
//! - [`broadcast`] — Room fan-out with audience filtering
//! - [`debounce`] — Cancelable per-room persistence timers
//! - [`engine`] — The sync engine
//! - [`handler`] — Event dispatch for one connection
//! - [`server`] — WebSocket server
//! - [`client`] — WebSocket client
//! - [`storage`] — Durable storage gateway and its backends

pub mod broadcast;
pub mod client;
pub mod clock;
pub mod debounce;
pub mod engine;
pub mod error;
pub mod handler;
pub mod presence;
pub mod protocol;
pub mod server;
pub mod state;
pub mod storage;

// Re-exports for convenience
pub use broadcast::{BroadcastGroup, BroadcastStats, RoomSubscription};
pub use client::{ConnectionState, SyncClient, SyncEvent};
pub use clock::{Clock, ManualClock, SystemClock};
pub use debounce::PersistDebouncer;
pub use engine::{EngineConfig, JoinOutcome, RoomControlPolicy, SyncEngine};
pub use error::{ServerError, SyncError};
pub use handler::Session;
pub use presence::{ConnectionId, PresenceEntry, PresenceTracker, RoomPresence};
pub use protocol::{
    Audience, ChatMessage, ClientEvent, Envelope, LifecycleTransition, ParticipantInfo,
    PlaybackAction, ProposedState, ProtocolError, RoomInfo, RoomSnapshot, ServerEvent,
    StateUpdate, UserId,
};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use state::{PlaybackChange, PlaybackSnapshot, RoomPlaybackState};
pub use storage::{
    LifecycleFlags, MemoryStore, PersistenceGateway, RoomRecord, RoomStore, StoreConfig,
    StoreError, UserRecord,
};
