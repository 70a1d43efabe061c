//! Error taxonomy of the sync core.

use crate::protocol::ProtocolError;
use crate::storage::StoreError;

/// Errors returned by [`SyncEngine`](crate::engine::SyncEngine) operations.
///
/// Every variant is reported to the requesting connection only; none of
/// them is ever broadcast to a room.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// The caller may not perform this operation.
    #[error("{0}")]
    Forbidden(String),

    /// The room exists but cannot be joined right now (ended or paused).
    #[error("{0}")]
    RoomUnavailable(String),

    /// A lifecycle transition that does not apply to the room's current state.
    #[error("{0}")]
    InvalidTransition(String),

    /// No durable record for this room code.
    #[error("room '{0}' not found")]
    NotFound(String),

    /// The inbound event carried a value the engine cannot apply.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error(transparent)]
    Storage(#[from] StoreError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl SyncError {
    /// Stable machine-readable code sent to clients in `error` events.
    pub fn code(&self) -> &'static str {
        match self {
            SyncError::Forbidden(_) => "forbidden",
            SyncError::RoomUnavailable(_) => "room-unavailable",
            SyncError::InvalidTransition(_) => "invalid-transition",
            SyncError::NotFound(_) => "not-found",
            SyncError::InvalidPayload(_) => "invalid-payload",
            SyncError::Storage(_) => "storage",
            SyncError::Protocol(_) => "protocol",
        }
    }
}

/// Transport-level failures of the WebSocket server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
