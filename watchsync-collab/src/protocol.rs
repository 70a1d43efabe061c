//! JSON wire protocol between browsers and the sync server.
//!
//! Every WebSocket text frame carries one event, tagged by `type`:
//! ```text
//! → {"type":"play-video","roomCode":"R1","position":10.0}
//! ← {"type":"video-state-update","position":10.0,"isPlaying":true,"action":"play",...}
//! ```
//!
//! Outgoing room events are encoded once into an [`Envelope`] and fanned out
//! to every subscriber; each subscriber filters on the envelope's [`Audience`].

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::presence::ConnectionId;
use crate::state::PlaybackSnapshot;

/// Application-level user identifier (opaque to the sync core).
pub type UserId = String;

/// Why a playback change happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PlaybackAction {
    Play,
    Pause,
    Seek,
    /// Low-frequency reconciliation broadcast from the controlling client.
    Sync,
    /// Manual "everyone jump to me" from the controlling client.
    ForceSync,
    /// Server correction sent to a single drifting client.
    SyncCheck,
    /// Plain state update with no specific user action.
    Update,
}

impl PlaybackAction {
    /// Reconciliation updates; receivers apply a looser tolerance to these.
    pub fn is_reconciliation(self) -> bool {
        matches!(
            self,
            PlaybackAction::Sync | PlaybackAction::ForceSync | PlaybackAction::SyncCheck
        )
    }
}

/// Room lifecycle transitions reserved to the room's creator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LifecycleTransition {
    Pause,
    Resume,
    End,
}

/// A full state proposal from a client.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposedState {
    pub position: f64,
    pub is_playing: bool,
}

/// Room metadata delivered on join.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomInfo {
    pub id: Uuid,
    pub name: String,
    pub code: String,
    pub video_url: Option<String>,
    pub creator_id: UserId,
    pub allow_guest_control: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantInfo {
    pub id: UserId,
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: Uuid,
    pub user_id: UserId,
    pub username: String,
    pub message: String,
    /// Epoch milliseconds.
    pub timestamp: u64,
}

/// Everything a client needs to render a room right after joining.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSnapshot {
    pub room: RoomInfo,
    pub state: PlaybackSnapshot,
    pub participants: Vec<ParticipantInfo>,
    /// Runtime host (may differ from `room.creator_id` after handover).
    pub host_user_id: Option<UserId>,
    /// Server-side duration of the join, in milliseconds.
    pub latency: u64,
}

/// A playback change as seen by the other members of a room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateUpdate {
    pub position: f64,
    pub is_playing: bool,
    pub action: PlaybackAction,
    /// `serverTimestamp - clientTimestamp` in milliseconds, when the sender
    /// supplied a timestamp. May be negative under clock skew.
    pub latency: Option<i64>,
    pub server_timestamp: u64,
}

/// Events sent by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientEvent {
    JoinRoom {
        room_code: String,
        user_id: UserId,
    },
    LeaveRoom,
    RequestParticipants {
        room_code: String,
    },
    VideoState {
        room_code: String,
        state: ProposedState,
        action: Option<PlaybackAction>,
        client_timestamp: Option<u64>,
    },
    PlayVideo {
        room_code: String,
        position: Option<f64>,
        client_timestamp: Option<u64>,
    },
    PauseVideo {
        room_code: String,
        position: Option<f64>,
        client_timestamp: Option<u64>,
    },
    SeekVideo {
        room_code: String,
        position: f64,
        client_timestamp: Option<u64>,
    },
    SyncCheck {
        room_code: String,
        position: f64,
        is_playing: bool,
        client_timestamp: Option<u64>,
    },
    Ping {
        timestamp: u64,
    },
    Lifecycle {
        room_code: String,
        requester_id: UserId,
        transition: LifecycleTransition,
    },
    SendMessage {
        room_code: String,
        message: String,
    },
    GetMessageHistory {
        room_code: String,
    },
    UserActivity {
        room_code: String,
        activity: String,
    },
}

/// Events sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    Connected {
        id: ConnectionId,
        timestamp: u64,
    },
    RoomJoined(RoomSnapshot),
    VideoStateUpdate(StateUpdate),
    ParticipantsUpdate {
        participants: Vec<ParticipantInfo>,
    },
    UserJoined {
        user_id: UserId,
        username: String,
    },
    UserLeft {
        user_id: UserId,
        username: String,
    },
    HostChanged {
        user_id: UserId,
    },
    Forbidden {
        reason: String,
    },
    RoomUnavailable {
        reason: String,
    },
    Pong {
        client_timestamp: u64,
        server_timestamp: u64,
    },
    RoomPaused {
        room_code: String,
        reason: String,
    },
    RoomEnded {
        room_code: String,
        reason: String,
    },
    LifecycleChanged {
        room_code: String,
        transition: LifecycleTransition,
    },
    ChatMessage(ChatMessage),
    MessageHistory {
        messages: Vec<ChatMessage>,
    },
    UserActivity {
        user_id: UserId,
        activity: String,
    },
    Error {
        code: String,
        message: String,
    },
}

impl ClientEvent {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }

    /// Decode from a binary frame holding UTF-8 JSON.
    pub fn decode_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(bytes).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

impl ServerEvent {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// Who inside a room should receive a fanned-out event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audience {
    /// Every connection in the room.
    Room,
    /// Every connection in the room except the originator.
    RoomExcept(ConnectionId),
}

impl Audience {
    pub fn includes(&self, connection: ConnectionId) -> bool {
        match self {
            Audience::Room => true,
            Audience::RoomExcept(excluded) => *excluded != connection,
        }
    }
}

/// A room event encoded once for all receivers.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub audience: Audience,
    pub event: ServerEvent,
    /// Pre-encoded JSON text frame.
    pub frame: String,
}

impl Envelope {
    pub fn new(audience: Audience, event: ServerEvent) -> Result<Self, ProtocolError> {
        let frame = event.encode()?;
        Ok(Self {
            audience,
            event,
            frame,
        })
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Connection failed: {0}")]
    Connection(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_event_wire_names() {
        let event = ClientEvent::PlayVideo {
            room_code: "R1".into(),
            position: Some(10.0),
            client_timestamp: None,
        };
        let text = event.encode().unwrap();
        assert!(text.contains("\"type\":\"play-video\""));
        assert!(text.contains("\"roomCode\":\"R1\""));
    }

    #[test]
    fn test_decode_browser_frame() {
        let text = r#"{"type":"video-state","roomCode":"R2","state":{"position":50.0,"isPlaying":true},"action":"seek","clientTimestamp":1700000000000}"#;
        match ClientEvent::decode(text).unwrap() {
            ClientEvent::VideoState {
                room_code,
                state,
                action,
                client_timestamp,
            } => {
                assert_eq!(room_code, "R2");
                assert_eq!(state.position, 50.0);
                assert!(state.is_playing);
                assert_eq!(action, Some(PlaybackAction::Seek));
                assert_eq!(client_timestamp, Some(1_700_000_000_000));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_optional_fields_may_be_omitted() {
        let event = ClientEvent::decode(r#"{"type":"pause-video","roomCode":"R1"}"#).unwrap();
        assert_eq!(
            event,
            ClientEvent::PauseVideo {
                room_code: "R1".into(),
                position: None,
                client_timestamp: None,
            }
        );
        let leave = ClientEvent::decode(r#"{"type":"leave-room"}"#).unwrap();
        assert_eq!(leave, ClientEvent::LeaveRoom);
    }

    #[test]
    fn test_force_sync_action_name() {
        let json = serde_json::to_string(&PlaybackAction::ForceSync).unwrap();
        assert_eq!(json, "\"force-sync\"");
        assert!(PlaybackAction::ForceSync.is_reconciliation());
        assert!(!PlaybackAction::Seek.is_reconciliation());
    }

    #[test]
    fn test_state_update_flattens_into_tagged_event() {
        let event = ServerEvent::VideoStateUpdate(StateUpdate {
            position: 10.0,
            is_playing: true,
            action: PlaybackAction::Play,
            latency: Some(12),
            server_timestamp: 99,
        });
        let value: serde_json::Value = serde_json::from_str(&event.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "video-state-update");
        assert_eq!(value["isPlaying"], true);
        assert_eq!(value["action"], "play");
        assert_eq!(value["serverTimestamp"], 99);
        assert_eq!(ServerEvent::decode(&event.encode().unwrap()).unwrap(), event);
    }

    #[test]
    fn test_lifecycle_event_decodes() {
        let text = r#"{"type":"lifecycle","roomCode":"R1","requesterId":"h","transition":"pause"}"#;
        match ClientEvent::decode(text).unwrap() {
            ClientEvent::Lifecycle { transition, .. } => {
                assert_eq!(transition, LifecycleTransition::Pause)
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_unknown_event_type_rejected() {
        let err = ClientEvent::decode(r#"{"type":"voice-signal"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Deserialization(_)));
    }

    #[test]
    fn test_audience_filter() {
        let a = ConnectionId::new();
        let b = ConnectionId::new();
        assert!(Audience::Room.includes(a));
        assert!(!Audience::RoomExcept(a).includes(a));
        assert!(Audience::RoomExcept(a).includes(b));
    }

    #[test]
    fn test_envelope_pre_encodes_frame() {
        let env = Envelope::new(
            Audience::Room,
            ServerEvent::HostChanged {
                user_id: "g".into(),
            },
        )
        .unwrap();
        assert_eq!(env.frame, r#"{"type":"host-changed","userId":"g"}"#);
    }
}
