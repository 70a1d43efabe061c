//! Dispatch of inbound events for one connection.
//!
//! [`handle_event`] turns a decoded [`ClientEvent`] into engine calls and
//! returns the events to send straight back to that connection. Room-wide
//! fan-out happens inside the engine through the room's broadcast group;
//! the connection receives its share through [`Session::subscription`].

use crate::broadcast::RoomSubscription;
use crate::engine::SyncEngine;
use crate::error::SyncError;
use crate::presence::ConnectionId;
use crate::protocol::{ClientEvent, ServerEvent};

/// Per-connection state owned by the connection task.
pub struct Session {
    pub connection_id: ConnectionId,
    /// Event stream of the room this connection is in, if any.
    pub subscription: Option<RoomSubscription>,
}

impl Session {
    pub fn new(connection_id: ConnectionId) -> Self {
        Self {
            connection_id,
            subscription: None,
        }
    }

    pub fn room_code(&self) -> Option<&str> {
        self.subscription.as_ref().map(|s| s.room_code())
    }
}

/// Handle one inbound event. Errors are reported to this connection only.
pub async fn handle_event(
    engine: &SyncEngine,
    session: &mut Session,
    event: ClientEvent,
) -> Vec<ServerEvent> {
    match dispatch(engine, session, event).await {
        Ok(replies) => replies,
        Err(e) => {
            log::debug!("Event from {} failed: {}", session.connection_id, e);
            vec![error_event(&e)]
        }
    }
}

async fn dispatch(
    engine: &SyncEngine,
    session: &mut Session,
    event: ClientEvent,
) -> Result<Vec<ServerEvent>, SyncError> {
    let conn = session.connection_id;
    match event {
        ClientEvent::JoinRoom { room_code, user_id } => {
            // Drop the old stream first so nothing from the previous room leaks in.
            session.subscription = None;
            let outcome = engine.join(conn, &room_code, &user_id).await?;
            session.subscription = Some(outcome.subscription);
            Ok(vec![
                ServerEvent::RoomJoined(outcome.snapshot),
                ServerEvent::MessageHistory {
                    messages: outcome.history,
                },
            ])
        }

        ClientEvent::LeaveRoom => {
            engine.leave(conn).await;
            session.subscription = None;
            Ok(Vec::new())
        }

        ClientEvent::RequestParticipants { room_code } => {
            let participants = engine.request_participants(&room_code).await?;
            Ok(vec![ServerEvent::ParticipantsUpdate { participants }])
        }

        ClientEvent::VideoState {
            room_code,
            state,
            action,
            client_timestamp,
        } => {
            engine
                .apply_state_change(conn, &room_code, state, action, client_timestamp)
                .await?;
            Ok(Vec::new())
        }

        ClientEvent::PlayVideo {
            room_code,
            position,
            client_timestamp,
        } => {
            engine.play(conn, &room_code, position, client_timestamp).await?;
            Ok(Vec::new())
        }

        ClientEvent::PauseVideo {
            room_code,
            position,
            client_timestamp,
        } => {
            engine.pause(conn, &room_code, position, client_timestamp).await?;
            Ok(Vec::new())
        }

        ClientEvent::SeekVideo {
            room_code,
            position,
            client_timestamp,
        } => {
            engine.seek(conn, &room_code, position, client_timestamp).await?;
            Ok(Vec::new())
        }

        ClientEvent::SyncCheck {
            room_code,
            position,
            is_playing,
            client_timestamp,
        } => {
            let correction = engine
                .periodic_reconcile(conn, &room_code, position, is_playing, client_timestamp)
                .await?;
            Ok(correction
                .map(ServerEvent::VideoStateUpdate)
                .into_iter()
                .collect())
        }

        ClientEvent::Ping { timestamp } => Ok(vec![engine.pong(timestamp)]),

        ClientEvent::Lifecycle {
            room_code,
            requester_id,
            transition,
        } => {
            engine
                .lifecycle_transition(&room_code, &requester_id, transition)
                .await?;
            Ok(vec![ServerEvent::LifecycleChanged {
                room_code,
                transition,
            }])
        }

        ClientEvent::SendMessage { room_code, message } => {
            engine.send_chat_message(conn, &room_code, &message).await?;
            Ok(Vec::new())
        }

        ClientEvent::GetMessageHistory { room_code } => {
            let messages = engine.message_history(&room_code).await?;
            Ok(vec![ServerEvent::MessageHistory { messages }])
        }

        ClientEvent::UserActivity {
            room_code,
            activity,
        } => {
            engine.user_activity(conn, &room_code, &activity).await?;
            Ok(Vec::new())
        }
    }
}

/// The single event reporting `error` to the requesting connection.
pub fn error_event(error: &SyncError) -> ServerEvent {
    match error {
        SyncError::Forbidden(reason) => ServerEvent::Forbidden {
            reason: reason.clone(),
        },
        SyncError::RoomUnavailable(reason) => ServerEvent::RoomUnavailable {
            reason: reason.clone(),
        },
        other => ServerEvent::Error {
            code: other.code().to_string(),
            message: other.to_string(),
        },
    }
}
