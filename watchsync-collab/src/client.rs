//! WebSocket client for the sync server.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect)
//! - Typed helpers for every inbound event the server understands
//! - A channel of decoded [`ServerEvent`]s for the application
//!
//! Used by the integration tests and by tooling that drives rooms headless.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::clock::{Clock, SystemClock};
use crate::protocol::{
    ClientEvent, LifecycleTransition, PlaybackAction, ProposedState, ProtocolError, ServerEvent,
    UserId,
};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Connection established
    Connected,
    /// Connection lost
    Disconnected,
    /// A decoded event from the server
    Server(ServerEvent),
}

/// The sync client.
pub struct SyncClient {
    /// Identity presented on join
    user_id: UserId,

    state: Arc<RwLock<ConnectionState>>,

    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Message>>,

    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<SyncEvent>>,

    /// Event sender (held by the reader task)
    event_tx: mpsc::Sender<SyncEvent>,

    server_url: String,
}

impl SyncClient {
    pub fn new(user_id: impl Into<UserId>, server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            user_id: user_id.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
            server_url: server_url.into(),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect to the server.
    ///
    /// Spawns background tasks for reading and writing WebSocket frames.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let (ws_stream, _) = match tokio_tungstenite::connect_async(self.server_url.as_str()).await {
            Ok(connected) => connected,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::Connection(e.to_string()));
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward the outgoing channel to the socket
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(256);
        self.outgoing_tx = Some(out_tx);
        tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if ws_writer.send(message).await.is_err() || closing {
                    break;
                }
            }
        });

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(SyncEvent::Connected).await;

        // Reader task: decode incoming frames
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => match ServerEvent::decode(text.as_str()) {
                        Ok(event) => {
                            let _ = event_tx.send(SyncEvent::Server(event)).await;
                        }
                        Err(e) => log::warn!("Dropping undecodable server frame: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(SyncEvent::Disconnected).await;
        });

        Ok(())
    }

    /// Close the connection. The event channel reports `Disconnected` once
    /// the server acknowledges.
    pub async fn disconnect(&mut self) -> Result<(), ProtocolError> {
        if let Some(tx) = self.outgoing_tx.take() {
            tx.send(Message::Close(None))
                .await
                .map_err(|_| ProtocolError::ConnectionClosed)?;
        }
        Ok(())
    }

    /// Send one event to the server.
    pub async fn send(&self, event: &ClientEvent) -> Result<(), ProtocolError> {
        if *self.state.read().await != ConnectionState::Connected {
            return Err(ProtocolError::ConnectionClosed);
        }
        let text = event.encode()?;
        match self.outgoing_tx {
            Some(ref tx) => tx
                .send(Message::Text(text.into()))
                .await
                .map_err(|_| ProtocolError::ConnectionClosed),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    pub async fn join_room(&self, room_code: &str) -> Result<(), ProtocolError> {
        self.send(&ClientEvent::JoinRoom {
            room_code: room_code.to_string(),
            user_id: self.user_id.clone(),
        })
        .await
    }

    pub async fn leave_room(&self) -> Result<(), ProtocolError> {
        self.send(&ClientEvent::LeaveRoom).await
    }

    pub async fn request_participants(&self, room_code: &str) -> Result<(), ProtocolError> {
        self.send(&ClientEvent::RequestParticipants {
            room_code: room_code.to_string(),
        })
        .await
    }

    pub async fn play(&self, room_code: &str, position: Option<f64>) -> Result<(), ProtocolError> {
        self.send(&ClientEvent::PlayVideo {
            room_code: room_code.to_string(),
            position,
            client_timestamp: Some(SystemClock.now_ms()),
        })
        .await
    }

    pub async fn pause(&self, room_code: &str, position: Option<f64>) -> Result<(), ProtocolError> {
        self.send(&ClientEvent::PauseVideo {
            room_code: room_code.to_string(),
            position,
            client_timestamp: Some(SystemClock.now_ms()),
        })
        .await
    }

    pub async fn seek(&self, room_code: &str, position: f64) -> Result<(), ProtocolError> {
        self.send(&ClientEvent::SeekVideo {
            room_code: room_code.to_string(),
            position,
            client_timestamp: Some(SystemClock.now_ms()),
        })
        .await
    }

    /// Propose a full state, e.g. a `force-sync` from the controlling client.
    pub async fn send_state(
        &self,
        room_code: &str,
        state: ProposedState,
        action: PlaybackAction,
    ) -> Result<(), ProtocolError> {
        self.send(&ClientEvent::VideoState {
            room_code: room_code.to_string(),
            state,
            action: Some(action),
            client_timestamp: Some(SystemClock.now_ms()),
        })
        .await
    }

    /// Report the local player position; the server answers only on drift.
    pub async fn sync_check(
        &self,
        room_code: &str,
        position: f64,
        is_playing: bool,
    ) -> Result<(), ProtocolError> {
        self.send(&ClientEvent::SyncCheck {
            room_code: room_code.to_string(),
            position,
            is_playing,
            client_timestamp: Some(SystemClock.now_ms()),
        })
        .await
    }

    pub async fn lifecycle(
        &self,
        room_code: &str,
        transition: LifecycleTransition,
    ) -> Result<(), ProtocolError> {
        self.send(&ClientEvent::Lifecycle {
            room_code: room_code.to_string(),
            requester_id: self.user_id.clone(),
            transition,
        })
        .await
    }

    pub async fn send_message(&self, room_code: &str, message: &str) -> Result<(), ProtocolError> {
        self.send(&ClientEvent::SendMessage {
            room_code: room_code.to_string(),
            message: message.to_string(),
        })
        .await
    }

    /// Latency probe; answered with `pong`.
    pub async fn send_ping(&self) -> Result<(), ProtocolError> {
        self.send(&ClientEvent::Ping {
            timestamp: SystemClock.now_ms(),
        })
        .await
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}
