//! WebSocket gateway in front of the sync engine.
//!
//! Architecture:
//! ```text
//! Browser A ──┐                         ┌── Room R1: state, presence, BroadcastGroup
//!             ├── SyncServer ── Session ┤
//! Browser B ──┘   (one task per         └── Room R2: ...
//!                  connection)
//! ```
//!
//! Each connection task multiplexes three sources with `tokio::select!`:
//! inbound frames (decoded and handed to [`handle_event`]), the room's
//! broadcast stream (forwarded as pre-encoded frames) and a heartbeat ping.
//! Events of one room reach every connection in the order the engine
//! published them.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message;

use crate::broadcast::RoomSubscription;
use crate::engine::SyncEngine;
use crate::error::ServerError;
use crate::handler::{handle_event, Session};
use crate::presence::ConnectionId;
use crate::protocol::{ClientEvent, Envelope, ServerEvent};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Interval between WebSocket pings, in seconds
    pub heartbeat_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:3000".to_string(),
            heartbeat_interval_secs: 10,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    /// Frames that did not decode into a known event
    pub rejected_frames: u64,
    pub active_rooms: usize,
}

pub struct SyncServer {
    config: ServerConfig,
    engine: Arc<SyncEngine>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    pub fn new(config: ServerConfig, engine: Arc<SyncEngine>) -> Self {
        Self {
            config,
            engine,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let engine = self.engine.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, engine, stats, config).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        engine: Arc<SyncEngine>,
        stats: Arc<RwLock<ServerStats>>,
        config: ServerConfig,
    ) -> Result<(), ServerError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let mut session = Session::new(ConnectionId::new());
        let connection_id = session.connection_id;
        log::info!("WebSocket connection {connection_id} established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let period = Duration::from_secs(config.heartbeat_interval_secs.max(1));
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        let outcome: Result<(), ServerError> = async {
            send_event(
                &mut ws_sender,
                &ServerEvent::Connected {
                    id: connection_id,
                    timestamp: engine.now_ms(),
                },
            )
            .await?;

            loop {
                tokio::select! {
                    // Incoming WebSocket frame
                    msg = ws_receiver.next() => {
                        let decoded = match msg {
                            Some(Ok(Message::Text(text))) => {
                                record_frame(&stats, text.len()).await;
                                ClientEvent::decode(text.as_str())
                            }
                            Some(Ok(Message::Binary(data))) => {
                                record_frame(&stats, data.len()).await;
                                ClientEvent::decode_bytes(&data)
                            }
                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                                continue;
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection {connection_id} closed from {addr}");
                                break;
                            }
                            Some(Err(e)) => {
                                log::warn!("WebSocket error from {addr}: {e}");
                                break;
                            }
                            Some(Ok(_)) => continue,
                        };

                        let replies = match decoded {
                            Ok(event) => handle_event(&engine, &mut session, event).await,
                            Err(e) => {
                                log::warn!("Failed to decode frame from {addr}: {e}");
                                stats.write().await.rejected_frames += 1;
                                vec![ServerEvent::Error {
                                    code: "protocol".to_string(),
                                    message: e.to_string(),
                                }]
                            }
                        };
                        for reply in &replies {
                            send_event(&mut ws_sender, reply).await?;
                        }
                    }

                    // Outgoing room event
                    envelope = next_room_event(&mut session.subscription) => {
                        match envelope {
                            Some(envelope) => {
                                ws_sender.send(Message::Text(envelope.frame.clone().into())).await?;
                            }
                            None => {
                                // Room torn down (paused, ended or emptied)
                                if let Some(closed) = session.subscription.take() {
                                    let still_member = engine.room_of(connection_id).await.is_some();
                                    if let Some(notice) = missed_closing_notice(&closed, still_member) {
                                        send_event(&mut ws_sender, &notice).await?;
                                    }
                                }
                            }
                        }
                    }

                    _ = heartbeat.tick() => {
                        ws_sender.send(Message::Ping(Vec::new().into())).await?;
                    }
                }
            }
            Ok(())
        }
        .await;

        engine.leave(connection_id).await;
        {
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }
        outcome
    }

    /// Server statistics.
    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_rooms = self.engine.room_count().await;
        stats
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }
}

async fn next_room_event(subscription: &mut Option<RoomSubscription>) -> Option<Arc<Envelope>> {
    match subscription {
        Some(subscription) => subscription.recv().await,
        // Not in a room yet: wait forever
        None => std::future::pending().await,
    }
}

/// Direct notice for a connection whose room stream closed without it
/// ever seeing the pause / end broadcast.
fn missed_closing_notice(closed: &RoomSubscription, still_member: bool) -> Option<ServerEvent> {
    if still_member || closed.saw_closing_notice() {
        return None;
    }
    Some(ServerEvent::RoomUnavailable {
        reason: format!("Room {} is no longer available", closed.room_code()),
    })
}

async fn send_event<S>(sink: &mut S, event: &ServerEvent) -> Result<(), ServerError>
where
    S: Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let text = event.encode()?;
    sink.send(Message::Text(text.into())).await?;
    Ok(())
}

async fn record_frame(stats: &RwLock<ServerStats>, len: usize) {
    let mut s = stats.write().await;
    s.total_messages += 1;
    s.total_bytes += len as u64;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::BroadcastGroup;
    use crate::protocol::Audience;
    use crate::engine::EngineConfig;
    use crate::storage::MemoryStore;

    fn server(config: ServerConfig) -> SyncServer {
        let engine = SyncEngine::new(EngineConfig::default(), Arc::new(MemoryStore::new()));
        SyncServer::new(config, Arc::new(engine))
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:3000");
        assert_eq!(config.heartbeat_interval_secs, 10);
    }

    #[test]
    fn test_server_custom_config() {
        let server = server(ServerConfig {
            bind_addr: "0.0.0.0:8080".to_string(),
            heartbeat_interval_secs: 15,
        });
        assert_eq!(server.bind_addr(), "0.0.0.0:8080");
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = server(ServerConfig::default());
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.total_messages, 0);
        assert_eq!(stats.rejected_frames, 0);
        assert_eq!(stats.active_rooms, 0);
    }

    #[tokio::test]
    async fn test_next_room_event_pending_without_room() {
        let mut none: Option<RoomSubscription> = None;
        let waited = tokio::time::timeout(Duration::from_millis(20), next_room_event(&mut none)).await;
        assert!(waited.is_err());
    }

    #[tokio::test]
    async fn test_missed_closing_notice_only_when_not_seen() {
        let group = BroadcastGroup::new(2);
        let mut lagged = group.subscribe(ConnectionId::new(), "R1");
        group
            .publish(
                Audience::Room,
                ServerEvent::RoomPaused {
                    room_code: "R1".into(),
                    reason: "paused".into(),
                },
            )
            .unwrap();
        for user in ["a", "b", "c"] {
            group
                .publish(Audience::Room, ServerEvent::HostChanged { user_id: user.into() })
                .unwrap();
        }
        drop(group);
        while lagged.recv().await.is_some() {}

        assert_eq!(
            missed_closing_notice(&lagged, false),
            Some(ServerEvent::RoomUnavailable {
                reason: "Room R1 is no longer available".into()
            })
        );
        assert_eq!(missed_closing_notice(&lagged, true), None);

        let group = BroadcastGroup::new(16);
        let mut told = group.subscribe(ConnectionId::new(), "R1");
        group
            .publish(
                Audience::Room,
                ServerEvent::RoomEnded {
                    room_code: "R1".into(),
                    reason: "ended".into(),
                },
            )
            .unwrap();
        drop(group);
        while told.recv().await.is_some() {}
        assert_eq!(missed_closing_notice(&told, false), None);
    }
}
