//! Integration tests for end-to-end WebSocket room sync.
//!
//! These tests start a real server and connect real clients,
//! verifying the full pipeline from frame to engine to fan-out.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;

use watchsync_collab::client::{ConnectionState, SyncClient, SyncEvent};
use watchsync_collab::engine::{EngineConfig, SyncEngine};
use watchsync_collab::protocol::{LifecycleTransition, PlaybackAction, ServerEvent};
use watchsync_collab::server::{ServerConfig, SyncServer};
use watchsync_collab::storage::{MemoryStore, PersistenceGateway, RoomRecord, UserRecord};

const WAIT: Duration = Duration::from_secs(2);

/// Start a server on a free port with rooms R1 (host-only control) and R2
/// (guest control). Returns the URL and the engine behind it.
async fn start_test_server() -> (String, Arc<SyncEngine>) {
    let store = Arc::new(MemoryStore::new());
    store
        .create_room(RoomRecord::new("R1", "Movie night", "h"))
        .await
        .unwrap();
    store
        .create_room(RoomRecord::new("R2", "Open room", "h").with_guest_control(true))
        .await
        .unwrap();
    for (id, name) in [("h", "Hannah"), ("g", "Gus")] {
        store
            .put_user(UserRecord {
                id: id.into(),
                username: name.into(),
            })
            .await
            .unwrap();
    }

    let engine = Arc::new(SyncEngine::new(EngineConfig::default(), store));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        heartbeat_interval_secs: 30,
    };
    let server = SyncServer::new(config, engine.clone());
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });

    (format!("ws://127.0.0.1:{port}"), engine)
}

async fn connect(url: &str, user: &str) -> (SyncClient, mpsc::Receiver<SyncEvent>) {
    let mut client = SyncClient::new(user, url);
    let mut rx = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    assert_eq!(timeout(WAIT, rx.recv()).await.unwrap(), Some(SyncEvent::Connected));
    expect(&mut rx, |e| matches!(e, ServerEvent::Connected { .. })).await;
    (client, rx)
}

/// Wait for the first server event matching `pred`, skipping others.
async fn expect<F>(rx: &mut mpsc::Receiver<SyncEvent>, pred: F) -> ServerEvent
where
    F: Fn(&ServerEvent) -> bool,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        match timeout(remaining, rx.recv()).await {
            Ok(Some(SyncEvent::Server(event))) if pred(&event) => return event,
            Ok(Some(_)) => continue,
            Ok(None) => panic!("event channel closed"),
            Err(_) => panic!("timed out waiting for event"),
        }
    }
}

/// Assert no server event matching `pred` arrives within `window`.
async fn expect_none<F>(rx: &mut mpsc::Receiver<SyncEvent>, window: Duration, pred: F)
where
    F: Fn(&ServerEvent) -> bool,
{
    let deadline = tokio::time::Instant::now() + window;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        match timeout(remaining, rx.recv()).await {
            Ok(Some(SyncEvent::Server(event))) if pred(&event) => {
                panic!("unexpected event {event:?}")
            }
            Ok(Some(_)) => continue,
            Ok(None) | Err(_) => return,
        }
    }
}

fn is_joined(event: &ServerEvent) -> bool {
    matches!(event, ServerEvent::RoomJoined(_))
}

fn is_state_update(event: &ServerEvent) -> bool {
    matches!(event, ServerEvent::VideoStateUpdate(_))
}

#[tokio::test]
async fn test_client_connects_and_is_greeted() {
    let (url, _) = start_test_server().await;
    let (client, _rx) = connect(&url, "h").await;
    assert_eq!(client.connection_state().await, ConnectionState::Connected);
}

#[tokio::test]
async fn test_host_play_reaches_guest_without_echo() {
    let (url, engine) = start_test_server().await;
    let (host, mut host_rx) = connect(&url, "h").await;
    let (guest, mut guest_rx) = connect(&url, "g").await;

    host.join_room("R1").await.unwrap();
    match expect(&mut host_rx, is_joined).await {
        ServerEvent::RoomJoined(snapshot) => {
            assert_eq!(snapshot.host_user_id.as_deref(), Some("h"));
            assert!(!snapshot.room.allow_guest_control);
        }
        _ => unreachable!(),
    }

    guest.join_room("R1").await.unwrap();
    match expect(&mut guest_rx, is_joined).await {
        ServerEvent::RoomJoined(snapshot) => {
            assert!(!snapshot.state.is_playing);
            assert_eq!(snapshot.state.position, 0.0);
            assert_eq!(snapshot.participants.len(), 2);
        }
        _ => unreachable!(),
    }
    match expect(&mut host_rx, |e| matches!(e, ServerEvent::UserJoined { .. })).await {
        ServerEvent::UserJoined { user_id, username } => {
            assert_eq!(user_id, "g");
            assert_eq!(username, "Gus");
        }
        _ => unreachable!(),
    }

    host.play("R1", Some(10.0)).await.unwrap();
    match expect(&mut guest_rx, is_state_update).await {
        ServerEvent::VideoStateUpdate(update) => {
            assert_eq!(update.position, 10.0);
            assert!(update.is_playing);
            assert_eq!(update.action, PlaybackAction::Play);
        }
        _ => unreachable!(),
    }
    expect_none(&mut host_rx, Duration::from_millis(300), is_state_update).await;

    // Guests may not control a host-only room.
    guest.seek("R1", 20.0).await.unwrap();
    match expect(&mut guest_rx, |e| matches!(e, ServerEvent::Forbidden { .. })).await {
        ServerEvent::Forbidden { reason } => {
            assert_eq!(reason, "Only the host can control video playback")
        }
        _ => unreachable!(),
    }
    expect_none(&mut host_rx, Duration::from_millis(300), is_state_update).await;

    let state = engine.playback_state("R1").await.unwrap();
    assert_eq!(state.position(), 10.0);
    assert!(state.is_playing());
}

#[tokio::test]
async fn test_guest_seek_in_open_room() {
    let (url, _) = start_test_server().await;
    let (host, mut host_rx) = connect(&url, "h").await;
    let (guest, mut guest_rx) = connect(&url, "g").await;

    host.join_room("R2").await.unwrap();
    expect(&mut host_rx, is_joined).await;
    guest.join_room("R2").await.unwrap();
    expect(&mut guest_rx, is_joined).await;

    guest.seek("R2", 50.0).await.unwrap();
    match expect(&mut host_rx, is_state_update).await {
        ServerEvent::VideoStateUpdate(update) => {
            assert_eq!(update.position, 50.0);
            assert_eq!(update.action, PlaybackAction::Seek);
            assert!(update.latency.is_some());
        }
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_pause_evicts_everyone_until_resume() {
    let (url, engine) = start_test_server().await;
    let (host, mut host_rx) = connect(&url, "h").await;
    let (guest, mut guest_rx) = connect(&url, "g").await;

    host.join_room("R1").await.unwrap();
    expect(&mut host_rx, is_joined).await;
    guest.join_room("R1").await.unwrap();
    expect(&mut guest_rx, is_joined).await;

    host.lifecycle("R1", LifecycleTransition::Pause).await.unwrap();
    for rx in [&mut host_rx, &mut guest_rx] {
        match expect(rx, |e| matches!(e, ServerEvent::RoomPaused { .. })).await {
            ServerEvent::RoomPaused { room_code, .. } => assert_eq!(room_code, "R1"),
            _ => unreachable!(),
        }
    }
    assert_eq!(engine.room_count().await, 0);

    guest.join_room("R1").await.unwrap();
    expect(&mut guest_rx, |e| matches!(e, ServerEvent::RoomUnavailable { .. })).await;

    host.lifecycle("R1", LifecycleTransition::Resume).await.unwrap();
    expect(&mut host_rx, |e| {
        matches!(
            e,
            ServerEvent::LifecycleChanged {
                transition: LifecycleTransition::Resume,
                ..
            }
        )
    })
    .await;

    guest.join_room("R1").await.unwrap();
    expect(&mut guest_rx, is_joined).await;
}

#[tokio::test]
async fn test_only_creator_may_pause() {
    let (url, _) = start_test_server().await;
    let (guest, mut guest_rx) = connect(&url, "g").await;

    guest.lifecycle("R1", LifecycleTransition::Pause).await.unwrap();
    expect(&mut guest_rx, |e| matches!(e, ServerEvent::Forbidden { .. })).await;
}

#[tokio::test]
async fn test_disconnect_hands_host_over() {
    let (url, engine) = start_test_server().await;
    let (mut host, mut host_rx) = connect(&url, "h").await;
    let (guest, mut guest_rx) = connect(&url, "g").await;

    host.join_room("R1").await.unwrap();
    expect(&mut host_rx, is_joined).await;
    guest.join_room("R1").await.unwrap();
    expect(&mut guest_rx, is_joined).await;

    host.disconnect().await.unwrap();
    match expect(&mut guest_rx, |e| matches!(e, ServerEvent::HostChanged { .. })).await {
        ServerEvent::HostChanged { user_id } => assert_eq!(user_id, "g"),
        _ => unreachable!(),
    }
    match expect(&mut guest_rx, |e| matches!(e, ServerEvent::UserLeft { .. })).await {
        ServerEvent::UserLeft { user_id, .. } => assert_eq!(user_id, "h"),
        _ => unreachable!(),
    }
    assert_eq!(engine.host_of("R1").await.as_deref(), Some("g"));
}

#[tokio::test]
async fn test_chat_reaches_whole_room() {
    let (url, _) = start_test_server().await;
    let (host, mut host_rx) = connect(&url, "h").await;
    let (guest, mut guest_rx) = connect(&url, "g").await;

    host.join_room("R1").await.unwrap();
    expect(&mut host_rx, is_joined).await;
    guest.join_room("R1").await.unwrap();
    expect(&mut guest_rx, is_joined).await;

    guest.send_message("R1", "  hello  ").await.unwrap();
    for rx in [&mut host_rx, &mut guest_rx] {
        match expect(rx, |e| matches!(e, ServerEvent::ChatMessage(_))).await {
            ServerEvent::ChatMessage(message) => {
                assert_eq!(message.message, "hello");
                assert_eq!(message.username, "Gus");
            }
            _ => unreachable!(),
        }
    }
}

#[tokio::test]
async fn test_latency_probe() {
    let (url, _) = start_test_server().await;
    let (client, mut rx) = connect(&url, "h").await;

    client.send_ping().await.unwrap();
    match expect(&mut rx, |e| matches!(e, ServerEvent::Pong { .. })).await {
        ServerEvent::Pong {
            client_timestamp,
            server_timestamp,
        } => assert!(server_timestamp >= client_timestamp),
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_malformed_frame_gets_error_and_connection_survives() {
    let (url, _) = start_test_server().await;
    let (mut ws, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();

    let greeting = timeout(WAIT, ws.next()).await.unwrap().unwrap().unwrap();
    let greeting = ServerEvent::decode(greeting.to_text().unwrap()).unwrap();
    assert!(matches!(greeting, ServerEvent::Connected { .. }));

    ws.send(Message::Text(String::from(r#"{"type":"voice-signal"}"#).into()))
        .await
        .unwrap();
    let reply = timeout(WAIT, ws.next()).await.unwrap().unwrap().unwrap();
    match ServerEvent::decode(reply.to_text().unwrap()).unwrap() {
        ServerEvent::Error { code, .. } => assert_eq!(code, "protocol"),
        other => panic!("unexpected event {other:?}"),
    }

    ws.send(Message::Text(String::from(r#"{"type":"ping","timestamp":5}"#).into()))
        .await
        .unwrap();
    let reply = timeout(WAIT, ws.next()).await.unwrap().unwrap().unwrap();
    assert!(matches!(
        ServerEvent::decode(reply.to_text().unwrap()).unwrap(),
        ServerEvent::Pong {
            client_timestamp: 5,
            ..
        }
    ));
}
