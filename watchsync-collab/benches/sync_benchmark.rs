use std::hint::black_box;
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion};
use tempfile::tempdir;
use watchsync_collab::broadcast::BroadcastGroup;
use watchsync_collab::engine::{EngineConfig, SyncEngine};
use watchsync_collab::presence::{ConnectionId, PresenceEntry, RoomPresence};
use watchsync_collab::protocol::{
    Audience, ClientEvent, PlaybackAction, ProposedState, ServerEvent, StateUpdate,
};
use watchsync_collab::state::{PlaybackChange, RoomPlaybackState};
use watchsync_collab::storage::{
    MemoryStore, PersistenceGateway, RoomRecord, RoomStore, StoreConfig,
};

fn state_update() -> ServerEvent {
    ServerEvent::VideoStateUpdate(StateUpdate {
        position: 1234.5,
        is_playing: true,
        action: PlaybackAction::Seek,
        latency: Some(42),
        server_timestamp: 1_700_000_000_000,
    })
}

fn bench_client_event_decode(c: &mut Criterion) {
    let frame = ClientEvent::VideoState {
        room_code: "MOVIE1".into(),
        state: ProposedState {
            position: 1234.5,
            is_playing: true,
        },
        action: Some(PlaybackAction::Seek),
        client_timestamp: Some(1_700_000_000_000),
    }
    .encode()
    .unwrap();

    c.bench_function("client_event_decode", |b| {
        b.iter(|| black_box(ClientEvent::decode(black_box(&frame)).unwrap()))
    });
}

fn bench_server_event_encode(c: &mut Criterion) {
    let event = state_update();
    c.bench_function("server_event_encode", |b| {
        b.iter(|| black_box(black_box(&event).encode().unwrap()))
    });
}

fn bench_state_apply_and_drift(c: &mut Criterion) {
    c.bench_function("state_apply_and_drift", |b| {
        let mut state = RoomPlaybackState::new(0.0, true, 0);
        let mut now = 0u64;
        b.iter(|| {
            now += 250;
            state.apply(PlaybackChange::seek(black_box(now as f64 / 1000.0)), now);
            black_box(state.drift(black_box(3.0), now + 1_000));
        })
    });
}

fn bench_presence_handover(c: &mut Criterion) {
    c.bench_function("presence_100_members_host_handover", |b| {
        b.iter(|| {
            let mut room = RoomPresence::new();
            let mut entries = Vec::with_capacity(100);
            for seq in 0..100u64 {
                let entry = PresenceEntry {
                    connection_id: ConnectionId::new(),
                    room_code: "R1".into(),
                    user_id: format!("user{seq}"),
                    username: format!("User {seq}"),
                    join_seq: seq,
                };
                room.add(&entry);
                entries.push(entry);
            }
            for entry in &entries {
                black_box(room.remove(entry.connection_id));
            }
        })
    });
}

fn bench_broadcast_100_subscribers(c: &mut Criterion) {
    c.bench_function("broadcast_1_event_100_subscribers", |b| {
        let group = BroadcastGroup::new(1024);
        let mut subscriptions: Vec<_> = (0..100)
            .map(|_| group.subscribe(ConnectionId::new(), "R1"))
            .collect();
        let sender = subscriptions[0].connection_id();
        let event = state_update();
        b.iter(|| {
            let sent = group
                .publish(Audience::RoomExcept(sender), black_box(event.clone()))
                .unwrap();
            black_box(sent);
            for subscription in subscriptions.iter_mut() {
                black_box(subscription.try_recv());
            }
        })
    });
}

fn bench_engine_seek_fanout(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let store = Arc::new(MemoryStore::new());
    let (engine, host) = rt.block_on(async {
        store
            .create_room(RoomRecord::new("R1", "Room", "h"))
            .await
            .unwrap();
        let engine = SyncEngine::new(EngineConfig::default(), store.clone());
        let host = ConnectionId::new();
        engine.join(host, "R1", "h").await.unwrap();
        (engine, host)
    });
    let mut subscriptions = rt.block_on(async {
        let mut subs = Vec::new();
        for i in 0..20 {
            let outcome = engine
                .join(ConnectionId::new(), "R1", &format!("g{i}"))
                .await
                .unwrap();
            subs.push(outcome.subscription);
        }
        subs
    });

    c.bench_function("engine_seek_20_members", |b| {
        let mut position = 0.0;
        b.iter(|| {
            position += 1.0;
            rt.block_on(async {
                black_box(engine.seek(host, "R1", position, None).await.unwrap());
            });
            for subscription in subscriptions.iter_mut() {
                black_box(subscription.drain());
            }
        })
    });
}

fn bench_rocks_snapshot_write(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let dir = tempdir().unwrap();
    let store = RoomStore::open(StoreConfig::for_testing(dir.path())).unwrap();
    rt.block_on(store.create_room(RoomRecord::new("R1", "Room", "h")))
        .unwrap();

    c.bench_function("rocks_snapshot_write", |b| {
        let mut position = 0.0;
        b.iter(|| {
            position += 0.5;
            let snapshot = RoomPlaybackState::new(position, true, 1).snapshot();
            rt.block_on(store.update_room_playback_snapshot("R1", black_box(&snapshot)))
                .unwrap();
        })
    });
}

criterion_group!(
    benches,
    bench_client_event_decode,
    bench_server_event_encode,
    bench_state_apply_and_drift,
    bench_presence_handover,
    bench_broadcast_100_subscribers,
    bench_engine_seek_fanout,
    bench_rocks_snapshot_write,
);
criterion_main!(benches);
