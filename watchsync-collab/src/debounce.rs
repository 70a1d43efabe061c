//! Debounced persistence of room playback snapshots.
//!
//! At most one pending write per room. Scheduling a new write for a room
//! aborts the previous timer and starts a fresh one, so a burst of changes
//! inside the window produces a single durable write carrying the last
//! value. Timers run on the tokio clock and can be driven without real
//! waits in tests (`start_paused`).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use log::{debug, warn};
use tokio::task::JoinHandle;

use crate::state::PlaybackSnapshot;
use crate::storage::PersistenceGateway;

struct PendingWrite {
    generation: u64,
    snapshot: PlaybackSnapshot,
    handle: JoinHandle<()>,
}

type PendingMap = Arc<Mutex<HashMap<String, PendingWrite>>>;

pub struct PersistDebouncer {
    delay: Duration,
    pending: PendingMap,
    generation: AtomicU64,
}

impl PersistDebouncer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            pending: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Write `snapshot` for `room_code` after the debounce delay, replacing
    /// any write still pending for that room.
    pub fn schedule(
        &self,
        room_code: &str,
        snapshot: PlaybackSnapshot,
        store: Arc<dyn PersistenceGateway>,
    ) {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let mut pending = lock(&self.pending);

        if let Some(previous) = pending.remove(room_code) {
            previous.handle.abort();
        }

        let map = self.pending.clone();
        let code = room_code.to_string();
        let delay = self.delay;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            // A newer schedule or a cancel may have raced the timer.
            {
                let mut pending = lock(&map);
                match pending.get(&code) {
                    Some(write) if write.generation == generation => {
                        pending.remove(&code);
                    }
                    _ => return,
                }
            }

            match store.update_room_playback_snapshot(&code, &snapshot).await {
                Ok(()) => debug!(
                    "Persisted room {} at {:.2}s (playing: {})",
                    code, snapshot.position, snapshot.is_playing
                ),
                Err(e) => warn!("Failed to persist room {}: {}", code, e),
            }
        });

        pending.insert(
            room_code.to_string(),
            PendingWrite {
                generation,
                snapshot,
                handle,
            },
        );
    }

    /// Cancel the pending write of a room, returning the snapshot it would
    /// have written.
    pub fn cancel(&self, room_code: &str) -> Option<PlaybackSnapshot> {
        let write = lock(&self.pending).remove(room_code)?;
        write.handle.abort();
        Some(write.snapshot)
    }

    pub fn is_pending(&self, room_code: &str) -> bool {
        lock(&self.pending).contains_key(room_code)
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }
}

impl Drop for PersistDebouncer {
    fn drop(&mut self) {
        for (_, write) in lock(&self.pending).drain() {
            write.handle.abort();
        }
    }
}

fn lock(pending: &PendingMap) -> MutexGuard<'_, HashMap<String, PendingWrite>> {
    pending.lock().unwrap_or_else(|e| e.into_inner())
}
