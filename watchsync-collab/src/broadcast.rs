//! Fan-out of room events to every connection in the room.
//!
//! Uses one tokio broadcast channel per room. Each event is encoded once
//! into an [`Envelope`] and shared behind an `Arc`; every subscriber checks
//! the envelope's [`Audience`] and skips events not meant for it (the
//! originator of a state change, typically).
//!
//! A subscriber that falls more than `capacity` events behind loses the
//! oldest ones. Playback updates are last-write-wins so the next update
//! brings it back in line.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::warn;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};

use crate::presence::ConnectionId;
use crate::protocol::{Audience, Envelope, ProtocolError, ServerEvent};

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub subscribers: usize,
}

/// Lock-free counters, shared with every subscription.
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl AtomicBroadcastStats {
    fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }
}

/// Broadcast channel of a single live room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Envelope>>,
    capacity: usize,
    atomic_stats: Arc<AtomicBroadcastStats>,
}

impl BroadcastGroup {
    /// `capacity` is how many events each subscriber may buffer before
    /// it starts losing the oldest ones.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            capacity,
            atomic_stats: Arc::new(AtomicBroadcastStats::new()),
        }
    }

    /// Subscribe `connection_id` to this room's events.
    pub fn subscribe(&self, connection_id: ConnectionId, room_code: &str) -> RoomSubscription {
        RoomSubscription {
            connection_id,
            room_code: room_code.to_string(),
            receiver: self.sender.subscribe(),
            stats: self.atomic_stats.clone(),
            closing_notice_seen: false,
        }
    }

    /// Encode `event` once and send it to the room.
    ///
    /// Returns the number of subscribers the envelope was handed to, before
    /// audience filtering. Zero subscribers is not an error.
    pub fn publish(&self, audience: Audience, event: ServerEvent) -> Result<usize, ProtocolError> {
        let envelope = Arc::new(Envelope::new(audience, event)?);
        let count = self.sender.send(envelope).unwrap_or(0);
        self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        Ok(count)
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            subscribers: self.sender.receiver_count(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// One connection's view of a room's event stream.
pub struct RoomSubscription {
    connection_id: ConnectionId,
    room_code: String,
    receiver: broadcast::Receiver<Arc<Envelope>>,
    stats: Arc<AtomicBroadcastStats>,
    /// Set once a `room-paused` / `room-ended` notice was delivered.
    closing_notice_seen: bool,
}

impl RoomSubscription {
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn room_code(&self) -> &str {
        &self.room_code
    }

    /// Whether this connection was told the room was paused or ended.
    /// A lagged subscriber can lose that notice along with older events.
    pub fn saw_closing_notice(&self) -> bool {
        self.closing_notice_seen
    }

    /// Next envelope addressed to this connection.
    ///
    /// Returns `None` once the room has been torn down.
    pub async fn recv(&mut self) -> Option<Arc<Envelope>> {
        loop {
            match self.receiver.recv().await {
                Ok(envelope) => {
                    if envelope.audience.includes(self.connection_id) {
                        if matches!(
                            envelope.event,
                            ServerEvent::RoomPaused { .. } | ServerEvent::RoomEnded { .. }
                        ) {
                            self.closing_notice_seen = true;
                        }
                        return Some(envelope);
                    }
                }
                Err(RecvError::Lagged(n)) => {
                    warn!(
                        "Connection {} lagged by {} events in room {}",
                        self.connection_id, n, self.room_code
                    );
                    self.stats.messages_dropped.fetch_add(n, Ordering::Relaxed);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv). `None` when nothing
    /// addressed to this connection is buffered.
    pub fn try_recv(&mut self) -> Option<Arc<Envelope>> {
        loop {
            match self.receiver.try_recv() {
                Ok(envelope) => {
                    if envelope.audience.includes(self.connection_id) {
                        return Some(envelope);
                    }
                }
                Err(TryRecvError::Lagged(n)) => {
                    self.stats.messages_dropped.fetch_add(n, Ordering::Relaxed);
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    /// Drain everything currently buffered for this connection.
    pub fn drain(&mut self) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Some(envelope) = self.try_recv() {
            events.push(envelope.event.clone());
        }
        events
    }
}
