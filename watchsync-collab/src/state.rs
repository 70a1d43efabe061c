//! Authoritative playback state of a single room.
//!
//! The state is a tiny scalar triple: position, playing flag and the time it
//! was last changed. While playing, the true position at time `T` is
//!
//! ```text
//! position + (T - last_update_at)
//! ```
//!
//! which is what drift checks and network-delay compensation use.
//! Changes are last-write-wins: every applied change overwrites the previous
//! one without merging.

use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// Playback state as sent on the wire and written to durable storage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackSnapshot {
    /// Seconds into the media.
    pub position: f64,
    pub is_playing: bool,
    /// Epoch milliseconds of the last change.
    pub timestamp: u64,
}

/// A requested mutation. `None` fields keep their current value
/// (`position: None` means "wherever playback is right now").
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PlaybackChange {
    pub position: Option<f64>,
    pub is_playing: Option<bool>,
}

impl PlaybackChange {
    pub fn play(position: Option<f64>) -> Self {
        Self {
            position,
            is_playing: Some(true),
        }
    }

    pub fn pause(position: Option<f64>) -> Self {
        Self {
            position,
            is_playing: Some(false),
        }
    }

    /// Move the playhead, keeping the playing flag untouched.
    pub fn seek(position: f64) -> Self {
        Self {
            position: Some(position),
            is_playing: None,
        }
    }

    pub fn set(position: f64, is_playing: bool) -> Self {
        Self {
            position: Some(position),
            is_playing: Some(is_playing),
        }
    }
}

/// In-memory playback state of a live room.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RoomPlaybackState {
    position: f64,
    is_playing: bool,
    last_update_at: u64,
}

impl RoomPlaybackState {
    /// Create a state at `position`, last changed at `now_ms`.
    /// Negative or non-finite positions are clamped to zero.
    pub fn new(position: f64, is_playing: bool, now_ms: u64) -> Self {
        Self {
            position: clamp_position(position),
            is_playing,
            last_update_at: now_ms,
        }
    }

    pub fn position(&self) -> f64 {
        self.position
    }

    pub fn is_playing(&self) -> bool {
        self.is_playing
    }

    pub fn last_update_at(&self) -> u64 {
        self.last_update_at
    }

    /// Where playback should be at `now_ms`.
    pub fn projected_position(&self, now_ms: u64) -> f64 {
        if self.is_playing {
            let elapsed = now_ms.saturating_sub(self.last_update_at) as f64 / 1000.0;
            self.position + elapsed
        } else {
            self.position
        }
    }

    /// Apply a change at `now_ms` (last write wins).
    pub fn apply(&mut self, change: PlaybackChange, now_ms: u64) {
        let position = change
            .position
            .unwrap_or_else(|| self.projected_position(now_ms));
        self.position = clamp_position(position);
        if let Some(is_playing) = change.is_playing {
            self.is_playing = is_playing;
        }
        self.last_update_at = now_ms;
    }

    /// Stop playback where it currently is.
    pub fn halt(&mut self, now_ms: u64) {
        self.apply(PlaybackChange::pause(None), now_ms);
    }

    /// Absolute distance in seconds between a reported position and the
    /// projected authoritative one.
    pub fn drift(&self, reported_position: f64, now_ms: u64) -> f64 {
        (self.projected_position(now_ms) - reported_position).abs()
    }

    pub fn snapshot(&self) -> PlaybackSnapshot {
        PlaybackSnapshot {
            position: self.position,
            is_playing: self.is_playing,
            timestamp: self.last_update_at,
        }
    }
}

/// Validate a client-supplied position.
pub fn validate_position(position: f64) -> Result<f64, SyncError> {
    if !position.is_finite() {
        return Err(SyncError::InvalidPayload(format!(
            "position must be a finite number of seconds, got {position}"
        )));
    }
    Ok(position.max(0.0))
}

fn clamp_position(position: f64) -> f64 {
    if position.is_finite() {
        position.max(0.0)
    } else {
        0.0
    }
}
