//! Startup seeding of users and rooms from a JSON file.
//!
//! ```json
//! {
//!   "users": [{ "id": "u1", "username": "alice" }],
//!   "rooms": [{ "code": "MOVIE1", "name": "Friday", "creatorId": "u1", "allowGuestControl": true }]
//! }
//! ```

use std::path::Path;

use serde::Deserialize;
use watchsync_collab::{PersistenceGateway, RoomRecord, StoreError, UserRecord};

#[derive(Debug, Default, Deserialize)]
pub struct SeedFile {
    #[serde(default)]
    pub users: Vec<UserRecord>,
    #[serde(default)]
    pub rooms: Vec<SeedRoom>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeedRoom {
    pub code: String,
    pub name: String,
    pub creator_id: String,
    #[serde(default)]
    pub video_url: Option<String>,
    #[serde(default)]
    pub allow_guest_control: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum SeedError {
    #[error("failed to read seed file: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed seed file: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SeedFile {
    pub fn load(path: &Path) -> Result<Self, SeedError> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Write users and any rooms not yet known to the store. Existing rooms
    /// keep their persisted playback and lifecycle state.
    pub async fn apply(self, store: &dyn PersistenceGateway) -> Result<usize, SeedError> {
        for user in self.users {
            store.put_user(user).await?;
        }

        let mut created = 0;
        for room in self.rooms {
            if store.find_room_by_code(&room.code).await?.is_some() {
                log::debug!("Seed room {} already exists", room.code);
                continue;
            }
            let mut record =
                RoomRecord::new(room.code, room.name, room.creator_id).with_guest_control(room.allow_guest_control);
            record.video_url = room.video_url;
            store.create_room(record).await?;
            created += 1;
        }
        Ok(created)
    }
}
