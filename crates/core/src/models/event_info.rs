//! Read-only event snapshots handed to clients

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Static room metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomInfoFixed {
    pub id: Uuid,
    pub name: String,
    pub location: String,
    pub description: String,
    pub capacity: usize,
}

/// Static sector metadata with its rooms
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectorInfoFixed {
    pub id: Uuid,
    pub name: String,
    pub address: String,
    pub description: String,
    pub rooms: BTreeMap<Uuid, RoomInfoFixed>,
}

/// Fixed event snapshot, sent once after login
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventInfoFixed {
    pub name: String,
    pub sectors: BTreeMap<Uuid, SectorInfoFixed>,
}

impl EventInfoFixed {
    /// Find a room and the sector that owns it
    pub fn room(&self, room_id: Uuid) -> Option<(&SectorInfoFixed, &RoomInfoFixed)> {
        self.sectors
            .values()
            .find_map(|s| s.rooms.get(&room_id).map(|r| (s, r)))
    }
}

/// Live occupancy of one room
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomInfoUpdate {
    pub id: Uuid,
    pub active_reservations: usize,
    pub queue_length: usize,
    pub round_in_progress: bool,
}

/// Live occupancy of one sector
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectorInfoUpdate {
    pub id: Uuid,
    /// Rooms with at least one active reservation
    pub active_rooms_count: usize,
    pub rooms: BTreeMap<Uuid, RoomInfoUpdate>,
}

/// Dynamic event snapshot, refreshed on request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventInfoUpdate {
    pub generated_at: DateTime<Utc>,
    pub sectors: BTreeMap<Uuid, SectorInfoUpdate>,
}

/// Everything known about one room
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomDetails {
    pub sector_id: Uuid,
    pub info: RoomInfoFixed,
    pub state: RoomInfoUpdate,
}
