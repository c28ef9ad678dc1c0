//! Sector model - an administrative grouping of Rooms

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Room, RoomInfoFixed, SectorInfoFixed, SectorInfoUpdate};

/// Descriptive sector data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectorInfo {
    pub id: Uuid,
    pub name: String,
    pub address: String,
    pub description: String,
}

/// A sector exclusively owns its rooms. The room set is fixed at
/// construction; each room sits behind its own lock so rounds on different
/// rooms never contend.
#[derive(Debug)]
pub struct Sector {
    info: SectorInfo,
    rooms: BTreeMap<Uuid, Mutex<Room>>,
}

impl Sector {
    pub fn new(info: SectorInfo, rooms: Vec<Room>) -> Self {
        Self {
            info,
            rooms: rooms.into_iter().map(|r| (r.id(), Mutex::new(r))).collect(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.info.id
    }

    pub fn info(&self) -> &SectorInfo {
        &self.info
    }

    pub fn room_ids(&self) -> impl Iterator<Item = Uuid> + '_ {
        self.rooms.keys().copied()
    }

    pub fn contains_room(&self, room_id: Uuid) -> bool {
        self.rooms.contains_key(&room_id)
    }

    pub fn rooms_len(&self) -> usize {
        self.rooms.len()
    }

    /// Lock a room for the duration of the returned guard
    pub fn room(&self, room_id: Uuid) -> Option<MutexGuard<'_, Room>> {
        self.rooms.get(&room_id).map(lock_room)
    }

    pub fn info_fixed(&self) -> SectorInfoFixed {
        let rooms: BTreeMap<Uuid, RoomInfoFixed> = self
            .rooms
            .iter()
            .map(|(id, room)| (*id, lock_room(room).info().clone()))
            .collect();
        SectorInfoFixed {
            id: self.info.id,
            name: self.info.name.clone(),
            address: self.info.address.clone(),
            description: self.info.description.clone(),
            rooms,
        }
    }

    pub fn info_update(&self) -> SectorInfoUpdate {
        let rooms: BTreeMap<_, _> = self
            .rooms
            .iter()
            .map(|(id, room)| (*id, lock_room(room).state()))
            .collect();
        let active_rooms_count = rooms.values().filter(|r| r.active_reservations > 0).count();
        SectorInfoUpdate {
            id: self.info.id,
            active_rooms_count,
            rooms,
        }
    }
}

/// Room state stays consistent across a panicked holder, so poisoning is
/// recovered rather than propagated.
fn lock_room(room: &Mutex<Room>) -> MutexGuard<'_, Room> {
    match room.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!("Room mutex poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_sector() -> (Sector, Uuid) {
        let room = Room::new(RoomInfoFixed {
            id: Uuid::new_v4(),
            name: "Observatory".into(),
            location: "Roof".into(),
            description: "Telescopes".into(),
            capacity: 1,
        });
        let room_id = room.id();
        let sector = Sector::new(
            SectorInfo {
                id: Uuid::new_v4(),
                name: "North Wing".into(),
                address: "Main St 1".into(),
                description: String::new(),
            },
            vec![room],
        );
        (sector, room_id)
    }

    #[test]
    fn test_room_lookup() {
        let (sector, room_id) = make_sector();
        assert!(sector.contains_room(room_id));
        assert_eq!(sector.room(room_id).unwrap().info().name, "Observatory");
        assert!(sector.room(Uuid::new_v4()).is_none());
        assert_eq!(sector.rooms_len(), 1);
    }

    #[test]
    fn test_snapshots() {
        let (sector, room_id) = make_sector();
        let fixed = sector.info_fixed();
        assert_eq!(fixed.name, "North Wing");
        assert_eq!(fixed.rooms[&room_id].capacity, 1);

        let update = sector.info_update();
        assert_eq!(update.active_rooms_count, 0);
        assert_eq!(update.rooms[&room_id].queue_length, 0);
    }
}
