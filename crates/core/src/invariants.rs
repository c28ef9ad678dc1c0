//! Developer guardrails and invariants
//!
//! Debug assertions for detecting impossible states during development.
//! These checks are compiled out in release builds.

use std::collections::HashSet;

use crate::models::{GroupingResponse, Room, TourGroup, MAX_GUIDES, MAX_RESERVATIONS, MAX_TICKETS};

/// Validate a group's list limits
pub fn assert_group_invariants(group: &TourGroup) {
    debug_assert!(
        group.tickets().len() <= MAX_TICKETS,
        "Group {} holds {} tickets",
        group.id,
        group.tickets().len()
    );
    debug_assert!(
        group.reservations().len() <= MAX_RESERVATIONS,
        "Group {} holds {} reservations",
        group.id,
        group.reservations().len()
    );
    debug_assert!(
        group.guides().len() <= MAX_GUIDES,
        "Group {} has {} guides",
        group.id,
        group.guides().len()
    );

    let rooms: HashSet<_> = group.tickets().iter().map(|t| t.room_id).collect();
    debug_assert!(
        rooms.len() == group.tickets().len(),
        "Group {} holds two tickets for the same room",
        group.id
    );
}

/// Validate a room's queue and reservation state
pub fn assert_room_invariants(room: &Room) {
    debug_assert!(
        room.reservations().len() <= room.capacity(),
        "Room {} has {} reservations for capacity {}",
        room.id(),
        room.reservations().len(),
        room.capacity()
    );

    let owners: HashSet<_> = room.queue().map(|t| t.owner).collect();
    debug_assert!(
        owners.len() == room.queue_len(),
        "Room {} queues two tickets from the same group",
        room.id()
    );

    match room.round() {
        None => {
            // Closed rounds leave nobody pending
            debug_assert!(
                room.queue()
                    .all(|t| t.grouping_response == GroupingResponse::Unnotified),
                "Room {} has round state on tickets without an open round",
                room.id()
            );
        }
        Some(round) => {
            debug_assert!(
                round.candidates.len() <= room.free_capacity(),
                "Room {} round {} has {} candidates for {} free places",
                room.id(),
                round.id,
                round.candidates.len(),
                room.free_capacity()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{QueueTicket, RoomInfoFixed, TicketRef};
    use uuid::Uuid;

    fn make_room() -> Room {
        Room::new(RoomInfoFixed {
            id: Uuid::new_v4(),
            name: "Aquarium".to_string(),
            location: String::new(),
            description: String::new(),
            capacity: 1,
        })
    }

    #[test]
    fn test_valid_group() {
        let mut group = TourGroup::new();
        group
            .add_ticket(TicketRef {
                ticket_id: Uuid::new_v4(),
                room_id: Uuid::new_v4(),
            })
            .unwrap();
        assert_group_invariants(&group);
    }

    #[test]
    fn test_valid_room() {
        let mut room = make_room();
        room.enqueue(QueueTicket::new(Uuid::new_v4(), room.id()))
            .unwrap();
        assert_room_invariants(&room);
    }

    #[test]
    #[should_panic(expected = "without an open round")]
    fn test_pending_ticket_without_round() {
        let mut room = make_room();
        room.enqueue(QueueTicket::new(Uuid::new_v4(), room.id()))
            .unwrap();
        room.tickets_mut()[0].notify_grouping();
        assert_room_invariants(&room);
    }
}
