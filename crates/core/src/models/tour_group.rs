//! Tour group model - a party of visitors admitted as one unit

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Maximum outstanding tickets per group
pub const MAX_TICKETS: usize = 3;
/// Maximum concurrent reservations per group
pub const MAX_RESERVATIONS: usize = 1;
/// Maximum guides attached to a group
pub const MAX_GUIDES: usize = 2;

/// A guide leading a tour group
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Guide {
    pub id: Uuid,
    pub username: String,
}

impl Guide {
    pub fn new(username: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            username,
        }
    }
}

/// Reference to a ticket living in a Room's queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketRef {
    pub ticket_id: Uuid,
    pub room_id: Uuid,
}

/// Reference to a reservation held by a Room
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationRef {
    pub reservation_id: Uuid,
    pub room_id: Uuid,
}

/// A client-side party. Tickets and reservations are stored by the Room
/// they target; the group keeps references keyed by id.
#[derive(Debug, Clone)]
pub struct TourGroup {
    pub id: Uuid,
    tickets: Vec<TicketRef>,
    reservations: Vec<ReservationRef>,
    guides: Vec<Guide>,
    penalty_level: u32,
    current_room: Option<Uuid>,
    retired: bool,
}

impl TourGroup {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            tickets: Vec::new(),
            reservations: Vec::new(),
            guides: Vec::new(),
            penalty_level: 0,
            current_room: None,
            retired: false,
        }
    }

    /// Increments the penalty for abandoning a reservation
    pub fn increase_penalty_level(&mut self) {
        self.penalty_level += 1;
    }

    pub fn penalty_level(&self) -> u32 {
        self.penalty_level
    }

    pub fn tickets(&self) -> &[TicketRef] {
        &self.tickets
    }

    pub fn reservations(&self) -> &[ReservationRef] {
        &self.reservations
    }

    pub fn guides(&self) -> &[Guide] {
        &self.guides
    }

    pub fn current_room(&self) -> Option<Uuid> {
        self.current_room
    }

    /// Rooms this group holds tickets for
    pub fn ticket_rooms(&self) -> Vec<Uuid> {
        self.tickets.iter().map(|t| t.room_id).collect()
    }

    pub fn ticket_for_room(&self, room_id: Uuid) -> Option<TicketRef> {
        self.tickets.iter().copied().find(|t| t.room_id == room_id)
    }

    pub fn ticket(&self, ticket_id: Uuid) -> Option<TicketRef> {
        self.tickets.iter().copied().find(|t| t.ticket_id == ticket_id)
    }

    pub fn reservation(&self, reservation_id: Uuid) -> Option<ReservationRef> {
        self.reservations
            .iter()
            .copied()
            .find(|r| r.reservation_id == reservation_id)
    }

    pub fn has_ticket_for(&self, room_id: Uuid) -> bool {
        self.tickets.iter().any(|t| t.room_id == room_id)
    }

    pub fn can_add_ticket(&self) -> bool {
        self.tickets.len() < MAX_TICKETS
    }

    pub fn can_add_reservation(&self) -> bool {
        self.reservations.len() < MAX_RESERVATIONS
    }

    pub fn add_ticket(&mut self, ticket: TicketRef) -> Result<()> {
        if self.has_ticket_for(ticket.room_id) {
            return Err(Error::DuplicateTicket(format!(
                "group {} already queued for room {}",
                self.id, ticket.room_id
            )));
        }
        if !self.can_add_ticket() {
            return Err(Error::CapacityExceeded(format!(
                "group {} already holds {} tickets",
                self.id, MAX_TICKETS
            )));
        }
        self.tickets.push(ticket);
        Ok(())
    }

    pub fn remove_ticket(&mut self, ticket_id: Uuid) -> Option<TicketRef> {
        let idx = self.tickets.iter().position(|t| t.ticket_id == ticket_id)?;
        Some(self.tickets.remove(idx))
    }

    pub fn add_reservation(&mut self, reservation: ReservationRef) -> Result<()> {
        if !self.can_add_reservation() {
            return Err(Error::CapacityExceeded(format!(
                "group {} already holds a reservation",
                self.id
            )));
        }
        self.reservations.push(reservation);
        Ok(())
    }

    pub fn remove_reservation(&mut self, reservation_id: Uuid) -> Option<ReservationRef> {
        let idx = self
            .reservations
            .iter()
            .position(|r| r.reservation_id == reservation_id)?;
        let removed = self.reservations.remove(idx);
        if self.current_room == Some(removed.room_id) {
            self.current_room = None;
        }
        Some(removed)
    }

    /// Adds a guide to this group's guide list
    pub fn add_guide(&mut self, guide: Guide) -> Result<()> {
        if self.guides.len() >= MAX_GUIDES {
            return Err(Error::CapacityExceeded(format!(
                "group {} already has {} guides",
                self.id, MAX_GUIDES
            )));
        }
        self.guides.push(guide);
        Ok(())
    }

    pub fn remove_guide(&mut self, guide_id: Uuid) -> bool {
        let before = self.guides.len();
        self.guides.retain(|g| g.id != guide_id);
        self.guides.len() != before
    }

    pub fn set_current_room(&mut self, room_id: Uuid) {
        self.current_room = Some(room_id);
    }

    /// Mark the group as ended; it accepts no new tickets afterwards
    pub fn retire(&mut self) {
        self.retired = true;
    }

    pub fn is_retired(&self) -> bool {
        self.retired
    }

    pub fn info(&self) -> GroupInfo {
        GroupInfo {
            id: self.id,
            guides: self.guides.clone(),
            penalty_level: self.penalty_level,
            current_room: self.current_room,
            ticket_count: self.tickets.len(),
            reservation_count: self.reservations.len(),
        }
    }
}

impl Default for TourGroup {
    fn default() -> Self {
        Self::new()
    }
}

/// Summary of a group for its own guides
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupInfo {
    pub id: Uuid,
    pub guides: Vec<Guide>,
    pub penalty_level: u32,
    pub current_room: Option<Uuid>,
    pub ticket_count: usize,
    pub reservation_count: usize,
}
