//! Grouping rounds - batch consent negotiation before granting reservations
//!
//! A round picks the longest-waiting eligible tickets of a Room, up to its
//! free capacity, and asks each owner whether they agree to share the slot.
//! The round closes exactly once: either every candidate accepted and the
//! Room grants reservations, or someone declined (or timed out) and every
//! candidate returns to the queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::Reservation;

/// A ticket selected for a round, with its owner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub ticket_id: Uuid,
    pub group_id: Uuid,
}

/// An open round on one Room
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupingRound {
    pub id: Uuid,
    pub room_id: Uuid,
    pub candidates: Vec<Candidate>,
    pub started_at: DateTime<Utc>,
    /// Pending answers after this instant count as declines
    pub deadline: DateTime<Utc>,
}

impl GroupingRound {
    pub fn contains(&self, ticket_id: Uuid) -> bool {
        self.candidates.iter().any(|c| c.ticket_id == ticket_id)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.deadline
    }

    /// One proposal per candidate, addressed to its owning group
    pub fn proposals(&self) -> Vec<GroupingProposal> {
        self.candidates
            .iter()
            .map(|c| GroupingProposal {
                round_id: self.id,
                room_id: self.room_id,
                ticket_id: c.ticket_id,
                group_id: c.group_id,
            })
            .collect()
    }
}

/// Aggregate state of the open round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupingStatus {
    /// No round is open
    Idle,
    /// Some candidates have not answered
    Waiting,
    /// Every candidate accepted
    FullyGrouped,
    /// At least one candidate declined
    Broken,
}

/// Round closed without granting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundFailure {
    pub round_id: Uuid,
    pub room_id: Uuid,
    /// Moved to the queue tail
    pub declined: Vec<Candidate>,
    /// Kept their position
    pub reverted: Vec<Candidate>,
}

impl RoundFailure {
    pub fn candidates(&self) -> impl Iterator<Item = &Candidate> {
        self.declined.iter().chain(self.reverted.iter())
    }
}

/// Round closed with every candidate admitted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundGrant {
    pub round_id: Uuid,
    pub room_id: Uuid,
    /// Consumed ticket and the reservation it became
    pub granted: Vec<(Uuid, Reservation)>,
}

/// Request for consent sent to a ticket's owner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupingProposal {
    pub round_id: Uuid,
    pub room_id: Uuid,
    pub ticket_id: Uuid,
    pub group_id: Uuid,
}

/// Something a group should be told about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    ReservationGranted(Reservation),
    RoundCancelled {
        group_id: Uuid,
        round_id: Uuid,
        room_id: Uuid,
        ticket_id: Uuid,
    },
}

impl Notice {
    pub fn group_id(&self) -> Uuid {
        match self {
            Notice::ReservationGranted(r) => r.group_id,
            Notice::RoundCancelled { group_id, .. } => *group_id,
        }
    }
}

/// Outbound consequences of an engine operation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Effects {
    pub proposals: Vec<GroupingProposal>,
    pub notices: Vec<Notice>,
}

impl Effects {
    pub fn is_empty(&self) -> bool {
        self.proposals.is_empty() && self.notices.is_empty()
    }

    pub fn extend(&mut self, other: Effects) {
        self.proposals.extend(other.proposals);
        self.notices.extend(other.notices);
    }

    pub(crate) fn record_failure(&mut self, failure: &RoundFailure) {
        for c in failure.candidates() {
            self.notices.push(Notice::RoundCancelled {
                group_id: c.group_id,
                round_id: failure.round_id,
                room_id: failure.room_id,
                ticket_id: c.ticket_id,
            });
        }
    }

    pub(crate) fn record_grant(&mut self, grant: &RoundGrant) {
        for (_, reservation) in &grant.granted {
            self.notices
                .push(Notice::ReservationGranted(reservation.clone()));
        }
    }
}
