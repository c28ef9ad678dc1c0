//! Queue ticket model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A ticket's standing in the current grouping round
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum GroupingResponse {
    /// Queued, not part of any round
    #[default]
    Unnotified,
    /// Left out of the current round without being asked
    NoParticipation,
    /// Refused to share the room slot
    Declined,
    /// Asked, no answer yet
    Pending,
    /// Agreed to share the room slot
    Accepted,
}

impl GroupingResponse {
    /// Numeric code used by older clients; `Unnotified` has none
    pub fn code(self) -> Option<i8> {
        match self {
            GroupingResponse::Unnotified => None,
            GroupingResponse::NoParticipation => Some(-2),
            GroupingResponse::Declined => Some(-1),
            GroupingResponse::Pending => Some(0),
            GroupingResponse::Accepted => Some(1),
        }
    }
}

/// One party's request to enter one specific Room
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueTicket {
    pub id: Uuid,
    /// Owning TourGroup
    pub owner: Uuid,
    /// Destination Room
    pub destination: Uuid,
    pub times_asked: u32,
    pub grouping_response: GroupingResponse,
    pub enqueued_at: DateTime<Utc>,
}

impl QueueTicket {
    pub fn new(owner: Uuid, destination: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner,
            destination,
            times_asked: 0,
            grouping_response: GroupingResponse::Unnotified,
            enqueued_at: Utc::now(),
        }
    }

    /// Mark the ticket as asked in a new round
    pub fn notify_grouping(&mut self) {
        self.times_asked += 1;
        self.grouping_response = GroupingResponse::Pending;
    }

    pub fn set_no_participation(&mut self) {
        self.grouping_response = GroupingResponse::NoParticipation;
    }

    /// Return to plain queued state after a round closes
    pub fn reset(&mut self) {
        self.grouping_response = GroupingResponse::Unnotified;
    }

    pub fn is_pending(&self) -> bool {
        self.grouping_response == GroupingResponse::Pending
    }
}

/// A ticket as seen by its owner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueInfo {
    pub ticket_id: Uuid,
    pub room_id: Uuid,
    /// Zero-based position in the room's queue
    pub position: usize,
    pub queue_length: usize,
    pub times_asked: u32,
    pub grouping_response: GroupingResponse,
    pub enqueued_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notify_increments_times_asked() {
        let mut ticket = QueueTicket::new(Uuid::new_v4(), Uuid::new_v4());
        assert_eq!(ticket.grouping_response, GroupingResponse::Unnotified);

        ticket.notify_grouping();
        ticket.reset();
        ticket.notify_grouping();

        assert_eq!(ticket.times_asked, 2);
        assert!(ticket.is_pending());
    }

    #[test]
    fn test_response_codes() {
        assert_eq!(GroupingResponse::NoParticipation.code(), Some(-2));
        assert_eq!(GroupingResponse::Declined.code(), Some(-1));
        assert_eq!(GroupingResponse::Pending.code(), Some(0));
        assert_eq!(GroupingResponse::Accepted.code(), Some(1));
        assert_eq!(GroupingResponse::Unnotified.code(), None);
    }
}
