//! Room model - a queueable, capacity-limited resource

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use tracing::debug;
use uuid::Uuid;

use super::{
    GroupingResponse, QueueInfo, QueueTicket, Reservation, RoomInfoFixed, RoomInfoUpdate,
};
use crate::error::{Error, Result};
use crate::grouping::{Candidate, GroupingRound, GroupingStatus, RoundFailure, RoundGrant};

/// A Room owns its admission queue, its active reservations and at most one
/// open grouping round.
#[derive(Debug, Clone)]
pub struct Room {
    info: RoomInfoFixed,
    queue: VecDeque<QueueTicket>,
    reservations: Vec<Reservation>,
    round: Option<GroupingRound>,
}

impl Room {
    pub fn new(info: RoomInfoFixed) -> Self {
        Self {
            info,
            queue: VecDeque::new(),
            reservations: Vec::new(),
            round: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.info.id
    }

    pub fn info(&self) -> &RoomInfoFixed {
        &self.info
    }

    pub fn capacity(&self) -> usize {
        self.info.capacity
    }

    pub fn free_capacity(&self) -> usize {
        self.info.capacity.saturating_sub(self.reservations.len())
    }

    pub fn queue(&self) -> impl Iterator<Item = &QueueTicket> {
        self.queue.iter()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn reservations(&self) -> &[Reservation] {
        &self.reservations
    }

    pub fn round(&self) -> Option<&GroupingRound> {
        self.round.as_ref()
    }

    #[cfg(test)]
    pub(crate) fn tickets_mut(&mut self) -> &mut VecDeque<QueueTicket> {
        &mut self.queue
    }

    pub fn ticket(&self, ticket_id: Uuid) -> Option<&QueueTicket> {
        self.queue.iter().find(|t| t.id == ticket_id)
    }

    pub fn position_of(&self, ticket_id: Uuid) -> Option<usize> {
        self.queue.iter().position(|t| t.id == ticket_id)
    }

    pub fn queue_info(&self, ticket_id: Uuid) -> Option<QueueInfo> {
        let position = self.position_of(ticket_id)?;
        let ticket = &self.queue[position];
        Some(QueueInfo {
            ticket_id,
            room_id: self.id(),
            position,
            queue_length: self.queue.len(),
            times_asked: ticket.times_asked,
            grouping_response: ticket.grouping_response,
            enqueued_at: ticket.enqueued_at,
        })
    }

    pub fn state(&self) -> RoomInfoUpdate {
        RoomInfoUpdate {
            id: self.id(),
            active_reservations: self.reservations.len(),
            queue_length: self.queue.len(),
            round_in_progress: self.round.is_some(),
        }
    }

    /// Append a ticket to the tail of the queue
    pub fn enqueue(&mut self, mut ticket: QueueTicket) -> Result<()> {
        if ticket.destination != self.id() {
            return Err(Error::InvariantViolation(format!(
                "ticket {} targets room {}, not {}",
                ticket.id,
                ticket.destination,
                self.id()
            )));
        }
        if self.queue.iter().any(|t| t.owner == ticket.owner) {
            return Err(Error::DuplicateTicket(format!(
                "group {} already queued for room {}",
                ticket.owner,
                self.id()
            )));
        }
        // Late arrivals sit out the open round
        if self.round.is_some() {
            ticket.set_no_participation();
        } else {
            ticket.reset();
        }
        self.queue.push_back(ticket);
        Ok(())
    }

    /// Remove a ticket that is not a candidate in the open round
    pub fn withdraw(&mut self, ticket_id: Uuid) -> Result<QueueTicket> {
        if self.round.as_ref().is_some_and(|r| r.contains(ticket_id)) {
            return Err(Error::InvariantViolation(format!(
                "ticket {} is part of an open grouping round",
                ticket_id
            )));
        }
        let position = self
            .position_of(ticket_id)
            .ok_or_else(|| Error::NotFound(format!("ticket {}", ticket_id)))?;
        self.queue
            .remove(position)
            .ok_or_else(|| Error::NotFound(format!("ticket {}", ticket_id)))
    }

    /// Open a round over the longest-waiting eligible tickets.
    ///
    /// Returns `None` when a round is already open, there is no free
    /// capacity, or no queued ticket is eligible.
    pub fn begin_round<F>(
        &mut self,
        now: DateTime<Utc>,
        timeout: Duration,
        mut eligible: F,
    ) -> Option<&GroupingRound>
    where
        F: FnMut(&QueueTicket) -> bool,
    {
        if self.round.is_some() {
            return None;
        }
        let free = self.free_capacity();
        if free == 0 || self.queue.is_empty() {
            return None;
        }

        let mut candidates = Vec::new();
        for ticket in self.queue.iter_mut() {
            if candidates.len() < free && eligible(ticket) {
                ticket.notify_grouping();
                candidates.push(Candidate {
                    ticket_id: ticket.id,
                    group_id: ticket.owner,
                });
            } else {
                ticket.set_no_participation();
            }
        }

        if candidates.is_empty() {
            self.queue.iter_mut().for_each(QueueTicket::reset);
            return None;
        }

        let round = GroupingRound {
            id: Uuid::new_v4(),
            room_id: self.id(),
            candidates,
            started_at: now,
            deadline: now + timeout,
        };
        debug!(
            room_id = %self.id(),
            round_id = %round.id,
            candidates = round.candidates.len(),
            "Grouping round opened"
        );
        self.round = Some(round);
        self.round.as_ref()
    }

    /// Record one candidate's answer and re-evaluate the round
    pub fn record_response(
        &mut self,
        round_id: Uuid,
        ticket_id: Uuid,
        accepted: bool,
    ) -> Result<GroupingStatus> {
        match &self.round {
            Some(round) if round.id == round_id => {
                if !round.contains(ticket_id) {
                    return Err(Error::InvariantViolation(format!(
                        "ticket {} is not a candidate of round {}",
                        ticket_id, round_id
                    )));
                }
            }
            _ => {
                return Err(Error::InvariantViolation(format!(
                    "grouping round {} is not open on room {}",
                    round_id,
                    self.id()
                )));
            }
        }

        let ticket = self
            .queue
            .iter_mut()
            .find(|t| t.id == ticket_id)
            .ok_or_else(|| Error::NotFound(format!("ticket {}", ticket_id)))?;

        match ticket.grouping_response {
            GroupingResponse::Pending | GroupingResponse::Accepted => {
                ticket.grouping_response = if accepted {
                    GroupingResponse::Accepted
                } else {
                    GroupingResponse::Declined
                };
            }
            other => {
                return Err(Error::InvariantViolation(format!(
                    "ticket {} cannot answer in state {:?}",
                    ticket_id, other
                )));
            }
        }

        Ok(self.update_fully_grouped_status())
    }

    /// Evaluate the open round from its candidates' answers
    pub fn update_fully_grouped_status(&self) -> GroupingStatus {
        let Some(round) = &self.round else {
            return GroupingStatus::Idle;
        };

        let mut all_accepted = true;
        for candidate in &round.candidates {
            match self.ticket(candidate.ticket_id).map(|t| t.grouping_response) {
                Some(GroupingResponse::Accepted) => {}
                Some(GroupingResponse::Declined) | None => return GroupingStatus::Broken,
                Some(_) => all_accepted = false,
            }
        }

        if all_accepted {
            GroupingStatus::FullyGrouped
        } else {
            GroupingStatus::Waiting
        }
    }

    /// Force a candidate's answer to declined
    pub fn decline_candidate(&mut self, ticket_id: Uuid) -> bool {
        if !self.round.as_ref().is_some_and(|r| r.contains(ticket_id)) {
            return false;
        }
        match self.queue.iter_mut().find(|t| t.id == ticket_id) {
            Some(ticket) => {
                ticket.grouping_response = GroupingResponse::Declined;
                true
            }
            None => false,
        }
    }

    /// Turn unanswered candidates into declines once the deadline passed
    pub fn expire_round(&mut self, now: DateTime<Utc>) -> bool {
        let expired: Vec<Uuid> = match &self.round {
            Some(round) if round.is_expired(now) => round
                .candidates
                .iter()
                .map(|c| c.ticket_id)
                .filter(|id| self.ticket(*id).is_some_and(QueueTicket::is_pending))
                .collect(),
            _ => return false,
        };
        for ticket_id in &expired {
            self.decline_candidate(*ticket_id);
        }
        !expired.is_empty()
    }

    /// Close the open round without granting.
    ///
    /// Declined candidates move to the queue tail; everyone else keeps their
    /// position. Every ticket leaves the round as `Unnotified`.
    pub fn fail_round(&mut self) -> Option<RoundFailure> {
        let round = self.round.take()?;

        let mut declined = Vec::new();
        let mut reverted = Vec::new();
        for candidate in &round.candidates {
            let is_declined = self
                .ticket(candidate.ticket_id)
                .map_or(true, |t| t.grouping_response == GroupingResponse::Declined);
            if is_declined {
                declined.push(*candidate);
            } else {
                reverted.push(*candidate);
            }
        }

        for candidate in &declined {
            if let Some(position) = self.position_of(candidate.ticket_id) {
                if let Some(ticket) = self.queue.remove(position) {
                    self.queue.push_back(ticket);
                }
            }
        }
        self.queue.iter_mut().for_each(QueueTicket::reset);

        debug!(
            room_id = %self.id(),
            round_id = %round.id,
            declined = declined.len(),
            "Grouping round failed"
        );
        Some(RoundFailure {
            round_id: round.id,
            room_id: round.room_id,
            declined,
            reverted,
        })
    }

    /// Close a fully grouped round, converting each candidate ticket into a
    /// reservation.
    pub fn grant_round(&mut self, now: DateTime<Utc>) -> Result<RoundGrant> {
        if self.update_fully_grouped_status() != GroupingStatus::FullyGrouped {
            return Err(Error::InvariantViolation(format!(
                "room {} has no fully grouped round",
                self.id()
            )));
        }
        let candidate_count = self.round.as_ref().map_or(0, |r| r.candidates.len());
        if candidate_count > self.free_capacity() {
            return Err(Error::CapacityExceeded(format!(
                "room {} has {} free places for {} groups",
                self.id(),
                self.free_capacity(),
                candidate_count
            )));
        }
        let Some(round) = self.round.take() else {
            return Err(Error::InvariantViolation(format!(
                "room {} has no open round",
                self.id()
            )));
        };

        let mut granted = Vec::with_capacity(round.candidates.len());
        for candidate in &round.candidates {
            if let Some(position) = self.position_of(candidate.ticket_id) {
                self.queue.remove(position);
            }
            let reservation = Reservation::new(candidate.group_id, self.id(), now);
            self.reservations.push(reservation.clone());
            granted.push((candidate.ticket_id, reservation));
        }
        self.queue.iter_mut().for_each(QueueTicket::reset);

        debug!(
            room_id = %self.id(),
            round_id = %round.id,
            granted = granted.len(),
            "Grouping round granted"
        );
        Ok(RoundGrant {
            round_id: round.id,
            room_id: round.room_id,
            granted,
        })
    }

    /// Drop an active reservation, freeing its capacity
    pub fn release(&mut self, reservation_id: Uuid) -> Option<Reservation> {
        let idx = self
            .reservations
            .iter()
            .position(|r| r.id == reservation_id)?;
        Some(self.reservations.remove(idx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_room(capacity: usize) -> Room {
        Room::new(RoomInfoFixed {
            id: Uuid::new_v4(),
            name: "Planetarium".to_string(),
            location: "Hall B".to_string(),
            description: String::new(),
            capacity,
        })
    }

    fn queue_group(room: &mut Room) -> QueueTicket {
        let ticket = QueueTicket::new(Uuid::new_v4(), room.id());
        room.enqueue(ticket.clone()).unwrap();
        ticket
    }

    fn open(room: &mut Room) -> GroupingRound {
        room.begin_round(Utc::now(), Duration::seconds(30), |_| true)
            .cloned()
            .unwrap()
    }

    #[test]
    fn test_enqueue_rejects_second_ticket_from_same_group() {
        let mut room = make_room(2);
        let ticket = queue_group(&mut room);
        let again = QueueTicket::new(ticket.owner, room.id());
        assert!(matches!(
            room.enqueue(again),
            Err(Error::DuplicateTicket(_))
        ));
        assert_eq!(room.queue_len(), 1);
    }

    #[test]
    fn test_enqueue_rejects_foreign_destination() {
        let mut room = make_room(1);
        let ticket = QueueTicket::new(Uuid::new_v4(), Uuid::new_v4());
        assert!(room.enqueue(ticket).is_err());
    }

    #[test]
    fn test_queue_info_reports_standing() {
        let mut room = make_room(1);
        let first = queue_group(&mut room);
        let second = queue_group(&mut room);

        let info = room.queue_info(second.id).unwrap();
        assert_eq!(info.position, 1);
        assert_eq!(info.queue_length, 2);
        assert_eq!(info.enqueued_at, second.enqueued_at);
        assert!(info.enqueued_at >= first.enqueued_at);
        assert!(room.queue_info(Uuid::new_v4()).is_none());
    }

    #[test]
    fn test_round_selects_queue_head_up_to_capacity() {
        let mut room = make_room(2);
        let t1 = queue_group(&mut room);
        let t2 = queue_group(&mut room);
        let t3 = queue_group(&mut room);

        let round = open(&mut room);
        let selected: Vec<Uuid> = round.candidates.iter().map(|c| c.ticket_id).collect();
        assert_eq!(selected, vec![t1.id, t2.id]);

        assert_eq!(room.ticket(t1.id).unwrap().grouping_response, GroupingResponse::Pending);
        assert_eq!(room.ticket(t1.id).unwrap().times_asked, 1);
        assert_eq!(
            room.ticket(t3.id).unwrap().grouping_response,
            GroupingResponse::NoParticipation
        );
        assert_eq!(room.ticket(t3.id).unwrap().times_asked, 0);
    }

    #[test]
    fn test_decline_fails_round_and_requeues() {
        let mut room = make_room(2);
        let t1 = queue_group(&mut room);
        let t2 = queue_group(&mut room);
        let t3 = queue_group(&mut room);
        let round = open(&mut room);

        assert_eq!(
            room.record_response(round.id, t1.id, true).unwrap(),
            GroupingStatus::Waiting
        );
        assert_eq!(
            room.record_response(round.id, t2.id, false).unwrap(),
            GroupingStatus::Broken
        );

        let failure = room.fail_round().unwrap();
        assert_eq!(failure.declined.len(), 1);
        assert_eq!(failure.declined[0].ticket_id, t2.id);
        assert_eq!(failure.reverted[0].ticket_id, t1.id);

        // Declined ticket went to the tail, nobody is left pending
        let order: Vec<Uuid> = room.queue().map(|t| t.id).collect();
        assert_eq!(order, vec![t1.id, t3.id, t2.id]);
        assert!(room
            .queue()
            .all(|t| t.grouping_response == GroupingResponse::Unnotified));
        assert!(room.round().is_none());
        assert!(room.reservations().is_empty());

        // T3 is eligible in the next round
        let next = open(&mut room);
        assert!(next.contains(t3.id));
    }

    #[test]
    fn test_all_accepted_grants_reservations() {
        let mut room = make_room(2);
        let t1 = queue_group(&mut room);
        let t2 = queue_group(&mut room);
        let round = open(&mut room);

        room.record_response(round.id, t1.id, true).unwrap();
        assert_eq!(
            room.record_response(round.id, t2.id, true).unwrap(),
            GroupingStatus::FullyGrouped
        );

        let grant = room.grant_round(Utc::now()).unwrap();
        assert_eq!(grant.granted.len(), 2);
        assert_eq!(room.reservations().len(), 2);
        assert_eq!(room.queue_len(), 0);
        assert_eq!(room.free_capacity(), 0);
        assert!(room
            .begin_round(Utc::now(), Duration::seconds(30), |_| true)
            .is_none());
    }

    #[test]
    fn test_accepted_answer_can_be_withdrawn_while_open() {
        let mut room = make_room(2);
        let t1 = queue_group(&mut room);
        let _t2 = queue_group(&mut room);
        let round = open(&mut room);

        room.record_response(round.id, t1.id, true).unwrap();
        assert_eq!(
            room.record_response(round.id, t1.id, false).unwrap(),
            GroupingStatus::Broken
        );
    }

    #[test]
    fn test_late_reply_after_close_is_rejected() {
        let mut room = make_room(1);
        let t1 = queue_group(&mut room);
        let round = open(&mut room);
        room.record_response(round.id, t1.id, false).unwrap();
        room.fail_round();

        assert!(matches!(
            room.record_response(round.id, t1.id, true),
            Err(Error::InvariantViolation(_))
        ));
    }

    #[test]
    fn test_ineligible_tickets_sit_out() {
        let mut room = make_room(1);
        let t1 = queue_group(&mut room);
        let t2 = queue_group(&mut room);
        let skip = t1.owner;

        let round = room
            .begin_round(Utc::now(), Duration::seconds(30), |t| t.owner != skip)
            .cloned()
            .unwrap();
        assert_eq!(round.candidates[0].ticket_id, t2.id);
        assert_eq!(
            room.ticket(t1.id).unwrap().grouping_response,
            GroupingResponse::NoParticipation
        );
    }

    #[test]
    fn test_expiry_declines_pending_candidates() {
        let mut room = make_room(2);
        let t1 = queue_group(&mut room);
        let _t2 = queue_group(&mut room);
        let start = Utc::now();
        let round = room
            .begin_round(start, Duration::seconds(5), |_| true)
            .cloned()
            .unwrap();
        room.record_response(round.id, t1.id, true).unwrap();

        assert!(!room.expire_round(start + Duration::seconds(1)));
        assert!(room.expire_round(start + Duration::seconds(5)));
        assert_eq!(room.update_fully_grouped_status(), GroupingStatus::Broken);

        let failure = room.fail_round().unwrap();
        assert_eq!(failure.reverted[0].ticket_id, t1.id);
        assert!(room.queue().all(|t| !t.is_pending()));
    }

    #[test]
    fn test_candidate_cannot_be_withdrawn_mid_round() {
        let mut room = make_room(1);
        let t1 = queue_group(&mut room);
        open(&mut room);
        assert!(room.withdraw(t1.id).is_err());

        assert!(room.decline_candidate(t1.id));
        room.fail_round();
        assert_eq!(room.withdraw(t1.id).unwrap().id, t1.id);
    }

    #[test]
    fn test_release_frees_capacity() {
        let mut room = make_room(1);
        let t1 = queue_group(&mut room);
        let round = open(&mut room);
        room.record_response(round.id, t1.id, true).unwrap();
        let grant = room.grant_round(Utc::now()).unwrap();
        assert_eq!(room.free_capacity(), 0);

        let reservation_id = grant.granted[0].1.id;
        assert!(room.release(reservation_id).is_some());
        assert_eq!(room.free_capacity(), 1);
        assert!(room.release(reservation_id).is_none());
    }
}
