//! Admission engine - shared server-side state deciding who enters which room
//!
//! Sectors and rooms are fixed at construction. Each room is guarded by its
//! own mutex and each tour group by another. Lock order is always room
//! first, then group(s); several groups are locked in ascending id order.
//! A group lock is never held while acquiring a room.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::EventConfig;
use crate::error::{Error, Result};
use crate::grouping::{Effects, GroupingStatus};
use crate::invariants::{assert_group_invariants, assert_room_invariants};
use crate::models::{
    EventInfoFixed, EventInfoUpdate, GroupInfo, Guide, QueueInfo, QueueTicket, Reservation,
    ReservationRef, Room, RoomDetails, RoomInfoFixed, Sector, SectorInfo, TicketRef, TourGroup,
};
use crate::penalty::{policy_for, PenaltyPolicy};

type GroupHandle = Arc<Mutex<TourGroup>>;

/// Shared admission state for one event
#[derive(Debug)]
pub struct AdmissionEngine {
    name: String,
    sectors: BTreeMap<Uuid, Sector>,
    /// Room id to owning sector id
    room_index: HashMap<Uuid, Uuid>,
    groups: RwLock<HashMap<Uuid, GroupHandle>>,
    policy: Box<dyn PenaltyPolicy>,
    pending_timeout: chrono::Duration,
}

impl AdmissionEngine {
    pub fn new(
        name: String,
        sectors: Vec<Sector>,
        policy: Box<dyn PenaltyPolicy>,
        pending_timeout: std::time::Duration,
    ) -> Result<Self> {
        let mut room_index = HashMap::new();
        let mut by_id = BTreeMap::new();
        for sector in sectors {
            for room_id in sector.room_ids() {
                if room_index.insert(room_id, sector.id()).is_some() {
                    return Err(Error::InvariantViolation(format!(
                        "room {} appears twice",
                        room_id
                    )));
                }
            }
            if by_id.contains_key(&sector.id()) {
                return Err(Error::InvariantViolation(format!(
                    "sector {} appears twice",
                    sector.id()
                )));
            }
            by_id.insert(sector.id(), sector);
        }

        let pending_timeout = chrono::Duration::from_std(pending_timeout)
            .map_err(|e| Error::InvariantViolation(format!("pending timeout: {}", e)))?;

        Ok(Self {
            name,
            sectors: by_id,
            room_index,
            groups: RwLock::new(HashMap::new()),
            policy,
            pending_timeout,
        })
    }

    /// Build the engine from the event layout in a config file
    pub fn from_config(config: &EventConfig) -> Result<Self> {
        let sectors = config
            .sectors
            .iter()
            .map(|s| {
                let rooms = s
                    .rooms
                    .iter()
                    .map(|r| {
                        Room::new(RoomInfoFixed {
                            id: r.id.unwrap_or_else(Uuid::new_v4),
                            name: r.name.clone(),
                            location: r.location.clone(),
                            description: r.description.clone(),
                            capacity: r.capacity,
                        })
                    })
                    .collect();
                Sector::new(
                    SectorInfo {
                        id: s.id.unwrap_or_else(Uuid::new_v4),
                        name: s.name.clone(),
                        address: s.address.clone(),
                        description: s.description.clone(),
                    },
                    rooms,
                )
            })
            .collect();

        Self::new(
            config.event.name.clone(),
            sectors,
            policy_for(config.admission.max_penalty_level),
            config.admission.pending_timeout(),
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sectors(&self) -> impl Iterator<Item = &Sector> {
        self.sectors.values()
    }

    pub fn group_count(&self) -> usize {
        self.read_groups().len()
    }

    // ------------------------------------------------------------------
    // Snapshots
    // ------------------------------------------------------------------

    pub fn event_snapshot(&self) -> EventInfoFixed {
        EventInfoFixed {
            name: self.name.clone(),
            sectors: self
                .sectors
                .iter()
                .map(|(id, s)| (*id, s.info_fixed()))
                .collect(),
        }
    }

    pub fn event_update(&self) -> EventInfoUpdate {
        EventInfoUpdate {
            generated_at: Utc::now(),
            sectors: self
                .sectors
                .iter()
                .map(|(id, s)| (*id, s.info_update()))
                .collect(),
        }
    }

    pub fn room_details(&self, room_id: Uuid) -> Result<RoomDetails> {
        let sector_id = self.sector_of(room_id)?;
        let room = self.room(room_id)?;
        Ok(RoomDetails {
            sector_id,
            info: room.info().clone(),
            state: room.state(),
        })
    }

    // ------------------------------------------------------------------
    // Groups and guides
    // ------------------------------------------------------------------

    /// Register a new tour group led by `guide`
    pub fn register_group(&self, guide: Guide) -> Uuid {
        let mut group = TourGroup::new();
        let group_id = group.id;
        // A fresh group always has room for its first guide
        let _ = group.add_guide(guide);
        self.write_groups()
            .insert(group_id, Arc::new(Mutex::new(group)));
        info!(group_id = %group_id, "Tour group registered");
        group_id
    }

    pub fn group_info(&self, group_id: Uuid) -> Result<GroupInfo> {
        let handle = self.group_handle(group_id)?;
        let info = lock_group(&handle).info();
        Ok(info)
    }

    pub fn add_guide(&self, group_id: Uuid, guide: Guide) -> Result<()> {
        let handle = self.group_handle(group_id)?;
        let mut group = lock_group(&handle);
        if group.is_retired() {
            return Err(Error::NotFound(format!("group {}", group_id)));
        }
        let username = guide.username.clone();
        group.add_guide(guide)?;
        assert_group_invariants(&group);
        info!(group_id = %group_id, guide = %username, "Guide joined group");
        Ok(())
    }

    /// Detach a guide; returns how many guides remain
    pub fn remove_guide(&self, group_id: Uuid, guide_id: Uuid) -> Result<usize> {
        let handle = self.group_handle(group_id)?;
        let mut group = lock_group(&handle);
        if !group.remove_guide(guide_id) {
            return Err(Error::NotFound(format!(
                "guide {} in group {}",
                guide_id, group_id
            )));
        }
        Ok(group.guides().len())
    }

    /// End a group's session: withdraw its tickets, release its
    /// reservations and resolve any round it took part in.
    pub fn remove_group(&self, group_id: Uuid) -> Result<Effects> {
        let now = Utc::now();
        let handle = self
            .write_groups()
            .remove(&group_id)
            .ok_or_else(|| Error::NotFound(format!("group {}", group_id)))?;

        let (tickets, reservations) = {
            let mut group = lock_group(&handle);
            group.retire();
            (group.tickets().to_vec(), group.reservations().to_vec())
        };

        let mut effects = Effects::default();
        for ticket in tickets {
            let mut room = self.room(ticket.room_id)?;
            effects.extend(self.withdraw_ticket(&mut room, ticket.ticket_id, now)?);
            assert_room_invariants(&room);
        }
        for reservation in reservations {
            let mut room = self.room(reservation.room_id)?;
            room.release(reservation.reservation_id);
            effects.extend(self.try_begin_round(&mut room, now));
            assert_room_invariants(&room);
        }

        info!(group_id = %group_id, "Tour group removed");
        Ok(effects)
    }

    // ------------------------------------------------------------------
    // Tickets
    // ------------------------------------------------------------------

    /// Queue `group_id` for `room_id`; may open a grouping round
    pub fn add_ticket(&self, group_id: Uuid, room_id: Uuid) -> Result<(QueueInfo, Effects)> {
        let now = Utc::now();
        let handle = self.group_handle(group_id)?;
        let mut room = self.room(room_id)?;

        let ticket = QueueTicket::new(group_id, room_id);
        {
            let mut group = lock_group(&handle);
            if group.is_retired() {
                return Err(Error::NotFound(format!("group {}", group_id)));
            }
            if !self.policy.may_enqueue(group.penalty_level()) {
                return Err(Error::Penalized(format!(
                    "group {} is at penalty level {}",
                    group_id,
                    group.penalty_level()
                )));
            }
            let ticket_ref = TicketRef {
                ticket_id: ticket.id,
                room_id,
            };
            group.add_ticket(ticket_ref)?;
            if let Err(e) = room.enqueue(ticket.clone()) {
                group.remove_ticket(ticket.id);
                return Err(e);
            }
            assert_group_invariants(&group);
        }

        let effects = self.try_begin_round(&mut room, now);
        let queue_info = room
            .queue_info(ticket.id)
            .ok_or_else(|| Error::NotFound(format!("ticket {}", ticket.id)))?;
        assert_room_invariants(&room);

        info!(
            group_id = %group_id,
            room_id = %room_id,
            position = queue_info.position,
            "Ticket queued"
        );
        Ok((queue_info, effects))
    }

    /// Cancel a ticket. A candidate in an open round counts as declining.
    pub fn remove_ticket(&self, group_id: Uuid, ticket_id: Uuid) -> Result<Effects> {
        let now = Utc::now();
        let handle = self.group_handle(group_id)?;
        let ticket_ref = self.ticket_ref(&handle, ticket_id)?;

        let mut room = self.room(ticket_ref.room_id)?;
        let effects = self.withdraw_ticket(&mut room, ticket_id, now)?;
        lock_group(&handle).remove_ticket(ticket_id);
        assert_room_invariants(&room);

        info!(group_id = %group_id, ticket_id = %ticket_id, "Ticket removed");
        Ok(effects)
    }

    /// Current standing of each of the group's tickets
    pub fn tickets(&self, group_id: Uuid) -> Result<Vec<QueueInfo>> {
        let handle = self.group_handle(group_id)?;
        let refs = lock_group(&handle).tickets().to_vec();

        let mut infos = Vec::with_capacity(refs.len());
        for ticket in refs {
            let room = self.room(ticket.room_id)?;
            if let Some(info) = room.queue_info(ticket.ticket_id) {
                infos.push(info);
            }
        }
        Ok(infos)
    }

    // ------------------------------------------------------------------
    // Grouping
    // ------------------------------------------------------------------

    /// Apply one group's answer to a grouping proposal
    pub fn respond_grouping(
        &self,
        group_id: Uuid,
        round_id: Uuid,
        ticket_id: Uuid,
        accepted: bool,
    ) -> Result<Effects> {
        let now = Utc::now();
        let handle = self.group_handle(group_id)?;
        let ticket_ref = self.ticket_ref(&handle, ticket_id)?;

        let mut room = self.room(ticket_ref.room_id)?;
        room.record_response(round_id, ticket_id, accepted)?;
        debug!(
            room_id = %ticket_ref.room_id,
            round_id = %round_id,
            group_id = %group_id,
            accepted,
            "Grouping answer recorded"
        );
        let effects = self.settle(&mut room, now)?;
        assert_room_invariants(&room);
        Ok(effects)
    }

    /// Whether `round_id` is still the open round of `room_id`
    pub fn is_round_open(&self, room_id: Uuid, round_id: Uuid) -> bool {
        match self.room(room_id) {
            Ok(room) => room.round().map_or(false, |r| r.id == round_id),
            Err(_) => false,
        }
    }

    /// Treat unanswered proposals past their deadline as declines
    pub fn expire_rounds(&self, now: DateTime<Utc>) -> Effects {
        let mut effects = Effects::default();
        for sector in self.sectors.values() {
            for room_id in sector.room_ids() {
                let Some(mut room) = sector.room(room_id) else {
                    continue;
                };
                if !room.expire_round(now) {
                    continue;
                }
                info!(room_id = %room_id, "Grouping round expired");
                match self.settle(&mut room, now) {
                    Ok(more) => effects.extend(more),
                    Err(e) => warn!(room_id = %room_id, error = %e, "Failed to settle expired round"),
                }
                assert_room_invariants(&room);
            }
        }
        effects
    }

    /// Open rounds wherever capacity and queue allow
    pub fn start_rounds(&self) -> Effects {
        let now = Utc::now();
        let mut effects = Effects::default();
        for sector in self.sectors.values() {
            for room_id in sector.room_ids() {
                if let Some(mut room) = sector.room(room_id) {
                    effects.extend(self.try_begin_round(&mut room, now));
                }
            }
        }
        effects
    }

    // ------------------------------------------------------------------
    // Reservations
    // ------------------------------------------------------------------

    pub fn reservations(&self, group_id: Uuid) -> Result<Vec<Reservation>> {
        let handle = self.group_handle(group_id)?;
        let refs = lock_group(&handle).reservations().to_vec();

        let mut reservations = Vec::with_capacity(refs.len());
        for r in refs {
            let room = self.room(r.room_id)?;
            if let Some(found) = room.reservations().iter().find(|x| x.id == r.reservation_id) {
                reservations.push(found.clone());
            }
        }
        Ok(reservations)
    }

    /// The group enters the room it holds a reservation for
    pub fn check_in(&self, group_id: Uuid, reservation_id: Uuid) -> Result<()> {
        let handle = self.group_handle(group_id)?;
        let mut group = lock_group(&handle);
        let reservation = group
            .reservation(reservation_id)
            .ok_or_else(|| Error::NotFound(format!("reservation {}", reservation_id)))?;
        group.set_current_room(reservation.room_id);
        info!(group_id = %group_id, room_id = %reservation.room_id, "Group checked in");
        Ok(())
    }

    /// The visit is over; capacity is freed without penalty
    pub fn complete_reservation(&self, group_id: Uuid, reservation_id: Uuid) -> Result<Effects> {
        self.release_reservation(group_id, reservation_id, false)
    }

    /// The group gives up its hold; its penalty level increases
    pub fn abandon_reservation(&self, group_id: Uuid, reservation_id: Uuid) -> Result<Effects> {
        self.release_reservation(group_id, reservation_id, true)
    }

    fn release_reservation(
        &self,
        group_id: Uuid,
        reservation_id: Uuid,
        penalize: bool,
    ) -> Result<Effects> {
        let now = Utc::now();
        let handle = self.group_handle(group_id)?;
        let reservation: ReservationRef = lock_group(&handle)
            .reservation(reservation_id)
            .ok_or_else(|| Error::NotFound(format!("reservation {}", reservation_id)))?;

        let mut room = self.room(reservation.room_id)?;
        room.release(reservation_id);
        {
            let mut group = lock_group(&handle);
            group.remove_reservation(reservation_id);
            if penalize {
                group.increase_penalty_level();
                info!(
                    group_id = %group_id,
                    room_id = %reservation.room_id,
                    penalty_level = group.penalty_level(),
                    "Reservation abandoned"
                );
            } else {
                info!(group_id = %group_id, room_id = %reservation.room_id, "Reservation completed");
            }
            assert_group_invariants(&group);
        }

        let effects = self.try_begin_round(&mut room, now);
        assert_room_invariants(&room);
        Ok(effects)
    }

    // ------------------------------------------------------------------
    // Internals (caller holds the room lock)
    // ------------------------------------------------------------------

    /// Open a round on `room` if possible and address its proposals
    fn try_begin_round(&self, room: &mut Room, now: DateTime<Utc>) -> Effects {
        let round = room.begin_round(now, self.pending_timeout, |ticket| {
            match self.lookup_group(ticket.owner) {
                Some(handle) => {
                    let group = lock_group(&handle);
                    !group.is_retired()
                        && group.can_add_reservation()
                        && self
                            .policy
                            .may_join_round(group.penalty_level(), ticket.times_asked)
                }
                None => false,
            }
        });

        match round {
            Some(round) => {
                info!(
                    room_id = %round.room_id,
                    round_id = %round.id,
                    candidates = round.candidates.len(),
                    "Grouping round started"
                );
                Effects {
                    proposals: round.proposals(),
                    notices: Vec::new(),
                }
            }
            None => Effects::default(),
        }
    }

    /// Close the open round if its answers allow, then try the next one
    fn settle(&self, room: &mut Room, now: DateTime<Utc>) -> Result<Effects> {
        let mut effects = Effects::default();
        match room.update_fully_grouped_status() {
            GroupingStatus::Idle | GroupingStatus::Waiting => return Ok(effects),
            GroupingStatus::Broken => {
                if let Some(failure) = room.fail_round() {
                    info!(
                        room_id = %failure.room_id,
                        round_id = %failure.round_id,
                        declined = failure.declined.len(),
                        "Grouping round failed"
                    );
                    effects.record_failure(&failure);
                }
            }
            GroupingStatus::FullyGrouped => {
                let Some(round) = room.round().cloned() else {
                    return Ok(effects);
                };

                let mut group_ids: Vec<Uuid> = round.candidates.iter().map(|c| c.group_id).collect();
                group_ids.sort();
                group_ids.dedup();
                let handles: Vec<(Uuid, GroupHandle)> = group_ids
                    .iter()
                    .filter_map(|id| self.lookup_group(*id).map(|h| (*id, h)))
                    .collect();
                let mut guards: HashMap<Uuid, MutexGuard<'_, TourGroup>> = handles
                    .iter()
                    .map(|(id, handle)| (*id, lock_group(handle)))
                    .collect();

                // Owners that went away or got a reservation elsewhere meanwhile
                let conflicted: Vec<Uuid> = round
                    .candidates
                    .iter()
                    .filter(|c| {
                        guards
                            .get(&c.group_id)
                            .map_or(true, |g| g.is_retired() || !g.can_add_reservation())
                    })
                    .map(|c| c.ticket_id)
                    .collect();

                if !conflicted.is_empty() {
                    drop(guards);
                    warn!(
                        room_id = %round.room_id,
                        round_id = %round.id,
                        conflicted = conflicted.len(),
                        "Grouped owners can no longer hold a reservation"
                    );
                    for ticket_id in conflicted {
                        room.decline_candidate(ticket_id);
                    }
                    return self.settle(room, now);
                }

                let grant = room.grant_round(now)?;
                for (ticket_id, reservation) in &grant.granted {
                    if let Some(group) = guards.get_mut(&reservation.group_id) {
                        group.remove_ticket(*ticket_id);
                        group.add_reservation(ReservationRef {
                            reservation_id: reservation.id,
                            room_id: reservation.room_id,
                        })?;
                        assert_group_invariants(group);
                    }
                }
                drop(guards);

                info!(
                    room_id = %grant.room_id,
                    round_id = %grant.round_id,
                    granted = grant.granted.len(),
                    "Grouping round granted"
                );
                effects.record_grant(&grant);
            }
        }

        effects.extend(self.try_begin_round(room, now));
        Ok(effects)
    }

    /// Remove a ticket from its room, failing the open round first if the
    /// ticket is one of its candidates.
    fn withdraw_ticket(&self, room: &mut Room, ticket_id: Uuid, now: DateTime<Utc>) -> Result<Effects> {
        let mut effects = Effects::default();
        if room.decline_candidate(ticket_id) {
            if let Some(failure) = room.fail_round() {
                info!(
                    room_id = %failure.room_id,
                    round_id = %failure.round_id,
                    "Grouping round failed on ticket withdrawal"
                );
                effects.record_failure(&failure);
            }
        }
        room.withdraw(ticket_id)?;
        effects.extend(self.try_begin_round(room, now));
        Ok(effects)
    }

    fn ticket_ref(&self, handle: &GroupHandle, ticket_id: Uuid) -> Result<TicketRef> {
        lock_group(handle)
            .ticket(ticket_id)
            .ok_or_else(|| Error::NotFound(format!("ticket {}", ticket_id)))
    }

    fn sector_of(&self, room_id: Uuid) -> Result<Uuid> {
        self.room_index
            .get(&room_id)
            .copied()
            .ok_or_else(|| Error::NotFound(format!("room {}", room_id)))
    }

    fn room(&self, room_id: Uuid) -> Result<MutexGuard<'_, Room>> {
        let sector_id = self.sector_of(room_id)?;
        self.sectors
            .get(&sector_id)
            .and_then(|s| s.room(room_id))
            .ok_or_else(|| Error::NotFound(format!("room {}", room_id)))
    }

    fn group_handle(&self, group_id: Uuid) -> Result<GroupHandle> {
        self.lookup_group(group_id)
            .ok_or_else(|| Error::NotFound(format!("group {}", group_id)))
    }

    fn lookup_group(&self, group_id: Uuid) -> Option<GroupHandle> {
        self.read_groups().get(&group_id).cloned()
    }

    fn read_groups(&self) -> std::sync::RwLockReadGuard<'_, HashMap<Uuid, GroupHandle>> {
        match self.groups.read() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("Group map lock poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn write_groups(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<Uuid, GroupHandle>> {
        match self.groups.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("Group map lock poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }
}

fn lock_group(handle: &GroupHandle) -> MutexGuard<'_, TourGroup> {
    match handle.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!("Group mutex poisoned, recovering");
            poisoned.into_inner()
        }
    }
}
