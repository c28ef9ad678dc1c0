//! Penalty policy - what an abandonment record costs a group
//!
//! The penalty counter on a TourGroup only ever grows. What a higher level
//! restricts is decided here, so the admission layer can swap policies
//! without touching the counter.

use std::fmt::Debug;

/// Consequences of a group's penalty level
pub trait PenaltyPolicy: Send + Sync + Debug {
    /// May a group at this level queue for another room?
    fn may_enqueue(&self, penalty_level: u32) -> bool;

    /// May a group at this level be asked in a grouping round?
    fn may_join_round(&self, penalty_level: u32, times_asked: u32) -> bool;
}

/// No consequences at any level
#[derive(Debug, Clone, Copy, Default)]
pub struct Lenient;

impl PenaltyPolicy for Lenient {
    fn may_enqueue(&self, _penalty_level: u32) -> bool {
        true
    }

    fn may_join_round(&self, _penalty_level: u32, _times_asked: u32) -> bool {
        true
    }
}

/// Refuses new tickets once the level reaches `max_level`; groups already
/// queued keep their place.
#[derive(Debug, Clone, Copy)]
pub struct Threshold {
    pub max_level: u32,
}

impl PenaltyPolicy for Threshold {
    fn may_enqueue(&self, penalty_level: u32) -> bool {
        penalty_level < self.max_level
    }

    fn may_join_round(&self, _penalty_level: u32, _times_asked: u32) -> bool {
        true
    }
}

/// Build the policy for an optional configured limit
pub fn policy_for(max_level: Option<u32>) -> Box<dyn PenaltyPolicy> {
    match max_level {
        Some(max_level) => Box::new(Threshold { max_level }),
        None => Box::new(Lenient),
    }
}
