//! Reservation model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A granted, capacity-consuming hold on a Room for one TourGroup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Uuid,
    pub group_id: Uuid,
    pub room_id: Uuid,
    pub granted_at: DateTime<Utc>,
}

impl Reservation {
    pub fn new(group_id: Uuid, room_id: Uuid, granted_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            group_id,
            room_id,
            granted_at,
        }
    }
}
