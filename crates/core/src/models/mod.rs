//! Data models for Tourgate

mod event_info;
mod reservation;
mod room;
mod sector;
mod ticket;
mod tour_group;

pub use event_info::*;
pub use reservation::*;
pub use room::*;
pub use sector::*;
pub use ticket::*;
pub use tour_group::*;
