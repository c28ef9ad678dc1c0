//! Tourgate Core Library
//!
//! Event layout, tour groups, room queues, grouping rounds and the
//! admission engine tying them together.

pub mod accounts;
pub mod config;
pub mod engine;
pub mod error;
pub mod grouping;
pub mod invariants;
pub mod models;
pub mod penalty;

pub use accounts::{hash_password, Account, Accounts};
pub use config::{ConfigError, EventConfig};
pub use engine::AdmissionEngine;
pub use error::{Error, ErrorKind, Result};
pub use grouping::{Effects, GroupingProposal, GroupingStatus, Notice};
pub use models::*;
pub use penalty::{policy_for, PenaltyPolicy};
