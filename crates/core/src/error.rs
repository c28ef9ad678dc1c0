//! Error types for Tourgate Core

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ConfigError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Duplicate ticket: {0}")]
    DuplicateTicket(String),

    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Penalized: {0}")]
    Penalized(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Error classification carried in failure replies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    DuplicateTicket,
    CapacityExceeded,
    InvariantViolation,
    NotFound,
    NotAuthenticated,
    Penalized,
    BadRequest,
    Internal,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::DuplicateTicket(_) => ErrorKind::DuplicateTicket,
            Error::CapacityExceeded(_) => ErrorKind::CapacityExceeded,
            Error::InvariantViolation(_) => ErrorKind::InvariantViolation,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Authentication(_) => ErrorKind::NotAuthenticated,
            Error::Penalized(_) => ErrorKind::Penalized,
            Error::Config(_) | Error::Io(_) | Error::Serialization(_) => ErrorKind::Internal,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
