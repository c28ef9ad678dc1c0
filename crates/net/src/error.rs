//! Network error types

use std::io;
use std::sync::Arc;

use tourgate_core::ErrorKind;

/// Network result type
pub type Result<T> = std::result::Result<T, Error>;

/// Network errors
///
/// `Clone` so a single transport failure can resolve every pending task.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(Arc<io::Error>),

    #[error("Connection lost")]
    ConnectionLost,

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Outbound queue is full")]
    ResourceExhausted,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Connection rejected: {0}")]
    Rejected(String),

    #[error("Timed out")]
    Timeout,

    #[error("Cancelled")]
    Cancelled,

    #[error("{kind:?}: {reason}")]
    Domain { kind: ErrorKind, reason: String },

    #[error("Server full")]
    ServerFull,

    #[error("Core error: {0}")]
    Core(String),
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(Arc::new(e))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<tourgate_core::Error> for Error {
    fn from(e: tourgate_core::Error) -> Self {
        match e.kind() {
            ErrorKind::Internal => Error::Core(e.to_string()),
            kind => Error::Domain {
                kind,
                reason: e.to_string(),
            },
        }
    }
}

impl Error {
    /// Classification used when this error is sent back as a failure reply
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Domain { kind, .. } => *kind,
            Error::Serialization(_) | Error::Protocol(_) => ErrorKind::BadRequest,
            Error::Rejected(_) => ErrorKind::NotAuthenticated,
            _ => ErrorKind::Internal,
        }
    }
}
