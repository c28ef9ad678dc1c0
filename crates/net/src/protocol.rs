//! Network protocol message types
//!
//! Every wire message is an [`Envelope`]: a command name, string arguments,
//! a typed payload and a correlation id. Envelopes are JSON-serialized and
//! length-prefixed on the wire. A reply carries the correlation id of the
//! request it answers and is flagged as a reply; id 0 means no reply is
//! expected. Both ends mint ids independently, so only flagged replies are
//! ever matched against pending tasks.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use tourgate_core::{
    ErrorKind, EventInfoFixed, EventInfoUpdate, GroupInfo, GroupingProposal, QueueInfo,
    Reservation, RoomDetails,
};

use crate::error::{Error, Result};

/// Command names understood by client and server
pub mod command {
    pub const CONNECT: &str = "connect";
    pub const LOGIN: &str = "login";
    pub const EVENT_DETAILS: &str = "eventDetails";
    pub const UPDATE: &str = "update";
    pub const DETAILS: &str = "details";
    pub const VIEW_TICKETS: &str = "viewTickets";
    pub const VIEW_RESERVATIONS: &str = "viewReservations";
    pub const ADD_TICKET: &str = "addTicket";
    pub const REMOVE_TICKET: &str = "removeTicket";
    pub const ABANDON_RESERVATION: &str = "abandonReservation";
    pub const COMPLETE_RESERVATION: &str = "completeReservation";
    pub const CHECK_IN: &str = "checkIn";
    pub const GROUP_INFO: &str = "groupInfo";
    pub const GROUPING: &str = "grouping";
    pub const RESERVATION_GRANTED: &str = "reservationGranted";
    pub const GROUPING_CANCELLED: &str = "groupingCancelled";
    pub const PING: &str = "ping";
}

/// Reply argument marking success
pub const ARG_TRUE: &str = "true";
/// Reply argument marking failure
pub const ARG_FALSE: &str = "false";
/// Grouping decision arguments
pub const ARG_ACCEPT: &str = "accept";
pub const ARG_DECLINE: &str = "decline";

/// Transmissible data carried by an envelope
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Payload {
    #[default]
    Empty,
    EventSnapshot(EventInfoFixed),
    EventUpdate(EventInfoUpdate),
    Tickets(Vec<QueueInfo>),
    Ticket(QueueInfo),
    Reservations(Vec<Reservation>),
    Reservation(Reservation),
    RoomDetails(RoomDetails),
    Group(GroupInfo),
    /// A grouping round a ticket takes part in (also used for cancellations)
    Proposal(GroupingProposal),
    Failure { kind: ErrorKind, reason: String },
}

/// The unit of communication on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub payload: Payload,
    #[serde(default)]
    pub correlation_id: u64,
    /// Set on answers to a request
    #[serde(default)]
    pub reply: bool,
}

impl Envelope {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            payload: Payload::Empty,
            correlation_id: 0,
            reply: false,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_correlation(mut self, correlation_id: u64) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    /// Mark as the answer to the request with the same correlation id
    pub fn as_reply(mut self) -> Self {
        self.reply = true;
        self
    }

    pub fn is_reply(&self) -> bool {
        self.reply
    }

    /// Build the answer to this envelope
    pub fn reply<I, S>(&self, args: I, payload: Payload) -> Envelope
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Envelope::new(self.command.clone())
            .with_args(args)
            .with_payload(payload)
            .with_correlation(self.correlation_id)
            .as_reply()
    }

    pub fn success(&self, payload: Payload) -> Envelope {
        self.reply([ARG_TRUE], payload)
    }

    pub fn failure(&self, kind: ErrorKind, reason: impl Into<String>) -> Envelope {
        self.reply(
            [ARG_FALSE],
            Payload::Failure {
                kind,
                reason: reason.into(),
            },
        )
    }

    /// True when the first argument is `"true"`
    pub fn is_success(&self) -> bool {
        self.arg(0) == Some(ARG_TRUE)
    }

    pub fn arg(&self, index: usize) -> Option<&str> {
        self.args.get(index).map(String::as_str)
    }

    /// Parse argument `index` as a UUID
    pub fn uuid_arg(&self, index: usize) -> Result<Uuid> {
        let raw = self
            .arg(index)
            .ok_or_else(|| Error::Protocol(format!("{}: missing argument {}", self.command, index)))?;
        Uuid::parse_str(raw)
            .map_err(|e| Error::Protocol(format!("{}: bad id '{}': {}", self.command, raw, e)))
    }

    pub fn expects_reply(&self) -> bool {
        self.correlation_id != 0
    }

    /// Turn a failure reply into an error, passing successes through
    pub fn into_result(self) -> Result<Envelope> {
        if self.is_success() {
            return Ok(self);
        }
        match self.payload {
            Payload::Failure { kind, reason } => Err(Error::Domain { kind, reason }),
            _ => Err(Error::Rejected(format!("{} refused", self.command))),
        }
    }

    /// Serialize envelope to JSON bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserialize envelope from JSON bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
