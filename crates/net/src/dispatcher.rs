//! Correlation dispatcher
//!
//! Owns the outbound send queue handle and the set of pending tasks waiting
//! for a reply. A pending task is registered under a correlation id and the
//! command it was sent with. Only envelopes flagged as replies are matched,
//! so a peer's request that reuses an id is always routed as a command.

use std::collections::HashMap;

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::protocol::Envelope;

/// What a pending task wants after seeing a reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Remove the registration
    Done,
    /// Keep waiting for another envelope with the same id
    Continue,
}

/// A registered callback awaiting a reply
pub trait PendingTask: Send {
    fn on_reply(&mut self, reply: &Envelope) -> Resolution;

    /// Resolve with a failure; called at most once, never after `Done`
    fn fail(self: Box<Self>, error: Error);
}

/// Outcome of routing one inbound envelope
#[derive(Debug)]
pub enum Dispatched {
    /// Consumed by pending registrations
    Resolved { correlation_id: u64, completed: usize },
    /// No registration matched; route by command
    Unmatched(Envelope),
}

struct Registration {
    command: String,
    task: Box<dyn PendingTask>,
}

/// Per-connection correlation state
pub struct Dispatcher {
    next_id: u64,
    outbound: Option<mpsc::Sender<Vec<u8>>>,
    pending: HashMap<u64, Vec<Registration>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            outbound: None,
            pending: HashMap::new(),
        }
    }

    /// Mint a fresh non-zero correlation id
    pub fn next_correlation_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1).max(1);
        id
    }

    /// Start sending through a connection's outbound queue
    pub fn attach(&mut self, outbound: mpsc::Sender<Vec<u8>>) {
        self.outbound = Some(outbound);
    }

    pub fn detach(&mut self) {
        self.outbound = None;
    }

    /// Encode and enqueue an envelope without waiting
    pub fn send(&self, envelope: &Envelope) -> Result<()> {
        let outbound = self.outbound.as_ref().ok_or(Error::NotConnected)?;
        let bytes = envelope.to_bytes().map_err(|e| {
            warn!(command = %envelope.command, error = %e, "Dropping unencodable envelope");
            e
        })?;
        outbound.try_send(bytes).map_err(|e| match e {
            TrySendError::Full(_) => Error::ResourceExhausted,
            TrySendError::Closed(_) => Error::ConnectionLost,
        })
    }

    pub fn register_pending(
        &mut self,
        correlation_id: u64,
        command: impl Into<String>,
        task: Box<dyn PendingTask>,
    ) {
        self.pending.entry(correlation_id).or_default().push(Registration {
            command: command.into(),
            task,
        });
    }

    /// Send `envelope` under a fresh correlation id with `task` awaiting the
    /// reply. If sending fails the task is failed before this returns.
    pub fn request(&mut self, mut envelope: Envelope, task: Box<dyn PendingTask>) -> Result<u64> {
        let id = self.next_correlation_id();
        envelope.correlation_id = id;
        if let Err(e) = self.send(&envelope) {
            task.fail(e.clone());
            return Err(e);
        }
        self.register_pending(id, envelope.command, task);
        Ok(id)
    }

    /// Offer an inbound envelope to the pending registrations
    pub fn dispatch(&mut self, envelope: Envelope) -> Dispatched {
        let id = envelope.correlation_id;
        if id == 0 || !envelope.is_reply() {
            return Dispatched::Unmatched(envelope);
        }
        let Some(registrations) = self.pending.get_mut(&id) else {
            return Dispatched::Unmatched(envelope);
        };
        if !registrations.iter().any(|r| r.command == envelope.command) {
            return Dispatched::Unmatched(envelope);
        }

        let before = registrations.len();
        registrations.retain_mut(|r| {
            r.command != envelope.command || r.task.on_reply(&envelope) == Resolution::Continue
        });
        let completed = before - registrations.len();
        if registrations.is_empty() {
            self.pending.remove(&id);
        }

        debug!(correlation_id = id, command = %envelope.command, completed, "Reply matched");
        Dispatched::Resolved {
            correlation_id: id,
            completed,
        }
    }

    /// Drop the registrations for `command` under `correlation_id`, failing
    /// each task with `error`. Returns how many were dropped.
    pub fn cancel(&mut self, correlation_id: u64, command: &str, error: Error) -> usize {
        let Some(registrations) = self.pending.get_mut(&correlation_id) else {
            return 0;
        };
        let mut cancelled = Vec::new();
        let mut kept = Vec::new();
        for r in registrations.drain(..) {
            if r.command == command {
                cancelled.push(r);
            } else {
                kept.push(r);
            }
        }
        if kept.is_empty() {
            self.pending.remove(&correlation_id);
        } else {
            *registrations = kept;
        }

        let count = cancelled.len();
        for r in cancelled {
            r.task.fail(error.clone());
        }
        if count > 0 {
            debug!(correlation_id, command, count, "Cancelled pending tasks");
        }
        count
    }

    /// Resolve every pending task with `error`
    pub fn fail_all(&mut self, error: Error) {
        let count = self.pending_count();
        for (_, registrations) in self.pending.drain() {
            for r in registrations {
                r.task.fail(error.clone());
            }
        }
        if count > 0 {
            debug!(count, error = %error, "Failed pending tasks");
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.values().map(Vec::len).sum()
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}
