//! TCP server exposing the admission engine
//!
//! Every connection gets a ConnectionChannel and a session loop that owns
//! its own Dispatcher. The loop answers requests, pushes grouping proposals
//! and notices addressed to its tour group, and applies grouping decisions
//! as their replies come back. A proposal stays registered until it is
//! answered or its round closes. A sweeper task expires unanswered rounds.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use tourgate_core::config::DEFAULT_PORT;
use tourgate_core::{
    Accounts, AdmissionEngine, Effects, ErrorKind, EventConfig, GroupingProposal, Guide, Notice,
};

use crate::channel::{ChannelEvent, ConnectionChannel};
use crate::dispatcher::{Dispatched, Dispatcher, PendingTask, Resolution};
use crate::error::{Error, Result};
use crate::frame::write_frame;
use crate::protocol::{command, Envelope, Payload, ARG_ACCEPT, ARG_DECLINE, ARG_FALSE};

/// Server tuning
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: IpAddr,
    pub port: u16,
    /// Connections beyond this are refused
    pub max_sessions: usize,
    /// Capacity of each connection's queues
    pub queue_capacity: usize,
    /// How often expired rounds are swept
    pub sweep_interval: Duration,
}

impl ServerConfig {
    pub fn from_event(config: &EventConfig) -> Self {
        Self {
            bind: config.server.bind,
            port: config.server.port,
            max_sessions: config.server.max_sessions,
            queue_capacity: config.server.queue_capacity,
            sweep_interval: config.admission.sweep_interval(),
        }
    }

    /// Loopback-only server on `port` (0 picks a free one)
    pub fn local(port: u16) -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port,
            ..Self::default()
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            max_sessions: 256,
            queue_capacity: 64,
            sweep_interval: Duration::from_millis(1000),
        }
    }
}

/// Pushed to a session loop by other tasks
#[derive(Debug, Clone)]
enum SessionCommand {
    Propose(GroupingProposal),
    Notify(Notice),
}

/// What came back for a pushed proposal
#[derive(Debug, Clone)]
enum Answer {
    Decided {
        correlation_id: u64,
        proposal: GroupingProposal,
        accepted: bool,
    },
    /// The reply did not name the proposed round and ticket
    Malformed { correlation_id: u64, error: Error },
}

/// A proposal pushed to this session and not yet answered
#[derive(Debug, Clone, Copy)]
struct Outstanding {
    room_id: Uuid,
    correlation_id: u64,
}

/// A logged-in connection
struct Session {
    username: String,
    group_id: Uuid,
    commands: mpsc::Sender<SessionCommand>,
}

#[derive(Default)]
struct Registry {
    connections: usize,
    sessions: HashMap<u64, Session>,
    /// Shared group name to its tour group
    group_names: HashMap<String, Uuid>,
}

/// Server state shared across tasks
struct ServerState {
    engine: Arc<AdmissionEngine>,
    accounts: Accounts,
    config: ServerConfig,
    next_session_id: AtomicU64,
    registry: RwLock<Registry>,
}

/// Admission server handle
pub struct Server {
    addr: SocketAddr,
    state: Arc<ServerState>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Server {
    /// Bind and start serving `engine`
    pub async fn start(
        config: ServerConfig,
        engine: Arc<AdmissionEngine>,
        accounts: Accounts,
    ) -> Result<Self> {
        let addr = SocketAddr::new(config.bind, config.port);
        let listener = TcpListener::bind(addr).await?;
        let bound_addr = listener.local_addr()?;

        info!(
            addr = %bound_addr,
            event = %engine.name(),
            accounts = accounts.len(),
            "Server started"
        );

        let (shutdown_tx, _) = broadcast::channel(1);
        let state = Arc::new(ServerState {
            engine,
            accounts,
            config,
            next_session_id: AtomicU64::new(1),
            registry: RwLock::new(Registry::default()),
        });

        tokio::spawn(accept_loop(listener, state.clone(), shutdown_tx.clone()));
        tokio::spawn(sweeper_task(state.clone(), shutdown_tx.subscribe()));

        Ok(Server {
            addr: bound_addr,
            state,
            shutdown_tx,
        })
    }

    /// Get the server's bound address
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn engine(&self) -> &Arc<AdmissionEngine> {
        &self.state.engine
    }

    /// Number of logged-in sessions
    pub async fn session_count(&self) -> usize {
        self.state.registry.read().await.sessions.len()
    }

    /// Number of open connections, logged in or not
    pub async fn connection_count(&self) -> usize {
        self.state.registry.read().await.connections
    }

    /// Shutdown the server
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        info!("Server shutdown initiated");
    }
}

/// Accept incoming connections
async fn accept_loop(
    listener: TcpListener,
    state: Arc<ServerState>,
    shutdown_tx: broadcast::Sender<()>,
) {
    let mut shutdown_rx = shutdown_tx.subscribe();
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        let admitted = {
                            let mut registry = state.registry.write().await;
                            if registry.connections >= state.config.max_sessions {
                                false
                            } else {
                                registry.connections += 1;
                                true
                            }
                        };
                        if admitted {
                            debug!(addr = %addr, "New connection");
                            tokio::spawn(handle_connection(
                                stream,
                                addr,
                                state.clone(),
                                shutdown_tx.subscribe(),
                            ));
                        } else {
                            warn!(addr = %addr, "Server full, refusing connection");
                            tokio::spawn(refuse(stream));
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "Accept failed");
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                info!("Accept loop shutting down");
                break;
            }
        }
    }
}

/// Tell a connection it cannot be served, then drop it
async fn refuse(mut stream: TcpStream) {
    let envelope =
        Envelope::new(command::CONNECT).failure(ErrorKind::Internal, Error::ServerFull.to_string());
    if let Ok(bytes) = envelope.to_bytes() {
        let _ = write_frame(&mut stream, &bytes).await;
    }
}

/// Handle a single client connection
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    state: Arc<ServerState>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let capacity = state.config.queue_capacity.max(1);
    let session_id = state.next_session_id.fetch_add(1, Ordering::Relaxed);

    let (inbound_tx, mut inbound_rx) = mpsc::channel::<ChannelEvent>(capacity);
    let channel = ConnectionChannel::spawn(stream, session_id, capacity, inbound_tx);
    let (command_tx, mut command_rx) = mpsc::channel(capacity);

    let mut session = SessionLoop::new(session_id, state.clone(), command_tx);
    session.dispatcher.attach(channel.sender());
    info!(addr = %addr, session_id, "Connection opened");

    loop {
        tokio::select! {
            event = inbound_rx.recv() => match event {
                Some(ChannelEvent::Message { envelope, .. }) => session.on_envelope(envelope).await,
                Some(ChannelEvent::Closed { error, .. }) => {
                    debug!(session_id, error = %error, "Connection closed");
                    break;
                }
                None => break,
            },
            Some(cmd) = command_rx.recv() => session.on_command(cmd),
            _ = shutdown_rx.recv() => {
                debug!(session_id, "Session shutting down");
                break;
            }
        }
    }

    // Cleanup
    channel.close();
    session.dispatcher.detach();
    session.dispatcher.fail_all(Error::ConnectionLost);
    session.end().await;
    {
        let mut registry = state.registry.write().await;
        registry.connections = registry.connections.saturating_sub(1);
    }

    info!(addr = %addr, session_id, "Connection ended");
}

struct LoggedIn {
    username: String,
    group_id: Uuid,
    guide_id: Uuid,
}

/// Per-connection dispatch loop state
struct SessionLoop {
    id: u64,
    state: Arc<ServerState>,
    dispatcher: Dispatcher,
    login: Option<LoggedIn>,
    commands: mpsc::Sender<SessionCommand>,
    answers_tx: mpsc::UnboundedSender<Answer>,
    answers: mpsc::UnboundedReceiver<Answer>,
    /// Round id to its unanswered proposal
    proposals: HashMap<Uuid, Outstanding>,
}

impl SessionLoop {
    fn new(id: u64, state: Arc<ServerState>, commands: mpsc::Sender<SessionCommand>) -> Self {
        let (answers_tx, answers) = mpsc::unbounded_channel();
        Self {
            id,
            state,
            dispatcher: Dispatcher::new(),
            login: None,
            commands,
            answers_tx,
            answers,
            proposals: HashMap::new(),
        }
    }

    async fn on_envelope(&mut self, envelope: Envelope) {
        let envelope = match self.dispatcher.dispatch(envelope) {
            Dispatched::Resolved { .. } => {
                self.apply_answers().await;
                return;
            }
            Dispatched::Unmatched(envelope) if envelope.is_reply() => {
                self.on_late_reply(envelope).await;
                return;
            }
            Dispatched::Unmatched(envelope) => envelope,
        };

        match self.handle_request(&envelope).await {
            Ok(payload) => {
                if envelope.expects_reply() {
                    self.reply(envelope.success(payload));
                }
            }
            Err(e) => {
                warn!(
                    session_id = self.id,
                    command = %envelope.command,
                    error = %e,
                    "Request failed"
                );
                if envelope.expects_reply() {
                    self.reply(envelope.failure(e.kind(), failure_reason(&e)));
                }
            }
        }
    }

    fn reply(&self, envelope: Envelope) {
        if let Err(e) = self.dispatcher.send(&envelope) {
            warn!(session_id = self.id, command = %envelope.command, error = %e, "Reply not sent");
        }
    }

    /// Tell the peer its grouping answer under `correlation_id` was not applied
    fn refuse(&self, correlation_id: u64, error: &Error) {
        warn!(session_id = self.id, correlation_id, error = %error, "Grouping answer refused");
        let envelope = Envelope::new(command::GROUPING)
            .with_args([ARG_FALSE])
            .with_payload(Payload::Failure {
                kind: error.kind(),
                reason: failure_reason(error),
            })
            .with_correlation(correlation_id);
        self.reply(envelope);
    }

    fn group_id(&self) -> Result<Uuid> {
        self.login
            .as_ref()
            .map(|l| l.group_id)
            .ok_or_else(|| Error::Domain {
                kind: ErrorKind::NotAuthenticated,
                reason: "login required".into(),
            })
    }

    async fn handle_request(&mut self, envelope: &Envelope) -> Result<Payload> {
        let engine = self.state.engine.clone();
        match envelope.command.as_str() {
            command::PING => return Ok(Payload::Empty),
            command::LOGIN => return self.log_in(envelope).await,
            command::EVENT_DETAILS => return Ok(Payload::EventSnapshot(engine.event_snapshot())),
            _ => {}
        }

        let group_id = self.group_id()?;

        let payload = match envelope.command.as_str() {
            command::UPDATE => Payload::EventUpdate(engine.event_update()),
            command::DETAILS => Payload::RoomDetails(engine.room_details(envelope.uuid_arg(0)?)?),
            command::VIEW_TICKETS => Payload::Tickets(engine.tickets(group_id)?),
            command::VIEW_RESERVATIONS => Payload::Reservations(engine.reservations(group_id)?),
            command::ADD_TICKET => {
                let (info, effects) = engine.add_ticket(group_id, envelope.uuid_arg(0)?)?;
                deliver(&self.state, effects).await;
                Payload::Ticket(info)
            }
            command::REMOVE_TICKET => {
                let effects = engine.remove_ticket(group_id, envelope.uuid_arg(0)?)?;
                deliver(&self.state, effects).await;
                Payload::Empty
            }
            command::ABANDON_RESERVATION => {
                let effects = engine.abandon_reservation(group_id, envelope.uuid_arg(0)?)?;
                deliver(&self.state, effects).await;
                Payload::Empty
            }
            command::COMPLETE_RESERVATION => {
                let effects = engine.complete_reservation(group_id, envelope.uuid_arg(0)?)?;
                deliver(&self.state, effects).await;
                Payload::Empty
            }
            command::CHECK_IN => {
                engine.check_in(group_id, envelope.uuid_arg(0)?)?;
                Payload::Empty
            }
            command::GROUP_INFO => Payload::Group(engine.group_info(group_id)?),
            command::GROUPING => {
                let (round_id, ticket_id, accepted) = parse_decision(envelope)?;
                let effects = engine.respond_grouping(group_id, round_id, ticket_id, accepted)?;
                deliver(&self.state, effects).await;
                Payload::Empty
            }
            other => return Err(Error::Protocol(format!("unknown command '{}'", other))),
        };
        Ok(payload)
    }

    async fn log_in(&mut self, envelope: &Envelope) -> Result<Payload> {
        if self.login.is_some() {
            return Err(Error::Domain {
                kind: ErrorKind::InvariantViolation,
                reason: "session is already logged in".into(),
            });
        }
        let (username, password) = match (envelope.arg(0), envelope.arg(1)) {
            (Some(username), Some(password)) => (username.to_string(), password.to_string()),
            _ => return Err(Error::Protocol("login: expected username and password".into())),
        };

        // Password hashing is CPU-bound
        let state = self.state.clone();
        let account = tokio::task::spawn_blocking(move || {
            state.accounts.verify(&username, &password).cloned()
        })
        .await
        .map_err(|e| Error::Core(e.to_string()))??;

        let engine = &self.state.engine;
        let mut registry = self.state.registry.write().await;
        if registry
            .sessions
            .values()
            .any(|s| s.username == account.username)
        {
            return Err(Error::Domain {
                kind: ErrorKind::NotAuthenticated,
                reason: format!("{} is already logged in", account.username),
            });
        }

        let guide = Guide::new(account.username.clone());
        let guide_id = guide.id;
        let group_id = match &account.group {
            Some(name) => match registry.group_names.get(name).copied() {
                Some(group_id) => {
                    engine.add_guide(group_id, guide)?;
                    group_id
                }
                None => {
                    let group_id = engine.register_group(guide);
                    registry.group_names.insert(name.clone(), group_id);
                    group_id
                }
            },
            None => engine.register_group(guide),
        };
        registry.sessions.insert(
            self.id,
            Session {
                username: account.username.clone(),
                group_id,
                commands: self.commands.clone(),
            },
        );
        drop(registry);

        info!(
            session_id = self.id,
            username = %account.username,
            group_id = %group_id,
            "Guide logged in"
        );
        self.login = Some(LoggedIn {
            username: account.username,
            group_id,
            guide_id,
        });
        Ok(Payload::Group(engine.group_info(group_id)?))
    }

    fn on_command(&mut self, cmd: SessionCommand) {
        match cmd {
            SessionCommand::Propose(proposal) => {
                // Effects are delivered outside the engine locks, so a
                // round may already be over when its proposal arrives
                if !self
                    .state
                    .engine
                    .is_round_open(proposal.room_id, proposal.round_id)
                {
                    debug!(
                        session_id = self.id,
                        round_id = %proposal.round_id,
                        "Round closed before its proposal went out"
                    );
                    return;
                }
                // A new round on the room means any earlier one there is over
                self.forget_room(proposal.room_id);

                let envelope = Envelope::new(command::GROUPING)
                    .with_args([
                        proposal.round_id.to_string(),
                        proposal.room_id.to_string(),
                        proposal.ticket_id.to_string(),
                    ])
                    .with_payload(Payload::Proposal(proposal));
                let task = ProposalTask {
                    proposal,
                    answers: self.answers_tx.clone(),
                };
                match self.dispatcher.request(envelope, Box::new(task)) {
                    Ok(correlation_id) => {
                        self.proposals.insert(
                            proposal.round_id,
                            Outstanding {
                                room_id: proposal.room_id,
                                correlation_id,
                            },
                        );
                        debug!(
                            session_id = self.id,
                            round_id = %proposal.round_id,
                            correlation_id,
                            "Proposal sent"
                        );
                    }
                    Err(e) => warn!(
                        session_id = self.id,
                        round_id = %proposal.round_id,
                        error = %e,
                        "Proposal not sent"
                    ),
                }
            }
            SessionCommand::Notify(notice) => {
                match &notice {
                    Notice::RoundCancelled { round_id, .. } => self.forget_round(*round_id),
                    Notice::ReservationGranted(reservation) => self.forget_room(reservation.room_id),
                }
                let envelope = notice_envelope(notice);
                if let Err(e) = self.dispatcher.send(&envelope) {
                    warn!(session_id = self.id, command = %envelope.command, error = %e, "Notice not sent");
                }
            }
        }
    }

    /// Drop the pending proposal for a closed round
    fn forget_round(&mut self, round_id: Uuid) {
        if let Some(outstanding) = self.proposals.remove(&round_id) {
            self.dispatcher.cancel(
                outstanding.correlation_id,
                command::GROUPING,
                Error::Cancelled,
            );
        }
    }

    fn forget_room(&mut self, room_id: Uuid) {
        let closed: Vec<Uuid> = self
            .proposals
            .iter()
            .filter(|(_, o)| o.room_id == room_id)
            .map(|(round_id, _)| *round_id)
            .collect();
        for round_id in closed {
            self.forget_round(round_id);
        }
    }

    /// Apply the answers collected by resolved proposal tasks
    async fn apply_answers(&mut self) {
        while let Ok(answer) = self.answers.try_recv() {
            match answer {
                Answer::Decided {
                    correlation_id,
                    proposal,
                    accepted,
                } => {
                    self.proposals.remove(&proposal.round_id);
                    self.on_decision(correlation_id, proposal, accepted).await;
                }
                Answer::Malformed {
                    correlation_id,
                    error,
                } => self.refuse(correlation_id, &error),
            }
        }
    }

    async fn on_decision(&mut self, correlation_id: u64, proposal: GroupingProposal, accepted: bool) {
        let result = match self.group_id() {
            Ok(group_id) if group_id != proposal.group_id => Err(Error::Domain {
                kind: ErrorKind::InvariantViolation,
                reason: "proposal was addressed to another group".into(),
            }),
            Ok(_) => self
                .state
                .engine
                .respond_grouping(
                    proposal.group_id,
                    proposal.round_id,
                    proposal.ticket_id,
                    accepted,
                )
                .map_err(Error::from),
            Err(e) => Err(e),
        };
        match result {
            Ok(effects) => deliver(&self.state, effects).await,
            Err(e) => self.refuse(correlation_id, &e),
        }
    }

    /// A reply whose proposal is no longer pending. Grouping answers still
    /// go to the engine, which refuses them once the round has closed.
    async fn on_late_reply(&mut self, envelope: Envelope) {
        if envelope.command != command::GROUPING {
            debug!(
                session_id = self.id,
                command = %envelope.command,
                correlation_id = envelope.correlation_id,
                "Dropping unmatched reply"
            );
            return;
        }
        let result = self.group_id().and_then(|group_id| {
            let (round_id, ticket_id, accepted) = parse_decision(&envelope)?;
            Ok(self
                .state
                .engine
                .respond_grouping(group_id, round_id, ticket_id, accepted)?)
        });
        match result {
            Ok(effects) => deliver(&self.state, effects).await,
            Err(e) => self.refuse(envelope.correlation_id, &e),
        }
    }

    /// Detach this session's guide; the last guide out removes the group
    async fn end(&mut self) {
        let Some(login) = self.login.take() else {
            return;
        };
        let engine = self.state.engine.clone();

        let effects = {
            let mut registry = self.state.registry.write().await;
            registry.sessions.remove(&self.id);

            let remaining = match engine.remove_guide(login.group_id, login.guide_id) {
                Ok(remaining) => remaining,
                Err(e) => {
                    warn!(group_id = %login.group_id, error = %e, "Guide already gone");
                    0
                }
            };
            if remaining > 0 {
                None
            } else {
                registry.group_names.retain(|_, id| *id != login.group_id);
                match engine.remove_group(login.group_id) {
                    Ok(effects) => Some(effects),
                    Err(e) => {
                        warn!(group_id = %login.group_id, error = %e, "Group removal failed");
                        None
                    }
                }
            }
        };

        info!(session_id = self.id, username = %login.username, "Guide logged out");
        if let Some(effects) = effects {
            deliver(&self.state, effects).await;
        }
    }
}

/// Waits for one group's answer to a proposal
struct ProposalTask {
    proposal: GroupingProposal,
    answers: mpsc::UnboundedSender<Answer>,
}

impl ProposalTask {
    fn malformed(&self, correlation_id: u64, error: Error) -> Resolution {
        warn!(round_id = %self.proposal.round_id, error = %error, "Malformed grouping reply");
        let _ = self.answers.send(Answer::Malformed {
            correlation_id,
            error,
        });
        Resolution::Continue
    }
}

impl PendingTask for ProposalTask {
    fn on_reply(&mut self, reply: &Envelope) -> Resolution {
        let correlation_id = reply.correlation_id;
        match parse_decision(reply) {
            Ok((round_id, ticket_id, accepted))
                if round_id == self.proposal.round_id && ticket_id == self.proposal.ticket_id =>
            {
                let _ = self.answers.send(Answer::Decided {
                    correlation_id,
                    proposal: self.proposal,
                    accepted,
                });
                Resolution::Done
            }
            Ok(_) => self.malformed(
                correlation_id,
                Error::Protocol("grouping: reply names a different proposal".into()),
            ),
            Err(e) => self.malformed(correlation_id, e),
        }
    }

    fn fail(self: Box<Self>, error: Error) {
        debug!(round_id = %self.proposal.round_id, error = %error, "Proposal abandoned");
    }
}

/// `[roundId, ticketId, accept|decline]`
fn parse_decision(envelope: &Envelope) -> Result<(Uuid, Uuid, bool)> {
    let round_id = envelope.uuid_arg(0)?;
    let ticket_id = envelope.uuid_arg(1)?;
    let accepted = match envelope.arg(2) {
        Some(ARG_ACCEPT) => true,
        Some(ARG_DECLINE) => false,
        other => {
            return Err(Error::Protocol(format!(
                "grouping: bad decision {:?}",
                other
            )))
        }
    };
    Ok((round_id, ticket_id, accepted))
}

fn failure_reason(error: &Error) -> String {
    match error {
        Error::Domain { reason, .. } => reason.clone(),
        other => other.to_string(),
    }
}

fn notice_envelope(notice: Notice) -> Envelope {
    match notice {
        Notice::ReservationGranted(reservation) => Envelope::new(command::RESERVATION_GRANTED)
            .with_args([reservation.room_id.to_string(), reservation.id.to_string()])
            .with_payload(Payload::Reservation(reservation)),
        Notice::RoundCancelled {
            group_id,
            round_id,
            room_id,
            ticket_id,
        } => Envelope::new(command::GROUPING_CANCELLED)
            .with_args([round_id.to_string(), ticket_id.to_string()])
            .with_payload(Payload::Proposal(GroupingProposal {
                round_id,
                room_id,
                ticket_id,
                group_id,
            })),
    }
}

/// Route engine effects to the sessions of the groups they concern
async fn deliver(state: &ServerState, effects: Effects) {
    if effects.is_empty() {
        return;
    }
    let registry = state.registry.read().await;
    for proposal in effects.proposals {
        send_to_group(&registry, proposal.group_id, SessionCommand::Propose(proposal));
    }
    for notice in effects.notices {
        send_to_group(&registry, notice.group_id(), SessionCommand::Notify(notice));
    }
}

fn send_to_group(registry: &Registry, group_id: Uuid, cmd: SessionCommand) {
    let mut delivered = false;
    for (session_id, session) in registry
        .sessions
        .iter()
        .filter(|(_, s)| s.group_id == group_id)
    {
        match session.commands.try_send(cmd.clone()) {
            Ok(()) => delivered = true,
            Err(e) => warn!(session_id, error = %e, "Session queue full, dropping"),
        }
    }
    if !delivered {
        debug!(group_id = %group_id, "No live session for group");
    }
}

/// Sweeper task - expires unanswered rounds and retries idle rooms
async fn sweeper_task(state: Arc<ServerState>, mut shutdown_rx: broadcast::Receiver<()>) {
    let interval = state.config.sweep_interval;

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                let mut effects = state.engine.expire_rounds(Utc::now());
                effects.extend(state.engine.start_rounds());
                deliver(&state, effects).await;
            }
            _ = shutdown_rx.recv() => {
                debug!("Sweeper task shutting down");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::testing::wait_for;
    use crate::client::{Client, ClientConfig, ClientEvent};
    use tourgate_core::config::AccountConfig;
    use tourgate_core::penalty::Lenient;
    use tourgate_core::{hash_password, GroupingResponse, Room, RoomInfoFixed, Sector, SectorInfo};

    const PASSWORD: &str = "secret";

    struct Fixture {
        server: Server,
        room_id: Uuid,
    }

    fn accounts() -> Accounts {
        let hash = hash_password(PASSWORD).unwrap();
        let account = |username: &str, group: Option<&str>| AccountConfig {
            username: username.to_string(),
            password_hash: hash.clone(),
            group: group.map(str::to_string),
        };
        Accounts::from_config(&[
            account("alice", Some("red")),
            account("bob", Some("red")),
            account("eve", Some("red")),
            account("carol", None),
            account("dave", None),
        ])
        .unwrap()
    }

    fn make_engine(capacity: usize, pending_timeout: Duration) -> (AdmissionEngine, Uuid) {
        let room = Room::new(RoomInfoFixed {
            id: Uuid::new_v4(),
            name: "Reptile House".into(),
            location: "North wing".into(),
            description: String::new(),
            capacity,
        });
        let room_id = room.id();
        let sector = Sector::new(
            SectorInfo {
                id: Uuid::new_v4(),
                name: "Zoo".into(),
                address: String::new(),
                description: String::new(),
            },
            vec![room],
        );
        let engine = AdmissionEngine::new(
            "Test Expo".into(),
            vec![sector],
            Box::new(Lenient),
            pending_timeout,
        )
        .unwrap();
        (engine, room_id)
    }

    async fn start_with(
        capacity: usize,
        pending_timeout: Duration,
        config: ServerConfig,
    ) -> Fixture {
        let (engine, room_id) = make_engine(capacity, pending_timeout);
        let server = Server::start(config, Arc::new(engine), accounts())
            .await
            .unwrap();
        Fixture { server, room_id }
    }

    /// A logged-in session loop without a socket; frames it sends land on
    /// the returned receiver.
    struct Detached {
        session: SessionLoop,
        outbound: mpsc::Receiver<Vec<u8>>,
        room_id: Uuid,
        group_id: Uuid,
        _commands: mpsc::Receiver<SessionCommand>,
    }

    impl Detached {
        fn new(capacity: usize) -> Self {
            let (engine, room_id) = make_engine(capacity, Duration::from_secs(30));
            let state = Arc::new(ServerState {
                engine: Arc::new(engine),
                accounts: Accounts::from_config(&[]).unwrap(),
                config: ServerConfig::local(0),
                next_session_id: AtomicU64::new(1),
                registry: RwLock::new(Registry::default()),
            });
            let (commands_tx, commands) = mpsc::channel(8);
            let mut session = SessionLoop::new(1, state.clone(), commands_tx);
            let (outbound_tx, outbound) = mpsc::channel(64);
            session.dispatcher.attach(outbound_tx);

            let guide = Guide::new("carol".into());
            let guide_id = guide.id;
            let group_id = state.engine.register_group(guide);
            session.login = Some(LoggedIn {
                username: "carol".into(),
                group_id,
                guide_id,
            });
            Self {
                session,
                outbound,
                room_id,
                group_id,
                _commands: commands,
            }
        }

        fn engine(&self) -> Arc<AdmissionEngine> {
            self.session.state.engine.clone()
        }

        fn first_proposal(&self) -> GroupingProposal {
            let (_, effects) = self.engine().add_ticket(self.group_id, self.room_id).unwrap();
            effects.proposals[0]
        }

        fn next_frame(&mut self) -> Option<Envelope> {
            self.outbound
                .try_recv()
                .ok()
                .map(|bytes| Envelope::from_bytes(&bytes).unwrap())
        }
    }

    fn decision_for(proposal: &GroupingProposal, decision: &str) -> Envelope {
        Envelope::new(command::GROUPING).with_args([
            proposal.round_id.to_string(),
            proposal.ticket_id.to_string(),
            decision.to_string(),
        ])
    }

    async fn start(capacity: usize) -> Fixture {
        start_with(capacity, Duration::from_secs(30), ServerConfig::local(0)).await
    }

    async fn login_as(addr: SocketAddr, username: &str, password: &str) -> Result<Client> {
        let client = Client::new(ClientConfig::new(addr));
        client.connect(|_| {}).await?;
        let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel();
        let failure_tx = outcome_tx.clone();
        client
            .login(
                username,
                password,
                move || {
                    let _ = outcome_tx.send(Ok(()));
                },
                move |e| {
                    let _ = failure_tx.send(Err(e));
                },
            )
            .await?;
        outcome_rx
            .recv()
            .await
            .unwrap_or(Err(Error::ConnectionLost))?;
        Ok(client)
    }

    async fn proposal_for(client: &mut Client) -> (u64, GroupingProposal) {
        match wait_for(client, |e| matches!(e, ClientEvent::GroupingProposed { .. })).await {
            ClientEvent::GroupingProposed {
                correlation_id,
                proposal,
            } => (correlation_id, proposal),
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn test_server_start() {
        let fixture = start(1).await;
        assert!(fixture.server.addr().port() > 0);
        assert_eq!(fixture.server.session_count().await, 0);
        fixture.server.shutdown();
    }

    #[tokio::test]
    async fn test_wrong_password_rejected() {
        let fixture = start(1).await;
        let result = login_as(fixture.server.addr(), "alice", "wrong").await;
        assert!(matches!(
            result,
            Err(Error::Domain {
                kind: ErrorKind::NotAuthenticated,
                ..
            })
        ));
        assert_eq!(fixture.server.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_requests_require_login() {
        let fixture = start(1).await;
        let client = Client::new(ClientConfig::new(fixture.server.addr()));
        client.connect(|_| {}).await.unwrap();

        client.ping().await.unwrap();
        assert_eq!(client.event_details().await.unwrap().name, "Test Expo");
        assert!(matches!(
            client.view_tickets().await,
            Err(Error::Domain {
                kind: ErrorKind::NotAuthenticated,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_ticket_accepted_becomes_reservation() {
        let fixture = start(1).await;
        let mut client = login_as(fixture.server.addr(), "carol", PASSWORD)
            .await
            .unwrap();
        assert_eq!(client.session().username.as_deref(), Some("carol"));

        let info = client.add_ticket(fixture.room_id).await.unwrap();
        assert_eq!(info.position, 0);
        assert_eq!(info.grouping_response, GroupingResponse::Pending);

        let (correlation_id, proposal) = proposal_for(&mut client).await;
        assert_eq!(proposal.room_id, fixture.room_id);
        client
            .respond_grouping(correlation_id, &proposal, true)
            .await
            .unwrap();

        let granted = wait_for(&mut client, |e| matches!(e, ClientEvent::ReservationGranted(_))).await;
        let ClientEvent::ReservationGranted(reservation) = granted else {
            unreachable!()
        };
        assert_eq!(reservation.room_id, fixture.room_id);

        assert_eq!(client.view_reservations().await.unwrap().len(), 1);
        assert!(client.view_tickets().await.unwrap().is_empty());
        let update = client.update().await.unwrap();
        let sector = update.sectors.values().next().unwrap();
        assert_eq!(sector.rooms[&fixture.room_id].active_reservations, 1);

        client.check_in(reservation.id).await.unwrap();
        assert_eq!(
            client.group_info().await.unwrap().current_room,
            Some(fixture.room_id)
        );
        client.complete_reservation(reservation.id).await.unwrap();
        assert_eq!(client.group_info().await.unwrap().penalty_level, 0);
    }

    #[tokio::test]
    async fn test_decline_cancels_round() {
        let fixture = start(1).await;
        let mut client = login_as(fixture.server.addr(), "carol", PASSWORD)
            .await
            .unwrap();
        client.add_ticket(fixture.room_id).await.unwrap();

        let (correlation_id, proposal) = proposal_for(&mut client).await;
        client
            .respond_grouping(correlation_id, &proposal, false)
            .await
            .unwrap();

        let cancelled = wait_for(&mut client, |e| matches!(e, ClientEvent::GroupingCancelled(_))).await;
        let ClientEvent::GroupingCancelled(cancelled) = cancelled else {
            unreachable!()
        };
        assert_eq!(cancelled.round_id, proposal.round_id);
        assert!(client.view_reservations().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_shared_group_guides_both_asked() {
        let fixture = start(1).await;
        let addr = fixture.server.addr();
        let mut alice = login_as(addr, "alice", PASSWORD).await.unwrap();
        let mut bob = login_as(addr, "bob", PASSWORD).await.unwrap();

        let alice_group = alice.group_info().await.unwrap();
        let bob_group = bob.group_info().await.unwrap();
        assert_eq!(alice_group.id, bob_group.id);
        assert_eq!(bob_group.guides.len(), 2);

        // A third guide for the same group is refused
        assert!(login_as(addr, "eve", PASSWORD).await.is_err());

        alice.add_ticket(fixture.room_id).await.unwrap();
        proposal_for(&mut alice).await;
        let (correlation_id, proposal) = proposal_for(&mut bob).await;
        bob.respond_grouping(correlation_id, &proposal, true)
            .await
            .unwrap();

        wait_for(&mut alice, |e| matches!(e, ClientEvent::ReservationGranted(_))).await;
        wait_for(&mut bob, |e| matches!(e, ClientEvent::ReservationGranted(_))).await;
    }

    #[tokio::test]
    async fn test_duplicate_login_refused() {
        let fixture = start(1).await;
        let addr = fixture.server.addr();
        let _first = login_as(addr, "carol", PASSWORD).await.unwrap();
        assert!(login_as(addr, "carol", PASSWORD).await.is_err());
        assert_eq!(fixture.server.session_count().await, 1);
    }

    #[tokio::test]
    async fn test_disconnect_releases_group_and_reopens_round() {
        let fixture = start(1).await;
        let addr = fixture.server.addr();
        let carol = login_as(addr, "carol", PASSWORD).await.unwrap();
        let mut dave = login_as(addr, "dave", PASSWORD).await.unwrap();

        carol.add_ticket(fixture.room_id).await.unwrap();
        let info = dave.add_ticket(fixture.room_id).await.unwrap();
        assert_eq!(info.position, 1);
        assert_eq!(info.grouping_response, GroupingResponse::NoParticipation);

        carol.disconnect().await;
        let (_, proposal) = proposal_for(&mut dave).await;
        assert_eq!(proposal.room_id, fixture.room_id);
        assert_eq!(fixture.server.engine().group_count(), 1);
        assert_eq!(dave.view_tickets().await.unwrap()[0].position, 0);
    }

    #[tokio::test]
    async fn test_unanswered_round_expires() {
        let config = ServerConfig {
            sweep_interval: Duration::from_millis(50),
            ..ServerConfig::local(0)
        };
        let fixture = start_with(1, Duration::from_millis(100), config).await;
        let mut client = login_as(fixture.server.addr(), "carol", PASSWORD)
            .await
            .unwrap();
        client.add_ticket(fixture.room_id).await.unwrap();

        let (_, proposal) = proposal_for(&mut client).await;
        let cancelled = wait_for(&mut client, |e| matches!(e, ClientEvent::GroupingCancelled(_))).await;
        let ClientEvent::GroupingCancelled(cancelled) = cancelled else {
            unreachable!()
        };
        assert_eq!(cancelled.round_id, proposal.round_id);
    }

    #[tokio::test]
    async fn test_connections_past_limit_refused() {
        let config = ServerConfig {
            max_sessions: 1,
            ..ServerConfig::local(0)
        };
        let fixture = start_with(1, Duration::from_secs(30), config).await;
        let addr = fixture.server.addr();

        let _first = login_as(addr, "carol", PASSWORD).await.unwrap();
        let mut second = Client::new(ClientConfig::new(addr));
        second.connect(|_| {}).await.unwrap();

        let refused = wait_for(&mut second, |e| matches!(e, ClientEvent::Unhandled(_))).await;
        let ClientEvent::Unhandled(envelope) = refused else {
            unreachable!()
        };
        assert_eq!(envelope.command, command::CONNECT);
        assert!(!envelope.is_success());
        wait_for(&mut second, |e| matches!(e, ClientEvent::Disconnected)).await;
        assert_eq!(fixture.server.connection_count().await, 1);
    }

    #[tokio::test]
    async fn test_closed_rounds_release_their_proposals() {
        let mut d = Detached::new(1);
        let engine = d.engine();
        let mut proposal = d.first_proposal();

        for _ in 0..10 {
            d.session.on_command(SessionCommand::Propose(proposal));
            assert_eq!(d.session.dispatcher.pending_count(), 1);

            // Answered outside this session, as a co-guide would
            let effects = engine
                .respond_grouping(d.group_id, proposal.round_id, proposal.ticket_id, false)
                .unwrap();
            for notice in effects.notices {
                d.session.on_command(SessionCommand::Notify(notice));
            }
            assert_eq!(d.session.dispatcher.pending_count(), 0);
            proposal = effects.proposals[0];
        }
        assert!(d.session.proposals.is_empty());
    }

    #[tokio::test]
    async fn test_late_answer_is_refused() {
        let mut d = Detached::new(1);
        let engine = d.engine();
        let proposal = d.first_proposal();
        d.session.on_command(SessionCommand::Propose(proposal));
        let pushed = d.next_frame().unwrap();
        assert!(!pushed.is_reply());

        let effects = engine
            .respond_grouping(d.group_id, proposal.round_id, proposal.ticket_id, false)
            .unwrap();
        for notice in effects.notices {
            d.session.on_command(SessionCommand::Notify(notice));
        }
        while d.next_frame().is_some() {}

        let late = decision_for(&proposal, ARG_ACCEPT)
            .with_correlation(pushed.correlation_id)
            .as_reply();
        d.session.on_envelope(late).await;

        let refusal = d.next_frame().unwrap();
        assert_eq!(refusal.command, command::GROUPING);
        assert_eq!(refusal.correlation_id, pushed.correlation_id);
        assert!(!refusal.is_reply());
        assert!(matches!(
            refusal.payload,
            Payload::Failure {
                kind: ErrorKind::InvariantViolation,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_request_reusing_proposal_id_is_answered() {
        let mut d = Detached::new(1);
        let engine = d.engine();
        let proposal = d.first_proposal();
        d.session.on_command(SessionCommand::Propose(proposal));
        let pushed = d.next_frame().unwrap();

        // The peer mints its own ids; this one equals the pending proposal's
        let request = decision_for(&proposal, ARG_DECLINE).with_correlation(pushed.correlation_id);
        d.session.on_envelope(request).await;

        let reply = d.next_frame().unwrap();
        assert!(reply.is_reply());
        assert!(reply.is_success());
        assert_eq!(reply.correlation_id, pushed.correlation_id);
        assert!(!engine.is_round_open(d.room_id, proposal.round_id));
    }

    #[tokio::test]
    async fn test_proposal_for_closed_round_not_sent() {
        let mut d = Detached::new(1);
        let engine = d.engine();
        let stale = d.first_proposal();
        engine
            .respond_grouping(d.group_id, stale.round_id, stale.ticket_id, false)
            .unwrap();

        d.session.on_command(SessionCommand::Propose(stale));
        assert_eq!(d.session.dispatcher.pending_count(), 0);
        assert!(d.next_frame().is_none());
    }

    #[tokio::test]
    async fn test_accepted_answer_changed_by_request() {
        let fixture = start(2).await;
        let addr = fixture.server.addr();
        let mut carol = login_as(addr, "carol", PASSWORD).await.unwrap();
        let mut dave = login_as(addr, "dave", PASSWORD).await.unwrap();

        carol.add_ticket(fixture.room_id).await.unwrap();
        let (correlation_id, first) = proposal_for(&mut carol).await;
        dave.add_ticket(fixture.room_id).await.unwrap();

        // Declining puts carol behind dave; both are asked next
        carol
            .respond_grouping(correlation_id, &first, false)
            .await
            .unwrap();
        let second = wait_for(&mut carol, |e| {
            matches!(e, ClientEvent::GroupingProposed { proposal, .. } if proposal.round_id != first.round_id)
        })
        .await;
        let ClientEvent::GroupingProposed {
            correlation_id,
            proposal: second,
        } = second
        else {
            unreachable!()
        };
        proposal_for(&mut dave).await;

        carol
            .respond_grouping(correlation_id, &second, true)
            .await
            .unwrap();
        let tickets = carol.view_tickets().await.unwrap();
        assert_eq!(tickets[0].grouping_response, GroupingResponse::Accepted);

        carol
            .request(decision_for(&second, ARG_DECLINE))
            .await
            .unwrap();
        let cancelled = wait_for(&mut carol, |e| {
            matches!(e, ClientEvent::GroupingCancelled(p) if p.round_id == second.round_id)
        })
        .await;
        assert!(matches!(cancelled, ClientEvent::GroupingCancelled(_)));

        let again = carol.request(decision_for(&second, ARG_ACCEPT)).await;
        assert!(matches!(
            again,
            Err(Error::Domain {
                kind: ErrorKind::InvariantViolation,
                ..
            })
        ));
        assert!(carol.view_reservations().await.unwrap().is_empty());
    }
}
