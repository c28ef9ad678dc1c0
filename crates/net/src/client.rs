//! TCP client for talking to a Tourgate server
//!
//! One worker task owns the dispatcher and the connection. Every caller
//! operation and every inbound frame becomes a task on the worker's queue,
//! so they are handled strictly in order without shared mutation.
//!
//! State machine: `Disconnected -> Connecting -> Connected -> Disconnected`.
//! While disconnected only `connect` runs; other operations are held and
//! replayed in order once a connection is up.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use tourgate_core::{
    ErrorKind, EventInfoFixed, EventInfoUpdate, GroupInfo, GroupingProposal, QueueInfo,
    Reservation, RoomDetails,
};

use crate::channel::{ChannelEvent, ConnectionChannel};
use crate::dispatcher::{Dispatched, Dispatcher, PendingTask, Resolution};
use crate::error::{Error, Result};
use crate::protocol::{command, Envelope, Payload, ARG_ACCEPT, ARG_DECLINE};

/// Default bound on how long `connect` may take
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default capacity of the task, event and send queues
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Client tuning
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub addr: SocketAddr,
    pub connect_timeout: Duration,
    pub queue_capacity: usize,
}

impl ClientConfig {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Something the server told us without being asked
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Connected,
    /// Connection lost or closed
    Disconnected,
    /// The session context picked up a pushed snapshot
    SessionRefreshed,
    /// Reply with `respond_grouping` using this correlation id
    GroupingProposed {
        correlation_id: u64,
        proposal: GroupingProposal,
    },
    ReservationGranted(Reservation),
    GroupingCancelled(GroupingProposal),
    /// The server refused the answer sent under `correlation_id`
    GroupingRefused {
        correlation_id: u64,
        kind: ErrorKind,
        reason: String,
    },
    /// An inbound command with no handler
    Unhandled(Envelope),
}

/// What this client knows about its own session
#[derive(Debug, Clone, Default)]
pub struct SessionContext {
    pub username: Option<String>,
    pub event_fixed: Option<EventInfoFixed>,
    pub event_update: Option<EventInfoUpdate>,
    pub tickets: Vec<QueueInfo>,
}

type SuccessCallback = Box<dyn FnOnce() + Send>;
type FailureCallback = Box<dyn FnOnce(Error) + Send>;

/// Work for the client worker
enum Task {
    Connect { on_failure: FailureCallback },
    Disconnect,
    Channel(ChannelEvent),
    Local(LocalTask),
}

/// Work that needs a live connection
enum LocalTask {
    Login {
        username: String,
        password: String,
        on_success: SuccessCallback,
        on_failure: FailureCallback,
    },
    Request {
        envelope: Envelope,
        reply: oneshot::Sender<Result<Envelope>>,
    },
    Send {
        envelope: Envelope,
        result: oneshot::Sender<Result<()>>,
    },
}

impl LocalTask {
    fn fail(self, error: Error) {
        match self {
            LocalTask::Login { on_failure, .. } => on_failure(error),
            LocalTask::Request { reply, .. } => {
                let _ = reply.send(Err(error));
            }
            LocalTask::Send { envelope, result } => {
                debug!(command = %envelope.command, "Dropping unsent envelope");
                let _ = result.send(Err(error));
            }
        }
    }
}

impl From<ChannelEvent> for Task {
    fn from(event: ChannelEvent) -> Self {
        Task::Channel(event)
    }
}

struct ClientState {
    connection: ConnectionState,
    session: SessionContext,
}

fn read_state(state: &RwLock<ClientState>) -> RwLockReadGuard<'_, ClientState> {
    match state.read() {
        Ok(guard) => guard,
        Err(poisoned) => {
            error!("Client state lock poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

fn write_state(state: &RwLock<ClientState>) -> RwLockWriteGuard<'_, ClientState> {
    match state.write() {
        Ok(guard) => guard,
        Err(poisoned) => {
            error!("Client state lock poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

/// Client handle for network operations
pub struct Client {
    state: Arc<RwLock<ClientState>>,
    event_rx: mpsc::Receiver<ClientEvent>,
    task_tx: mpsc::Sender<Task>,
    worker: JoinHandle<()>,
}

impl Client {
    /// Create a disconnected client and spawn its worker
    pub fn new(config: ClientConfig) -> Self {
        let capacity = config.queue_capacity.max(1);
        let state = Arc::new(RwLock::new(ClientState {
            connection: ConnectionState::Disconnected,
            session: SessionContext::default(),
        }));

        let (event_tx, event_rx) = mpsc::channel(capacity);
        let (task_tx, task_rx) = mpsc::channel(capacity);

        let worker = Worker {
            config,
            state: state.clone(),
            events: event_tx,
            tasks: task_tx.clone(),
            dispatcher: Dispatcher::new(),
            channel: None,
            generation: 0,
            held: VecDeque::new(),
        };
        let worker = tokio::spawn(worker.run(task_rx));

        Client {
            state,
            event_rx,
            task_tx,
            worker,
        }
    }

    async fn submit(&self, task: Task) -> Result<()> {
        self.task_tx.send(task).await.map_err(|_| Error::NotConnected)
    }

    /// Open the connection. `on_failure` runs once if it cannot be opened;
    /// retrying is up to the caller.
    pub async fn connect<F>(&self, on_failure: F) -> Result<()>
    where
        F: FnOnce(Error) + Send + 'static,
    {
        self.submit(Task::Connect {
            on_failure: Box::new(on_failure),
        })
        .await
    }

    /// Log in; exactly one of the callbacks runs per attempt.
    ///
    /// Callbacks run on the client worker and must not block.
    pub async fn login<S, F>(
        &self,
        username: impl Into<String>,
        password: impl Into<String>,
        on_success: S,
        on_failure: F,
    ) -> Result<()>
    where
        S: FnOnce() + Send + 'static,
        F: FnOnce(Error) + Send + 'static,
    {
        self.submit(Task::Local(LocalTask::Login {
            username: username.into(),
            password: password.into(),
            on_success: Box::new(on_success),
            on_failure: Box::new(on_failure),
        }))
        .await
    }

    /// Send a request and wait for its reply; failure replies become errors
    pub async fn request(&self, envelope: Envelope) -> Result<Envelope> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.submit(Task::Local(LocalTask::Request {
            envelope,
            reply: reply_tx,
        }))
        .await?;
        let reply = reply_rx.await.map_err(|_| Error::ConnectionLost)??;
        reply.into_result()
    }

    /// Send without waiting for a reply. Resolves once the envelope is
    /// queued for writing; a full queue is `ResourceExhausted`.
    pub async fn send(&self, envelope: Envelope) -> Result<()> {
        let (result_tx, result_rx) = oneshot::channel();
        self.submit(Task::Local(LocalTask::Send {
            envelope,
            result: result_tx,
        }))
        .await?;
        result_rx.await.map_err(|_| Error::ConnectionLost)?
    }

    /// Answer a grouping proposal. With `correlation_id` 0 this changes an
    /// earlier answer while the round is still open; use `request` instead
    /// to get the server's verdict on such a change.
    pub async fn respond_grouping(
        &self,
        correlation_id: u64,
        proposal: &GroupingProposal,
        accept: bool,
    ) -> Result<()> {
        let decision = if accept { ARG_ACCEPT } else { ARG_DECLINE };
        let mut envelope = Envelope::new(command::GROUPING)
            .with_args([
                proposal.round_id.to_string(),
                proposal.ticket_id.to_string(),
                decision.to_string(),
            ])
            .with_correlation(correlation_id);
        if correlation_id != 0 {
            envelope = envelope.as_reply();
        }
        self.send(envelope).await
    }

    async fn call<I, S>(&self, command: &str, args: I) -> Result<Payload>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let reply = self.request(Envelope::new(command).with_args(args)).await?;
        Ok(reply.payload)
    }

    pub async fn ping(&self) -> Result<()> {
        self.call(command::PING, None::<String>).await.map(|_| ())
    }

    pub async fn event_details(&self) -> Result<EventInfoFixed> {
        match self.call(command::EVENT_DETAILS, None::<String>).await? {
            Payload::EventSnapshot(snapshot) => {
                write_state(&self.state).session.event_fixed = Some(snapshot.clone());
                Ok(snapshot)
            }
            _ => Err(unexpected(command::EVENT_DETAILS)),
        }
    }

    pub async fn update(&self) -> Result<EventInfoUpdate> {
        match self.call(command::UPDATE, None::<String>).await? {
            Payload::EventUpdate(update) => {
                write_state(&self.state).session.event_update = Some(update.clone());
                Ok(update)
            }
            _ => Err(unexpected(command::UPDATE)),
        }
    }

    pub async fn room_details(&self, room_id: Uuid) -> Result<RoomDetails> {
        match self.call(command::DETAILS, [room_id.to_string()]).await? {
            Payload::RoomDetails(details) => Ok(details),
            _ => Err(unexpected(command::DETAILS)),
        }
    }

    pub async fn view_tickets(&self) -> Result<Vec<QueueInfo>> {
        match self.call(command::VIEW_TICKETS, None::<String>).await? {
            Payload::Tickets(tickets) => {
                write_state(&self.state).session.tickets = tickets.clone();
                Ok(tickets)
            }
            _ => Err(unexpected(command::VIEW_TICKETS)),
        }
    }

    pub async fn view_reservations(&self) -> Result<Vec<Reservation>> {
        match self.call(command::VIEW_RESERVATIONS, None::<String>).await? {
            Payload::Reservations(reservations) => Ok(reservations),
            _ => Err(unexpected(command::VIEW_RESERVATIONS)),
        }
    }

    pub async fn add_ticket(&self, room_id: Uuid) -> Result<QueueInfo> {
        match self.call(command::ADD_TICKET, [room_id.to_string()]).await? {
            Payload::Ticket(info) => Ok(info),
            _ => Err(unexpected(command::ADD_TICKET)),
        }
    }

    pub async fn remove_ticket(&self, ticket_id: Uuid) -> Result<()> {
        self.call(command::REMOVE_TICKET, [ticket_id.to_string()])
            .await
            .map(|_| ())
    }

    pub async fn abandon_reservation(&self, reservation_id: Uuid) -> Result<()> {
        self.call(command::ABANDON_RESERVATION, [reservation_id.to_string()])
            .await
            .map(|_| ())
    }

    pub async fn complete_reservation(&self, reservation_id: Uuid) -> Result<()> {
        self.call(command::COMPLETE_RESERVATION, [reservation_id.to_string()])
            .await
            .map(|_| ())
    }

    pub async fn check_in(&self, reservation_id: Uuid) -> Result<()> {
        self.call(command::CHECK_IN, [reservation_id.to_string()])
            .await
            .map(|_| ())
    }

    pub async fn group_info(&self) -> Result<GroupInfo> {
        match self.call(command::GROUP_INFO, None::<String>).await? {
            Payload::Group(info) => Ok(info),
            _ => Err(unexpected(command::GROUP_INFO)),
        }
    }

    /// Close the connection; pending requests fail with `NotConnected`
    pub async fn disconnect(&self) {
        let _ = self.submit(Task::Disconnect).await;
    }

    /// Get current connection state
    pub fn connection_state(&self) -> ConnectionState {
        read_state(&self.state).connection
    }

    /// Snapshot of the session context
    pub fn session(&self) -> SessionContext {
        read_state(&self.state).session.clone()
    }

    /// Get the next unsolicited event
    pub async fn next_event(&mut self) -> Option<ClientEvent> {
        self.event_rx.recv().await
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

fn unexpected(command: &str) -> Error {
    Error::Protocol(format!("{}: unexpected reply payload", command))
}

/// The client worker: sole owner of the dispatcher and connection
struct Worker {
    config: ClientConfig,
    state: Arc<RwLock<ClientState>>,
    events: mpsc::Sender<ClientEvent>,
    tasks: mpsc::Sender<Task>,
    dispatcher: Dispatcher,
    channel: Option<ConnectionChannel>,
    generation: u64,
    held: VecDeque<LocalTask>,
}

impl Worker {
    async fn run(mut self, mut tasks: mpsc::Receiver<Task>) {
        while let Some(task) = tasks.recv().await {
            match task {
                Task::Connect { on_failure } => self.connect(on_failure).await,
                Task::Disconnect => self.disconnect(),
                Task::Channel(event) => self.on_channel_event(event),
                Task::Local(task) if self.channel.is_some() => self.run_local(task),
                Task::Local(task) => {
                    debug!(held = self.held.len() + 1, "Holding task until connected");
                    self.held.push_back(task);
                }
            }
        }
        debug!("Client worker stopped");
    }

    async fn connect(&mut self, on_failure: FailureCallback) {
        if self.channel.is_some() {
            debug!("Already connected");
            return;
        }
        let addr = self.config.addr;
        self.set_connection(ConnectionState::Connecting);
        info!(addr = %addr, "Connecting to server");

        let result =
            match tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => Ok(stream),
                Ok(Err(e)) => Err(Error::from(e)),
                Err(_) => Err(Error::Timeout),
            };

        match result {
            Ok(stream) => {
                self.generation += 1;
                let channel = ConnectionChannel::spawn(
                    stream,
                    self.generation,
                    self.config.queue_capacity,
                    self.tasks.clone(),
                );
                self.dispatcher.attach(channel.sender());
                self.channel = Some(channel);
                self.set_connection(ConnectionState::Connected);
                info!(addr = %addr, generation = self.generation, "Connected to server");
                self.emit(ClientEvent::Connected);

                let held = std::mem::take(&mut self.held);
                for task in held {
                    self.run_local(task);
                }
            }
            Err(e) => {
                self.set_connection(ConnectionState::Disconnected);
                warn!(addr = %addr, error = %e, "Connect failed");
                on_failure(e);
            }
        }
    }

    fn run_local(&mut self, task: LocalTask) {
        match task {
            LocalTask::Login {
                username,
                password,
                on_success,
                on_failure,
            } => {
                let envelope =
                    Envelope::new(command::LOGIN).with_args([username.clone(), password]);
                let task = LoginTask {
                    username,
                    state: self.state.clone(),
                    on_success: Some(on_success),
                    on_failure: Some(on_failure),
                };
                if let Err(e) = self.dispatcher.request(envelope, Box::new(task)) {
                    warn!(error = %e, "Login not sent");
                }
            }
            LocalTask::Request { envelope, reply } => {
                let command = envelope.command.clone();
                let task = RequestTask { reply: Some(reply) };
                if let Err(e) = self.dispatcher.request(envelope, Box::new(task)) {
                    warn!(command = %command, error = %e, "Request not sent");
                }
            }
            LocalTask::Send { envelope, result } => {
                let outcome = self.dispatcher.send(&envelope);
                if let Err(e) = &outcome {
                    warn!(command = %envelope.command, error = %e, "Send failed");
                }
                let _ = result.send(outcome);
            }
        }
    }

    fn on_channel_event(&mut self, event: ChannelEvent) {
        if self.channel.is_none() || event.generation() != self.generation {
            debug!(generation = event.generation(), "Ignoring event from stale connection");
            return;
        }
        match event {
            ChannelEvent::Message { envelope, .. } => match self.dispatcher.dispatch(envelope) {
                Dispatched::Resolved { .. } => {}
                Dispatched::Unmatched(envelope) => self.route(envelope),
            },
            ChannelEvent::Closed { error, .. } => self.connection_lost(error),
        }
    }

    /// Handle an inbound command nobody was waiting for
    fn route(&mut self, envelope: Envelope) {
        let event = match (envelope.command.as_str(), &envelope.payload) {
            (command::EVENT_DETAILS, Payload::EventSnapshot(snapshot)) => {
                write_state(&self.state).session.event_fixed = Some(snapshot.clone());
                Some(ClientEvent::SessionRefreshed)
            }
            (command::UPDATE, Payload::EventUpdate(update)) => {
                write_state(&self.state).session.event_update = Some(update.clone());
                Some(ClientEvent::SessionRefreshed)
            }
            (command::GROUPING, Payload::Proposal(proposal)) => {
                debug!(round_id = %proposal.round_id, room_id = %proposal.room_id, "Grouping proposed");
                Some(ClientEvent::GroupingProposed {
                    correlation_id: envelope.correlation_id,
                    proposal: *proposal,
                })
            }
            (command::RESERVATION_GRANTED, Payload::Reservation(reservation)) => {
                info!(room_id = %reservation.room_id, "Reservation granted");
                Some(ClientEvent::ReservationGranted(reservation.clone()))
            }
            (command::GROUPING_CANCELLED, Payload::Proposal(proposal)) => {
                Some(ClientEvent::GroupingCancelled(*proposal))
            }
            (command::GROUPING, Payload::Failure { kind, reason }) => {
                warn!(correlation_id = envelope.correlation_id, reason = %reason, "Grouping answer refused");
                Some(ClientEvent::GroupingRefused {
                    correlation_id: envelope.correlation_id,
                    kind: *kind,
                    reason: reason.clone(),
                })
            }
            _ => None,
        };

        let event = match event {
            Some(event) => event,
            None => {
                debug!(command = %envelope.command, "Unhandled command");
                ClientEvent::Unhandled(envelope)
            }
        };
        self.emit(event);
    }

    fn connection_lost(&mut self, error: Error) {
        warn!(error = %error, generation = self.generation, "Connection lost");
        if let Some(channel) = self.channel.take() {
            channel.close();
        }
        self.dispatcher.detach();
        self.set_connection(ConnectionState::Disconnected);
        self.dispatcher.fail_all(Error::ConnectionLost);
        self.emit(ClientEvent::Disconnected);
    }

    fn disconnect(&mut self) {
        match self.channel.take() {
            Some(channel) => {
                channel.close();
                self.dispatcher.detach();
                self.set_connection(ConnectionState::Disconnected);
                self.dispatcher.fail_all(Error::NotConnected);
                info!("Disconnected from server");
                self.emit(ClientEvent::Disconnected);
            }
            None => {
                for task in self.held.drain(..) {
                    task.fail(Error::NotConnected);
                }
            }
        }
    }

    fn set_connection(&self, connection: ConnectionState) {
        write_state(&self.state).connection = connection;
    }

    fn emit(&self, event: ClientEvent) {
        if let Err(e) = self.events.try_send(event) {
            warn!(error = %e, "Dropping client event");
        }
    }
}

/// Resolves a login attempt into exactly one callback
struct LoginTask {
    username: String,
    state: Arc<RwLock<ClientState>>,
    on_success: Option<SuccessCallback>,
    on_failure: Option<FailureCallback>,
}

impl PendingTask for LoginTask {
    fn on_reply(&mut self, reply: &Envelope) -> Resolution {
        if reply.is_success() {
            write_state(&self.state).session.username = Some(self.username.clone());
            info!(username = %self.username, "Logged in");
            self.on_failure = None;
            if let Some(on_success) = self.on_success.take() {
                on_success();
            }
        } else {
            let error = match &reply.payload {
                Payload::Failure { kind, reason } => Error::Domain {
                    kind: *kind,
                    reason: reason.clone(),
                },
                _ => Error::Rejected("login refused".into()),
            };
            warn!(username = %self.username, error = %error, "Login rejected");
            self.on_success = None;
            if let Some(on_failure) = self.on_failure.take() {
                on_failure(error);
            }
        }
        Resolution::Done
    }

    fn fail(mut self: Box<Self>, error: Error) {
        if let Some(on_failure) = self.on_failure.take() {
            on_failure(error);
        }
    }
}

/// Hands a reply to an awaiting `request` call
struct RequestTask {
    reply: Option<oneshot::Sender<Result<Envelope>>>,
}

impl PendingTask for RequestTask {
    fn on_reply(&mut self, reply: &Envelope) -> Resolution {
        if let Some(tx) = self.reply.take() {
            let _ = tx.send(Ok(reply.clone()));
        }
        Resolution::Done
    }

    fn fail(mut self: Box<Self>, error: Error) {
        if let Some(tx) = self.reply.take() {
            let _ = tx.send(Err(error));
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::frame::{read_frame, write_frame};

    pub async fn read_envelope(stream: &mut TcpStream) -> Envelope {
        let bytes = read_frame(stream).await.unwrap();
        Envelope::from_bytes(&bytes).unwrap()
    }

    pub async fn write_envelope(stream: &mut TcpStream, envelope: &Envelope) {
        write_frame(stream, &envelope.to_bytes().unwrap())
            .await
            .unwrap();
    }

    /// Skip events until one matches
    pub async fn wait_for<F>(client: &mut Client, pred: F) -> ClientEvent
    where
        F: Fn(&ClientEvent) -> bool,
    {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(10), client.next_event())
                .await
                .expect("timed out waiting for client event")
                .expect("client event stream ended");
            if pred(&event) {
                return event;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use std::collections::BTreeMap;
    use tokio::net::TcpListener;

    async fn listener() -> (TcpListener, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, addr)
    }

    #[tokio::test]
    async fn test_wrong_login_invokes_failure_once() {
        let (listener, addr) = listener().await;
        let peer = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let login = read_envelope(&mut stream).await;
            assert_eq!(login.command, command::LOGIN);
            assert_eq!(login.args, vec!["alice".to_string(), "wrong".to_string()]);

            let reply = login.failure(ErrorKind::NotAuthenticated, "invalid password");
            write_envelope(&mut stream, &reply).await;
            // Forced duplicate reply
            write_envelope(&mut stream, &reply).await;
            stream
        });

        let mut client = Client::new(ClientConfig::new(addr));
        let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel();
        let success_tx = outcome_tx.clone();
        client.connect(|_| {}).await.unwrap();
        client
            .login(
                "alice",
                "wrong",
                move || {
                    let _ = success_tx.send("success");
                },
                move |_| {
                    let _ = outcome_tx.send("failure");
                },
            )
            .await
            .unwrap();

        assert_eq!(outcome_rx.recv().await, Some("failure"));
        // The duplicate is routed as an unmatched command
        wait_for(&mut client, |e| matches!(e, ClientEvent::Unhandled(_))).await;
        assert!(outcome_rx.try_recv().is_err());
        assert_eq!(client.session().username, None);
        drop(peer.await.unwrap());
    }

    #[tokio::test]
    async fn test_connection_lost_fails_pending_requests() {
        let (listener, addr) = listener().await;
        let peer = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            read_envelope(&mut stream).await;
            read_envelope(&mut stream).await;
            // Hang up without replying
        });

        let mut client = Client::new(ClientConfig::new(addr));
        client.connect(|_| {}).await.unwrap();
        let (first, second) = tokio::join!(
            client.request(Envelope::new(command::UPDATE)),
            client.request(Envelope::new(command::VIEW_TICKETS)),
        );

        assert!(matches!(first, Err(Error::ConnectionLost)));
        assert!(matches!(second, Err(Error::ConnectionLost)));
        assert_eq!(client.connection_state(), ConnectionState::Disconnected);
        wait_for(&mut client, |e| matches!(e, ClientEvent::Disconnected)).await;
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_failure_reported_once() {
        let (listener, addr) = listener().await;
        drop(listener);

        let client = Client::new(ClientConfig::new(addr));
        let (failure_tx, mut failure_rx) = mpsc::unbounded_channel();
        client
            .connect(move |e| {
                let _ = failure_tx.send(e);
            })
            .await
            .unwrap();

        let error = failure_rx.recv().await.unwrap();
        assert!(matches!(error, Error::Io(_) | Error::Timeout));
        // Callback consumed, sender dropped
        assert!(failure_rx.recv().await.is_none());
        assert_eq!(client.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_tasks_held_until_connected() {
        let (listener, addr) = listener().await;
        let peer = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            read_envelope(&mut stream).await
        });

        let client = Client::new(ClientConfig::new(addr));
        let (sent, connected) = tokio::join!(client.send(Envelope::new(command::PING)), async {
            assert_eq!(client.connection_state(), ConnectionState::Disconnected);
            client.connect(|_| {}).await
        });
        connected.unwrap();
        sent.unwrap();
        let first = peer.await.unwrap();
        assert_eq!(first.command, command::PING);
    }

    #[tokio::test]
    async fn test_send_reports_full_queue() {
        let (listener, addr) = listener().await;
        let peer = tokio::spawn(async move {
            // Accept and never read
            let (stream, _) = listener.accept().await.unwrap();
            stream
        });

        let mut config = ClientConfig::new(addr);
        config.queue_capacity = 1;
        let client = Client::new(config);
        client.connect(|_| {}).await.unwrap();
        let _stream = peer.await.unwrap();

        let bulk = "x".repeat(512 * 1024);
        let mut outcome = Ok(());
        for _ in 0..512 {
            outcome = client
                .send(Envelope::new(command::PING).with_args([bulk.clone()]))
                .await;
            if outcome.is_err() {
                break;
            }
        }
        assert!(matches!(outcome, Err(Error::ResourceExhausted)));
    }

    #[tokio::test]
    async fn test_grouping_proposal_round_trip() {
        let (listener, addr) = listener().await;
        let proposal = GroupingProposal {
            round_id: Uuid::new_v4(),
            room_id: Uuid::new_v4(),
            ticket_id: Uuid::new_v4(),
            group_id: Uuid::new_v4(),
        };
        let peer = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let push = Envelope::new(command::GROUPING)
                .with_payload(Payload::Proposal(proposal))
                .with_correlation(9);
            write_envelope(&mut stream, &push).await;
            read_envelope(&mut stream).await
        });

        let mut client = Client::new(ClientConfig::new(addr));
        client.connect(|_| {}).await.unwrap();
        let event = wait_for(&mut client, |e| {
            matches!(e, ClientEvent::GroupingProposed { .. })
        })
        .await;
        let ClientEvent::GroupingProposed {
            correlation_id,
            proposal: received,
        } = event
        else {
            panic!("Expected proposal");
        };
        assert_eq!(received, proposal);
        client
            .respond_grouping(correlation_id, &received, true)
            .await
            .unwrap();

        let answer = peer.await.unwrap();
        assert_eq!(answer.correlation_id, 9);
        assert!(answer.is_reply());
        assert_eq!(
            answer.args,
            vec![
                proposal.round_id.to_string(),
                proposal.ticket_id.to_string(),
                ARG_ACCEPT.to_string()
            ]
        );
    }

    #[tokio::test]
    async fn test_refused_answer_reported() {
        let (listener, addr) = listener().await;
        let peer = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let refusal = Envelope::new(command::GROUPING)
                .with_args([crate::protocol::ARG_FALSE])
                .with_payload(Payload::Failure {
                    kind: ErrorKind::InvariantViolation,
                    reason: "round closed".into(),
                })
                .with_correlation(9);
            write_envelope(&mut stream, &refusal).await;
            stream
        });

        let mut client = Client::new(ClientConfig::new(addr));
        client.connect(|_| {}).await.unwrap();
        let _stream = peer.await.unwrap();
        let event = wait_for(&mut client, |e| matches!(e, ClientEvent::GroupingRefused { .. })).await;
        let ClientEvent::GroupingRefused {
            correlation_id,
            kind,
            reason,
        } = event
        else {
            panic!("Expected refusal");
        };
        assert_eq!(correlation_id, 9);
        assert_eq!(kind, ErrorKind::InvariantViolation);
        assert_eq!(reason, "round closed");
    }

    #[tokio::test]
    async fn test_event_details_refreshes_session() {
        let (listener, addr) = listener().await;
        let peer = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let request = read_envelope(&mut stream).await;
            let snapshot = EventInfoFixed {
                name: "Science Fair".into(),
                sectors: BTreeMap::new(),
            };
            write_envelope(&mut stream, &request.success(Payload::EventSnapshot(snapshot))).await;
            stream
        });

        let client = Client::new(ClientConfig::new(addr));
        client.connect(|_| {}).await.unwrap();
        let snapshot = client.event_details().await.unwrap();
        assert_eq!(snapshot.name, "Science Fair");
        assert_eq!(
            client.session().event_fixed.map(|e| e.name),
            Some("Science Fair".to_string())
        );
        drop(peer.await.unwrap());
    }
}
