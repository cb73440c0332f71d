//! The per-connection engine task.
//!
//! One task owns the link, the live session and every registry. It takes one
//! input at a time: a caller command, an inbound link event, or a timer
//! firing (timers are commands the engine sends itself). Each state has its
//! own transition function; [`Engine::step`] moves the state out, hands it to
//! that function and stores whatever comes back.
//!
//! The engine only holds a weak sender to its own command channel, so it
//! shuts down once every caller handle is gone.

use std::mem;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use super::client::{
    CallResult, Closed, ConnectionInfo, Disconnected, Publication, Session, SessionInfo,
    Unregistered, Unsubscribed,
};
use super::handler::{
    Event, EventHandler, EventLane, Invocation, InvocationError, InvocationHandler,
    InvocationLane, InvocationOutcome, YieldSink,
};
use super::pending::{Lookup, PendingRequestTable, RequestKind};
use super::reconnect::{ReconnectionSupervisor, Retry};
use super::registry::{ListenerId, RegistrationRegistry, SubscriptionRegistry};
use super::state::{
    Closing, ConnectWaiter, Connected, Connecting, ConnectionEvent, LiveSession, Open, Opening,
    Pending, Phase, State, Timer,
};
use crate::config::ClientConfig;
use crate::error::{CancelReason, Result, WampError};
use crate::protocol::{reasons, ClientRoles, Dict, Id, IdGenerator, Message, MessageKind, Payload};
use crate::transport::{Connector, Link, LinkEvent};

/// Buffered connection events per receiver
const EVENT_CAPACITY: usize = 64;

/// Subscribe acknowledgment as seen by the engine
#[derive(Debug)]
pub(crate) struct SubscribeAck {
    pub(crate) subscription: Id,
    pub(crate) listener: ListenerId,
}

/// Register acknowledgment as seen by the engine
#[derive(Debug)]
pub(crate) struct RegisterAck {
    pub(crate) registration: Id,
}

type Reply<T> = oneshot::Sender<Result<T>>;

/// Everything the engine can be asked to do.
pub(crate) enum Command {
    Connect {
        reply: ConnectWaiter,
    },
    Open {
        realm: String,
        details: Dict,
        reply: Reply<Session>,
    },
    Publish {
        epoch: u64,
        topic: String,
        options: Dict,
        payload: Payload,
        acknowledge: bool,
        reply: Reply<Option<Publication>>,
    },
    Subscribe {
        epoch: u64,
        topic: String,
        options: Dict,
        handler: EventHandler,
        reply: Reply<SubscribeAck>,
    },
    Unsubscribe {
        epoch: u64,
        subscription: Id,
        listener: ListenerId,
        reply: Reply<Unsubscribed>,
    },
    Call {
        epoch: u64,
        procedure: String,
        options: Dict,
        payload: Payload,
        timeout: Option<Duration>,
        reply: Reply<CallResult>,
    },
    Register {
        epoch: u64,
        procedure: String,
        options: Dict,
        handler: InvocationHandler,
        concurrency: usize,
        reply: Reply<RegisterAck>,
    },
    Unregister {
        epoch: u64,
        registration: Id,
        reply: Reply<Unregistered>,
    },
    Close {
        epoch: u64,
        reason: String,
        reply: Reply<Closed>,
    },
    Disconnect {
        reply: Reply<Disconnected>,
    },
    // engine-internal
    Attempted {
        epoch: u64,
        result: Result<Link>,
    },
    RetryDue {
        epoch: u64,
    },
    RequestTimedOut {
        epoch: u64,
        request: Id,
    },
    CloseTimedOut {
        epoch: u64,
    },
    Yield {
        epoch: u64,
        request: Id,
        outcome: InvocationOutcome,
    },
}

impl Command {
    /// Session epoch of a caller command issued through a `Session` handle
    fn session_epoch(&self) -> Option<u64> {
        match self {
            Self::Publish { epoch, .. }
            | Self::Subscribe { epoch, .. }
            | Self::Unsubscribe { epoch, .. }
            | Self::Call { epoch, .. }
            | Self::Register { epoch, .. }
            | Self::Unregister { epoch, .. }
            | Self::Close { epoch, .. } => Some(*epoch),
            _ => None,
        }
    }

    /// Answer the command's caller with `err`
    fn refuse(self, err: WampError) {
        match self {
            Self::Connect { reply } => answer(reply, err),
            Self::Open { reply, .. } => answer(reply, err),
            Self::Publish { reply, .. } => answer(reply, err),
            Self::Subscribe { reply, .. } => answer(reply, err),
            Self::Unsubscribe { reply, .. } => answer(reply, err),
            Self::Call { reply, .. } => answer(reply, err),
            Self::Register { reply, .. } => answer(reply, err),
            Self::Unregister { reply, .. } => answer(reply, err),
            Self::Close { reply, .. } => answer(reply, err),
            Self::Disconnect { reply } => answer(reply, err),
            Self::Attempted { .. }
            | Self::RetryDue { .. }
            | Self::RequestTimedOut { .. }
            | Self::CloseTimedOut { .. }
            | Self::Yield { .. } => {},
        }
    }
}

/// Continuation of a correlated request, typed per kind.
pub(crate) enum Resolver {
    Subscribe {
        topic: String,
        handler: EventHandler,
        reply: Reply<SubscribeAck>,
    },
    Unsubscribe {
        subscription: Id,
        reply: Reply<Unsubscribed>,
    },
    Publish {
        reply: Reply<Option<Publication>>,
    },
    Register {
        procedure: String,
        handler: InvocationHandler,
        concurrency: usize,
        reply: Reply<RegisterAck>,
    },
    Unregister {
        registration: Id,
        reply: Reply<Unregistered>,
    },
    Call {
        reply: Reply<CallResult>,
    },
}

impl Resolver {
    fn fail(self, err: WampError) {
        match self {
            Self::Subscribe { reply, .. } => answer(reply, err),
            Self::Unsubscribe { reply, .. } => answer(reply, err),
            Self::Publish { reply } => answer(reply, err),
            Self::Register { reply, .. } => answer(reply, err),
            Self::Unregister { reply, .. } => answer(reply, err),
            Self::Call { reply } => answer(reply, err),
        }
    }
}

enum Input {
    Command(Command),
    Link(LinkEvent),
}

/// Caller-side ends of a spawned engine.
pub(crate) struct EngineHandle {
    pub(crate) commands: mpsc::UnboundedSender<Command>,
    pub(crate) phase: watch::Receiver<Phase>,
    pub(crate) events: broadcast::Sender<ConnectionEvent>,
}

pub(crate) struct Engine {
    config: Arc<ClientConfig>,
    info: ConnectionInfo,
    connector: Arc<dyn Connector>,
    roles: ClientRoles,
    commands: mpsc::UnboundedReceiver<Command>,
    handle: mpsc::WeakUnboundedSender<Command>,
    phase: watch::Sender<Phase>,
    events: broadcast::Sender<ConnectionEvent>,
    state: State,
    supervisor: ReconnectionSupervisor,
    /// Bumped for every connection attempt, retry and session
    epoch: u64,
    next_listener: ListenerId,
    /// Realm and details of the last session opened, for automatic re-open
    reopen: Option<(String, Dict)>,
    /// Epoch of the last session that ended, and why
    ended: (u64, CancelReason),
}

impl Engine {
    pub(crate) fn spawn(
        config: Arc<ClientConfig>,
        info: ConnectionInfo,
        connector: Arc<dyn Connector>,
    ) -> EngineHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let (phase_tx, phase_rx) = watch::channel(Phase::Idle);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let supervisor = ReconnectionSupervisor::new(config.reconnect.clone());

        let engine = Self {
            config,
            info,
            connector,
            roles: ClientRoles::default(),
            commands: rx,
            handle: tx.downgrade(),
            phase: phase_tx,
            events: events.clone(),
            state: State::Idle,
            supervisor,
            epoch: 0,
            next_listener: 0,
            reopen: None,
            ended: (0, CancelReason::SessionLost),
        };
        tokio::spawn(engine.run());

        EngineHandle {
            commands: tx,
            phase: phase_rx,
            events,
        }
    }

    async fn run(mut self) {
        tracing::debug!("Engine started for {}", self.info.endpoint);
        loop {
            let input = match self.state.link_mut() {
                Some(link) => tokio::select! {
                    command = self.commands.recv() => command.map(Input::Command),
                    event = link.recv() => Some(Input::Link(event)),
                },
                None => self.commands.recv().await.map(Input::Command),
            };
            match input {
                Some(input) => self.step(input),
                None => break,
            }
        }
        self.shutdown();
        tracing::debug!("Engine for {} stopped", self.info.endpoint);
    }

    fn step(&mut self, input: Input) {
        let state = mem::replace(&mut self.state, State::Closed);
        self.state = match state {
            State::Idle => self.idle(input),
            State::Connecting(c) => self.connecting(c, input),
            State::Connected(c) => self.connected(c, input),
            State::Open(o) => self.open(o, input),
            State::Closing(c) => self.closing(c, input),
            State::Closed => self.closed(input),
        };
        let phase = self.state.phase();
        self.phase.send_if_modified(|current| {
            let changed = *current != phase;
            *current = phase;
            changed
        });
    }

    // ---------------------------------------------------------------------
    // States without a link
    // ---------------------------------------------------------------------

    fn idle(&mut self, input: Input) -> State {
        match input {
            Input::Command(Command::Connect { reply }) => self.begin_cycle(vec![reply], false),
            Input::Command(Command::Disconnect { reply }) => {
                let _ = reply.send(Ok(Disconnected));
                State::Closed
            },
            Input::Command(other) => {
                self.stray(other);
                State::Idle
            },
            Input::Link(_) => State::Idle,
        }
    }

    fn closed(&mut self, input: Input) -> State {
        match input {
            Input::Command(Command::Connect { reply }) => self.begin_cycle(vec![reply], false),
            Input::Command(Command::Disconnect { reply }) => {
                let _ = reply.send(Ok(Disconnected));
                State::Closed
            },
            Input::Command(other) => {
                self.stray(other);
                State::Closed
            },
            Input::Link(_) => State::Closed,
        }
    }

    fn connecting(&mut self, mut c: Connecting, input: Input) -> State {
        let Input::Command(command) = input else {
            return State::Connecting(c);
        };
        match command {
            Command::Connect { reply } => {
                c.waiters.push(reply);
                State::Connecting(c)
            },
            Command::Attempted { epoch, result } if epoch == c.epoch => match result {
                Ok(link) => self.on_connected(link, c.waiters, c.automatic),
                Err(err) => self.on_attempt_failed(c.waiters, c.automatic, &err),
            },
            Command::RetryDue { epoch } if epoch == c.epoch => self.attempt(c.waiters, c.automatic),
            Command::Disconnect { reply } => {
                tracing::info!("Connection to {} cancelled by disconnect", self.info.endpoint);
                for waiter in c.waiters {
                    let _ = waiter.send(Err(WampError::Cancelled(CancelReason::Disconnected)));
                }
                self.disconnected(reply)
            },
            other => {
                self.stray(other);
                State::Connecting(c)
            },
        }
    }

    // ---------------------------------------------------------------------
    // Connection cycle
    // ---------------------------------------------------------------------

    fn begin_cycle(&mut self, waiters: Vec<ConnectWaiter>, automatic: bool) -> State {
        self.supervisor.reset();
        self.attempt(waiters, automatic)
    }

    fn attempt(&mut self, waiters: Vec<ConnectWaiter>, automatic: bool) -> State {
        if !self.supervisor.begin_attempt() {
            return self.give_up(waiters, "no connection attempts allowed");
        }
        self.epoch += 1;
        let epoch = self.epoch;
        tracing::info!(
            "Connecting to {} via {} (attempt {}/{})",
            self.info.endpoint,
            self.connector.name(),
            self.supervisor.attempts(),
            self.supervisor.policy().max_attempts
        );

        let connector = Arc::clone(&self.connector);
        let endpoint = self.info.endpoint.clone();
        let format = self.info.format;
        let limit = self.config.connect_timeout();
        let handle = self.handle.clone();
        let task = tokio::spawn(async move {
            let result = match tokio::time::timeout(limit, connector.open(&endpoint, format)).await {
                Ok(result) => result,
                Err(_) => Err(WampError::TransportFailure(format!(
                    "connecting to {} timed out after {} ms",
                    endpoint,
                    limit.as_millis()
                ))),
            };
            if let Some(tx) = handle.upgrade() {
                let _ = tx.send(Command::Attempted { epoch, result });
            }
        });

        State::Connecting(Connecting {
            epoch,
            waiters,
            _timer: Timer::new(task),
            automatic,
        })
    }

    fn on_connected(&mut self, link: Link, waiters: Vec<ConnectWaiter>, automatic: bool) -> State {
        tracing::info!(
            "Connected to {} after {} attempt(s)",
            self.info.endpoint,
            self.supervisor.attempts()
        );
        self.supervisor.reset();
        self.emit(ConnectionEvent::Connected);
        for waiter in waiters {
            let _ = waiter.send(Ok(self.info.clone()));
        }

        let mut connected = Connected {
            link,
            opening: None,
        };
        if automatic {
            if let Some((realm, details)) = self.reopen.clone() {
                tracing::info!("Re-opening session on realm '{}'", realm);
                self.send_hello(&mut connected, realm, details, None);
            }
        }
        State::Connected(connected)
    }

    fn on_attempt_failed(&mut self, waiters: Vec<ConnectWaiter>, automatic: bool, err: &WampError) -> State {
        tracing::warn!(
            "Connection attempt {} to {} failed: {}",
            self.supervisor.attempts(),
            self.info.endpoint,
            err
        );
        if !err.is_transient() {
            return self.give_up(waiters, &err.to_string());
        }
        match self.supervisor.on_failure() {
            Retry::After(delay) => {
                let attempt = self.supervisor.attempts() + 1;
                self.schedule_retry(waiters, automatic, attempt, delay)
            },
            Retry::GiveUp => self.give_up(waiters, &err.to_string()),
        }
    }

    fn schedule_retry(
        &mut self,
        waiters: Vec<ConnectWaiter>,
        automatic: bool,
        attempt: u32,
        delay: Duration,
    ) -> State {
        self.epoch += 1;
        let epoch = self.epoch;
        tracing::debug!("Attempt {} to {} in {:?}", attempt, self.info.endpoint, delay);
        self.emit(ConnectionEvent::Reconnecting { attempt, delay });
        State::Connecting(Connecting {
            epoch,
            waiters,
            _timer: self.schedule(delay, Command::RetryDue { epoch }),
            automatic,
        })
    }

    fn give_up(&mut self, waiters: Vec<ConnectWaiter>, reason: &str) -> State {
        let attempts = self.supervisor.attempts();
        tracing::error!(
            "Giving up on {} after {} attempt(s): {}",
            self.info.endpoint,
            attempts,
            reason
        );
        for waiter in waiters {
            let _ = waiter.send(Err(WampError::TransportFailure(format!(
                "{reason} (after {attempts} attempts)"
            ))));
        }
        self.emit(ConnectionEvent::GaveUp { attempts });
        State::Closed
    }

    /// Where to go once the link of a live or pending session is gone
    fn after_loss(&mut self, reconnect: bool) -> State {
        if !reconnect {
            return State::Idle;
        }
        self.supervisor.reset();
        if !self.supervisor.can_attempt() {
            return self.give_up(Vec::new(), "reconnection disabled by max_attempts = 0");
        }
        let delay = self.supervisor.policy().delay.delay_for(1);
        self.schedule_retry(Vec::new(), true, 1, delay)
    }

    // ---------------------------------------------------------------------
    // Handshake
    // ---------------------------------------------------------------------

    fn send_hello(
        &self,
        connected: &mut Connected,
        realm: String,
        details: Dict,
        reply: Option<Reply<Session>>,
    ) {
        let hello = Message::Hello {
            realm: realm.clone(),
            details: self.roles.hello_details(&self.config.agent, &details),
        };
        if let Err(err) = connected.link.send(hello) {
            if let Some(reply) = reply {
                let _ = reply.send(Err(err));
            }
            return;
        }
        tracing::debug!("HELLO sent for realm '{}'", realm);
        connected.opening = Some(Opening {
            realm,
            details,
            reply,
        });
    }

    fn connected(&mut self, mut c: Connected, input: Input) -> State {
        match input {
            Input::Command(Command::Open {
                realm,
                details,
                reply,
            }) => {
                if c.opening.is_some() {
                    let _ = reply.send(Err(WampError::InvalidState(
                        "a session handshake is already in progress".to_string(),
                    )));
                } else {
                    self.send_hello(&mut c, realm, details, Some(reply));
                }
                State::Connected(c)
            },
            Input::Command(Command::Disconnect { reply }) => {
                if let Some(Opening {
                    reply: Some(opener),
                    ..
                }) = c.opening.take()
                {
                    let _ = opener.send(Err(WampError::Cancelled(CancelReason::Disconnected)));
                }
                self.disconnected(reply)
            },
            Input::Command(other) => {
                self.stray(other);
                State::Connected(c)
            },
            Input::Link(LinkEvent::Message(Message::Welcome { session, details })) => {
                match c.opening.take() {
                    Some(opening) => self.on_welcome(c.link, opening, session, details),
                    None => {
                        self.anomaly(&format!("WELCOME for session {session} without HELLO"));
                        State::Connected(c)
                    },
                }
            },
            Input::Link(LinkEvent::Message(Message::Abort { details, reason })) => {
                tracing::warn!("Router rejected the session: {}", reason);
                self.phase.send_replace(Phase::Aborted);
                self.emit(ConnectionEvent::SessionAborted {
                    reason: reason.clone(),
                });
                if let Some(Opening {
                    reply: Some(opener),
                    ..
                }) = c.opening.take()
                {
                    let _ = opener.send(Err(WampError::HandshakeRejected { reason, details }));
                }
                drop(c.link);
                if self.config.reconnect.reconnect_on_abort {
                    self.after_loss(true)
                } else {
                    State::Closed
                }
            },
            Input::Link(LinkEvent::Message(other)) => {
                self.anomaly(&format!("{} received before the session opened", other.kind()));
                State::Connected(c)
            },
            Input::Link(event) => {
                let reason = loss_reason(event);
                tracing::warn!("Link to {} lost before a session opened: {}", self.info.endpoint, reason);
                if let Some(Opening {
                    reply: Some(opener),
                    ..
                }) = c.opening.take()
                {
                    let _ = opener.send(Err(WampError::TransportFailure(format!(
                        "link lost during handshake: {reason}"
                    ))));
                }
                self.emit(ConnectionEvent::Disconnected { reason });
                self.after_loss(self.config.reconnect.reconnect_on_loss)
            },
        }
    }

    fn on_welcome(&mut self, link: Link, opening: Opening, id: Id, details: Dict) -> State {
        self.epoch += 1;
        let epoch = self.epoch;
        let info = Arc::new(SessionInfo {
            id,
            realm: opening.realm.clone(),
            details,
        });
        tracing::info!("Session {} open on realm '{}'", id, info.realm);

        let handle = self.session_handle(&info, epoch);
        if let Some(reply) = opening.reply {
            let opened = handle
                .clone()
                .ok_or(WampError::Cancelled(CancelReason::Shutdown));
            let _ = reply.send(opened);
        }
        if let Some(session) = handle {
            self.emit(ConnectionEvent::SessionOpened(session));
        }
        self.reopen = Some((opening.realm, opening.details));

        State::Open(Open {
            link,
            session: LiveSession {
                info,
                epoch,
                ids: IdGenerator::new(),
                pending: PendingRequestTable::new(),
                subscriptions: SubscriptionRegistry::default(),
                registrations: RegistrationRegistry::default(),
            },
        })
    }

    // ---------------------------------------------------------------------
    // Open session
    // ---------------------------------------------------------------------

    fn open(&mut self, o: Open, input: Input) -> State {
        match input {
            Input::Command(command) => self.open_command(o, command),
            Input::Link(LinkEvent::Message(message)) => self.open_message(o, message),
            Input::Link(event) => {
                let reason = loss_reason(event);
                tracing::warn!(
                    "Link to {} lost during session {}: {}",
                    self.info.endpoint,
                    o.session.info.id,
                    reason
                );
                self.end_session(o.session, CancelReason::SessionLost);
                self.emit(ConnectionEvent::Disconnected { reason });
                self.after_loss(self.config.reconnect.reconnect_on_loss)
            },
        }
    }

    fn open_command(&mut self, mut o: Open, command: Command) -> State {
        match command {
            Command::Disconnect { reply } => {
                // best effort: queued before the link is dropped
                let _ = o.link.send(Message::goodbye(reasons::SYSTEM_SHUTDOWN));
                self.end_session(o.session, CancelReason::Disconnected);
                return self.disconnected(reply);
            },
            Command::Yield {
                epoch,
                request,
                outcome,
            } => {
                if epoch == o.session.epoch {
                    if let Err(err) = o.link.send(yield_message(request, outcome)) {
                        tracing::warn!("Outcome of invocation {} not sendable: {}", request, err);
                        let fallback = Message::error(
                            MessageKind::Invocation,
                            request,
                            reasons::RUNTIME_ERROR,
                            Payload::with_args([err.to_string()]),
                        );
                        if let Err(err) = o.link.send(fallback) {
                            tracing::warn!("Invocation {} left unanswered: {}", request, err);
                        }
                    }
                } else {
                    tracing::debug!("Dropping outcome of invocation {} from an ended session", request);
                }
            },
            Command::RequestTimedOut { epoch, request } => {
                if epoch == o.session.epoch {
                    if let Some((kind, pending)) = o.session.pending.remove(request) {
                        tracing::warn!("{} request {} timed out", kind, request);
                        fail_request(
                            &mut o.session,
                            pending.resolver,
                            WampError::Cancelled(CancelReason::Timeout),
                        );
                    }
                }
            },
            stale if stale.session_epoch().is_some_and(|e| e != o.session.epoch) => {
                self.stray(stale);
            },
            Command::Close { reason, reply, .. } => {
                tracing::info!("Closing session {}: {}", o.session.info.id, reason);
                if let Err(err @ WampError::InvalidMessage(_)) = o.link.send(Message::goodbye(&reason)) {
                    let _ = reply.send(Err(err));
                    return State::Open(o);
                }
                self.end_session(o.session, CancelReason::SessionClosed);
                self.emit(ConnectionEvent::SessionClosed {
                    reason: reason.clone(),
                    by_peer: false,
                });
                self.epoch += 1;
                let epoch = self.epoch;
                let timer = self.schedule(self.config.close_timeout(), Command::CloseTimedOut { epoch });
                return State::Closing(Closing {
                    link: o.link,
                    epoch,
                    reason,
                    reply,
                    _timer: timer,
                });
            },
            Command::Publish {
                topic,
                options,
                payload,
                acknowledge,
                reply,
                ..
            } => {
                if acknowledge {
                    let timeout = self.config.request_timeout();
                    self.request(&mut o, RequestKind::Publish, Resolver::Publish { reply }, timeout, |request| {
                        Message::Publish {
                            request,
                            options,
                            topic,
                            payload,
                        }
                    });
                } else {
                    let request = o.session.ids.next();
                    let sent = o.link.send(Message::Publish {
                        request,
                        options,
                        topic,
                        payload,
                    });
                    let _ = reply.send(sent.map(|()| None));
                }
            },
            Command::Subscribe {
                topic,
                options,
                handler,
                reply,
                ..
            } => {
                let resolver = Resolver::Subscribe {
                    topic: topic.clone(),
                    handler,
                    reply,
                };
                let timeout = self.config.request_timeout();
                self.request(&mut o, RequestKind::Subscribe, resolver, timeout, |request| {
                    Message::Subscribe {
                        request,
                        options,
                        topic,
                    }
                });
            },
            Command::Unsubscribe {
                subscription,
                listener,
                reply,
                ..
            } => {
                let subscriptions = &mut o.session.subscriptions;
                if !subscriptions.has_listener(subscription, listener) {
                    let _ = reply.send(Err(WampError::InvalidState(format!(
                        "subscription {subscription} has no listener {listener}"
                    ))));
                } else if subscriptions.is_unsubscribing(subscription) {
                    let _ = reply.send(Err(WampError::InvalidState(format!(
                        "subscription {subscription} is already being unsubscribed"
                    ))));
                } else if subscriptions.listeners(subscription) > 1 {
                    subscriptions.remove_listener(subscription, listener);
                    let _ = reply.send(Ok(Unsubscribed));
                } else {
                    subscriptions.set_unsubscribing(subscription, true);
                    let timeout = self.config.request_timeout();
                    let resolver = Resolver::Unsubscribe {
                        subscription,
                        reply,
                    };
                    self.request(&mut o, RequestKind::Unsubscribe, resolver, timeout, |request| {
                        Message::Unsubscribe {
                            request,
                            subscription,
                        }
                    });
                }
            },
            Command::Call {
                procedure,
                options,
                payload,
                timeout,
                reply,
                ..
            } => {
                let timeout = timeout.or_else(|| self.config.request_timeout());
                self.request(&mut o, RequestKind::Call, Resolver::Call { reply }, timeout, |request| {
                    Message::Call {
                        request,
                        options,
                        procedure,
                        payload,
                    }
                });
            },
            Command::Register {
                procedure,
                options,
                handler,
                concurrency,
                reply,
                ..
            } => {
                let resolver = Resolver::Register {
                    procedure: procedure.clone(),
                    handler,
                    concurrency,
                    reply,
                };
                let timeout = self.config.request_timeout();
                self.request(&mut o, RequestKind::Register, resolver, timeout, |request| {
                    Message::Register {
                        request,
                        options,
                        procedure,
                    }
                });
            },
            Command::Unregister {
                registration, reply, ..
            } => {
                if o.session.registrations.contains(registration) {
                    let timeout = self.config.request_timeout();
                    let resolver = Resolver::Unregister {
                        registration,
                        reply,
                    };
                    self.request(&mut o, RequestKind::Unregister, resolver, timeout, |request| {
                        Message::Unregister {
                            request,
                            registration,
                        }
                    });
                } else {
                    let _ = reply.send(Err(WampError::InvalidState(format!(
                        "registration {registration} is not held by this session"
                    ))));
                }
            },
            other => self.stray(other),
        }
        State::Open(o)
    }

    /// Allocate an id, record the pending entry, then send.
    fn request(
        &self,
        o: &mut Open,
        kind: RequestKind,
        resolver: Resolver,
        timeout: Option<Duration>,
        build: impl FnOnce(Id) -> Message,
    ) {
        let session = &mut o.session;
        let request = session.ids.next();
        let timer = timeout.map(|limit| {
            self.schedule(
                limit,
                Command::RequestTimedOut {
                    epoch: session.epoch,
                    request,
                },
            )
        });
        let pending = Pending {
            resolver,
            _timeout: timer,
        };
        if let Err(pending) = session.pending.insert(request, kind, pending) {
            let err = WampError::InvalidState(format!("request id {request} is still outstanding"));
            fail_request(session, pending.resolver, err);
            return;
        }
        if let Err(err) = o.link.send(build(request)) {
            if let Some((_, pending)) = session.pending.remove(request) {
                fail_request(session, pending.resolver, err);
            }
        }
    }

    fn open_message(&mut self, mut o: Open, message: Message) -> State {
        match message {
            Message::Goodbye { reason, .. } => {
                tracing::info!("Router closed session {}: {}", o.session.info.id, reason);
                let _ = o.link.send(Message::goodbye(reasons::GOODBYE_AND_OUT));
                self.end_session(o.session, CancelReason::SessionLost);
                self.emit(ConnectionEvent::SessionClosed {
                    reason,
                    by_peer: true,
                });
                drop(o.link);
                return self.after_loss(self.config.reconnect.reconnect_on_loss);
            },
            Message::Abort { reason, .. } => {
                tracing::warn!("Router aborted session {}: {}", o.session.info.id, reason);
                self.phase.send_replace(Phase::Aborted);
                self.end_session(o.session, CancelReason::SessionLost);
                self.emit(ConnectionEvent::SessionAborted { reason });
                drop(o.link);
                return self.after_loss(self.config.reconnect.reconnect_on_abort);
            },
            Message::Event {
                subscription,
                publication,
                details,
                payload,
            } => {
                let topic = details
                    .get("topic")
                    .and_then(Value::as_str)
                    .or_else(|| o.session.subscriptions.topic(subscription))
                    .map(str::to_string);
                let delivered = topic.is_some_and(|topic| {
                    o.session.subscriptions.dispatch(&Event {
                        subscription,
                        publication,
                        topic,
                        details,
                        payload,
                    })
                });
                if !delivered {
                    tracing::debug!(
                        "Dropping EVENT {} for unknown subscription {}",
                        publication,
                        subscription
                    );
                }
            },
            Message::Invocation {
                request,
                registration,
                details,
                payload,
            } => {
                let registrations = &o.session.registrations;
                let delivered = registrations.procedure(registration).is_some_and(|procedure| {
                    registrations.dispatch(Invocation {
                        registration,
                        request,
                        procedure: procedure.to_string(),
                        details,
                        payload,
                    })
                });
                if !delivered {
                    tracing::warn!(
                        "INVOCATION {} for unknown registration {}",
                        request,
                        registration
                    );
                    let _ = o.link.send(Message::error(
                        MessageKind::Invocation,
                        request,
                        reasons::NO_SUCH_REGISTRATION,
                        Payload::new(),
                    ));
                }
            },
            Message::Error {
                request_type,
                request,
                details,
                error,
                payload,
            } => match RequestKind::from_request_type(request_type) {
                Some(kind) => match o.session.pending.take(request, kind) {
                    Lookup::Found(pending) => {
                        tracing::debug!("{} request {} failed: {}", kind, request, error);
                        let err = WampError::OperationFailed {
                            error,
                            details,
                            payload,
                        };
                        fail_request(&mut o.session, pending.resolver, err);
                    },
                    Lookup::Unknown => {
                        self.anomaly(&format!("ERROR for unknown {kind} request {request}"));
                    },
                    Lookup::KindMismatch(recorded) => self.anomaly(&format!(
                        "ERROR for {kind} request {request}, but {request} is a {recorded} request"
                    )),
                },
                None => self.anomaly(&format!("ERROR for a {request_type} request")),
            },
            other => {
                let kind = other.kind();
                match (RequestKind::answered_by(kind), other.request_id()) {
                    (Some(expected), Some(request)) => match o.session.pending.take(request, expected) {
                        Lookup::Found(pending) => self.resolve(&mut o.session, pending.resolver, other),
                        Lookup::Unknown => {
                            self.anomaly(&format!("{kind} for unknown request {request}"));
                        },
                        Lookup::KindMismatch(recorded) => self.anomaly(&format!(
                            "{kind} for request {request}, but {request} is a {recorded} request"
                        )),
                    },
                    _ => self.anomaly(&format!("unexpected {kind} in an open session")),
                }
            },
        }
        State::Open(o)
    }

    /// Complete a request with its success response.
    fn resolve(&mut self, session: &mut LiveSession, resolver: Resolver, message: Message) {
        match (resolver, message) {
            (
                Resolver::Subscribe {
                    topic,
                    handler,
                    reply,
                },
                Message::Subscribed { subscription, .. },
            ) => {
                self.next_listener += 1;
                let listener = self.next_listener;
                let lane = EventLane::spawn(&topic, handler);
                session
                    .subscriptions
                    .add_listener(subscription, &topic, listener, lane);
                tracing::debug!("Subscribed to '{}' as {}", topic, subscription);
                let _ = reply.send(Ok(SubscribeAck {
                    subscription,
                    listener,
                }));
            },
            (
                Resolver::Unsubscribe {
                    subscription,
                    reply,
                },
                Message::Unsubscribed { .. },
            ) => {
                session.subscriptions.remove(subscription);
                let _ = reply.send(Ok(Unsubscribed));
            },
            (Resolver::Publish { reply }, Message::Published { publication, .. }) => {
                let _ = reply.send(Ok(Some(Publication { id: publication })));
            },
            (
                Resolver::Register {
                    procedure,
                    handler,
                    concurrency,
                    reply,
                },
                Message::Registered { registration, .. },
            ) => {
                let lane = InvocationLane::spawn(handler, concurrency, self.yield_sink(session.epoch));
                session.registrations.insert(registration, &procedure, lane);
                tracing::debug!("Registered '{}' as {}", procedure, registration);
                let _ = reply.send(Ok(RegisterAck { registration }));
            },
            (
                Resolver::Unregister {
                    registration,
                    reply,
                },
                Message::Unregistered { .. },
            ) => {
                session.registrations.remove(registration);
                let _ = reply.send(Ok(Unregistered));
            },
            (Resolver::Call { reply }, Message::Result { details, payload, .. }) => {
                let _ = reply.send(Ok(CallResult { details, payload }));
            },
            (resolver, message) => resolver.fail(WampError::ProtocolAnomaly(format!(
                "{} does not answer this request",
                message.kind()
            ))),
        }
    }

    fn end_session(&mut self, mut session: LiveSession, reason: CancelReason) {
        self.ended = (session.epoch, reason);
        tracing::debug!(
            "Session {} ended ({}): {} pending request(s), {} subscription(s), {} registration(s) released",
            session.info.id,
            reason,
            session.pending.len(),
            session.subscriptions.len(),
            session.registrations.len()
        );
        for (_, _, pending) in session.pending.drain() {
            pending.resolver.fail(WampError::Cancelled(reason));
        }
        session.subscriptions.clear();
        session.registrations.clear();
    }

    // ---------------------------------------------------------------------
    // Closing
    // ---------------------------------------------------------------------

    fn closing(&mut self, c: Closing, input: Input) -> State {
        match input {
            Input::Link(LinkEvent::Message(Message::Goodbye { reason, .. })) => {
                tracing::info!("Session closed, router replied {}", reason);
                let _ = c.reply.send(Ok(Closed {
                    reason,
                    acknowledged: true,
                }));
                State::Closed
            },
            Input::Link(LinkEvent::Message(other)) => {
                tracing::debug!("Ignoring {} while closing", other.kind());
                State::Closing(c)
            },
            Input::Link(event) => {
                tracing::debug!("Link ended while closing: {}", loss_reason(event));
                let _ = c.reply.send(Ok(Closed {
                    reason: c.reason,
                    acknowledged: false,
                }));
                State::Closed
            },
            Input::Command(Command::CloseTimedOut { epoch }) if epoch == c.epoch => {
                tracing::warn!("No GOODBYE reply within {:?}", self.config.close_timeout());
                let _ = c.reply.send(Ok(Closed {
                    reason: c.reason,
                    acknowledged: false,
                }));
                State::Closed
            },
            Input::Command(Command::Disconnect { reply }) => {
                let _ = c.reply.send(Err(WampError::Cancelled(CancelReason::Disconnected)));
                self.disconnected(reply)
            },
            Input::Command(other) => {
                self.stray(other);
                State::Closing(c)
            },
        }
    }

    // ---------------------------------------------------------------------
    // Helpers
    // ---------------------------------------------------------------------

    /// Answer a command that has no business in the current state.
    fn stray(&self, command: Command) {
        let phase = *self.phase.borrow();
        match command {
            Command::Connect { reply } => {
                let _ = reply.send(Ok(self.info.clone()));
            },
            Command::Open { reply, .. } => {
                let _ = reply.send(Err(WampError::InvalidState(format!(
                    "cannot open a session while {phase}"
                ))));
            },
            Command::Disconnect { reply } => {
                let _ = reply.send(Ok(Disconnected));
            },
            command => match command.session_epoch() {
                Some(epoch) => command.refuse(WampError::Cancelled(self.end_reason(epoch))),
                None => tracing::trace!("Dropping stale engine command while {}", phase),
            },
        }
    }

    fn end_reason(&self, epoch: u64) -> CancelReason {
        if self.ended.0 == epoch {
            self.ended.1
        } else {
            CancelReason::SessionLost
        }
    }

    fn disconnected(&self, reply: Reply<Disconnected>) -> State {
        tracing::info!("Disconnected from {}", self.info.endpoint);
        self.emit(ConnectionEvent::Disconnected {
            reason: "disconnected by caller".to_string(),
        });
        let _ = reply.send(Ok(Disconnected));
        State::Closed
    }

    fn anomaly(&self, what: &str) {
        let err = WampError::ProtocolAnomaly(what.to_string());
        tracing::warn!("{}", err);
    }

    fn emit(&self, event: ConnectionEvent) {
        // no receivers is fine
        let _ = self.events.send(event);
    }

    fn schedule(&self, delay: Duration, command: Command) -> Timer {
        let handle = self.handle.clone();
        Timer::new(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(tx) = handle.upgrade() {
                let _ = tx.send(command);
            }
        }))
    }

    fn session_handle(&self, info: &Arc<SessionInfo>, epoch: u64) -> Option<Session> {
        self.handle
            .upgrade()
            .map(|tx| Session::new(tx, Arc::clone(info), epoch, self.config.uri_policy))
    }

    fn yield_sink(&self, epoch: u64) -> YieldSink {
        let handle = self.handle.clone();
        Arc::new(move |request, outcome| {
            if let Some(tx) = handle.upgrade() {
                let _ = tx.send(Command::Yield {
                    epoch,
                    request,
                    outcome,
                });
            }
        })
    }

    /// Every handle is gone: release whatever the current state holds.
    fn shutdown(&mut self) {
        match mem::replace(&mut self.state, State::Closed) {
            State::Connecting(c) => {
                for waiter in c.waiters {
                    let _ = waiter.send(Err(WampError::Cancelled(CancelReason::Shutdown)));
                }
            },
            State::Connected(c) => {
                if let Some(Opening {
                    reply: Some(opener),
                    ..
                }) = c.opening
                {
                    let _ = opener.send(Err(WampError::Cancelled(CancelReason::Shutdown)));
                }
            },
            State::Open(o) => {
                let _ = o.link.send(Message::goodbye(reasons::SYSTEM_SHUTDOWN));
                self.end_session(o.session, CancelReason::Shutdown);
            },
            State::Closing(c) => {
                let _ = c.reply.send(Err(WampError::Cancelled(CancelReason::Shutdown)));
            },
            State::Idle | State::Closed => {},
        }
        self.phase.send_replace(Phase::Closed);
    }
}

/// Fail a request that never got its success response.
fn fail_request(session: &mut LiveSession, resolver: Resolver, err: WampError) {
    if let Resolver::Unsubscribe { subscription, .. } = &resolver {
        session.subscriptions.set_unsubscribing(*subscription, false);
    }
    resolver.fail(err);
}

fn answer<T>(reply: Reply<T>, err: WampError) {
    let _ = reply.send(Err(err));
}

fn loss_reason(event: LinkEvent) -> String {
    match event {
        LinkEvent::Closed => "transport closed by peer".to_string(),
        LinkEvent::Failed(reason) => reason,
        LinkEvent::Message(message) => format!("unexpected {}", message.kind()),
    }
}

fn yield_message(request: Id, outcome: InvocationOutcome) -> Message {
    match outcome {
        Ok(payload) => Message::Yield {
            request,
            options: Dict::new(),
            payload,
        },
        Err(InvocationError { error, payload }) => Message::Error {
            request_type: MessageKind::Invocation,
            request,
            details: Dict::new(),
            error,
            payload,
        },
    }
}
