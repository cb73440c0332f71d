//! Public handles: [`Client`], [`Connection`], [`Session`].
//!
//! All three are thin senders into the connection's engine task. Every
//! operation is a command plus a oneshot reply, so a handle never blocks the
//! engine and the engine never waits on a caller.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot, watch};

use super::engine::{Command, Engine, EngineHandle};
use super::handler::{
    event_handler, invocation_handler, Event, Invocation, InvocationOutcome,
};
use super::options::{CallOptions, MatchPolicy, PublishOptions, RegisterOptions, SubscribeOptions};
use super::registry::ListenerId;
use super::state::{ConnectionEvent, Phase};
use crate::config::ClientConfig;
use crate::error::{CancelReason, Result, WampError};
use crate::protocol::{
    reasons, validate, validate_registration, Dict, Id, Payload, RouterRoles, UriPolicy, UriRole,
};
use crate::transport::{Connector, DefaultConnector, Endpoint, Format};

/// Entry point: holds configuration and the transport connector.
#[derive(Clone)]
pub struct Client {
    config: Arc<ClientConfig>,
    connector: Arc<dyn Connector>,
}

impl Client {
    /// Client using the WebSocket and RawSocket transports
    pub fn new(config: ClientConfig) -> Self {
        Self::with_connector(config, Arc::new(DefaultConnector::default()))
    }

    /// Client using a custom connector
    pub fn with_connector(config: ClientConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            config: Arc::new(config),
            connector,
        }
    }

    /// Client configuration
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Connect to `endpoint`, retrying per the reconnection policy.
    ///
    /// Resolves once a link is up, or fails once the supervisor gives up.
    pub async fn connect(&self, endpoint: &str, format: Format) -> Result<Connection> {
        let endpoint = Endpoint::parse(endpoint)?;
        let info = ConnectionInfo { endpoint, format };
        let EngineHandle {
            commands,
            phase,
            events,
        } = Engine::spawn(Arc::clone(&self.config), info.clone(), Arc::clone(&self.connector));

        let connection = Connection {
            commands,
            info,
            phase,
            events,
        };
        connection.reconnect().await?;
        Ok(connection)
    }

    /// Connect to the configured endpoint with the configured format
    pub async fn connect_configured(&self) -> Result<Connection> {
        let endpoint = self.config.endpoint.clone();
        self.connect(&endpoint, self.config.format).await
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("config", &self.config)
            .field("connector", &self.connector.name())
            .finish()
    }
}

/// Where a connection goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Router endpoint
    pub endpoint: Endpoint,
    /// Serialization format
    pub format: Format,
}

/// Handle to one connection and its engine.
///
/// Clones share the engine. The engine stops, and the link closes, when the
/// last `Connection` and `Session` handle is dropped.
#[derive(Debug, Clone)]
pub struct Connection {
    commands: mpsc::UnboundedSender<Command>,
    info: ConnectionInfo,
    phase: watch::Receiver<Phase>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl Connection {
    /// Router endpoint
    pub fn endpoint(&self) -> &Endpoint {
        &self.info.endpoint
    }

    /// Serialization format
    pub fn format(&self) -> Format {
        self.info.format
    }

    /// Endpoint and format
    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    /// Current phase
    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    /// Watch phase changes
    pub fn phases(&self) -> watch::Receiver<Phase> {
        self.phase.clone()
    }

    /// Subscribe to connection events from now on
    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Open a session on `realm`
    pub async fn open(&self, realm: &str) -> Result<Session> {
        self.open_with(realm, Dict::new()).await
    }

    /// Open a session with extra HELLO details
    pub async fn open_with(&self, realm: &str, details: Dict) -> Result<Session> {
        validate(realm, UriRole::Realm, UriPolicy::Loose)?;
        request(&self.commands, |reply| Command::Open {
            realm: realm.to_string(),
            details,
            reply,
        })
        .await
    }

    /// Bring the link back up after it was closed or given up.
    ///
    /// Starts a fresh attempt cycle; a no-op while connected.
    pub async fn reconnect(&self) -> Result<ConnectionInfo> {
        request(&self.commands, |reply| Command::Connect { reply }).await
    }

    /// Drop the link; cancels any live session and pending request
    pub async fn disconnect(&self) -> Result<Disconnected> {
        request(&self.commands, |reply| Command::Disconnect { reply }).await
    }
}

/// Session identity as established by WELCOME
#[derive(Debug, Clone, PartialEq)]
pub struct SessionInfo {
    /// Router-assigned session id
    pub id: Id,
    /// Joined realm
    pub realm: String,
    /// WELCOME details
    pub details: Dict,
}

impl SessionInfo {
    /// Roles the router announced
    pub fn router_roles(&self) -> RouterRoles {
        RouterRoles::from_details(&self.details)
    }
}

/// Handle to one established session.
///
/// Once the session ends, every operation fails with
/// [`WampError::Cancelled`]; a reconnect produces a new `Session`.
#[derive(Clone)]
pub struct Session {
    commands: mpsc::UnboundedSender<Command>,
    info: Arc<SessionInfo>,
    epoch: u64,
    policy: UriPolicy,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.info.id)
            .field("realm", &self.info.realm)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub(crate) fn new(
        commands: mpsc::UnboundedSender<Command>,
        info: Arc<SessionInfo>,
        epoch: u64,
        policy: UriPolicy,
    ) -> Self {
        Self {
            commands,
            info,
            epoch,
            policy,
        }
    }

    /// Router-assigned session id
    pub fn id(&self) -> Id {
        self.info.id
    }

    /// Joined realm
    pub fn realm(&self) -> &str {
        &self.info.realm
    }

    /// WELCOME details
    pub fn details(&self) -> &Dict {
        &self.info.details
    }

    /// Roles the router announced
    pub fn router_roles(&self) -> RouterRoles {
        self.info.router_roles()
    }

    /// Publish without acknowledgment; resolves once queued
    pub async fn publish(&self, topic: &str, payload: Payload) -> Result<()> {
        self.publish_with(topic, payload, PublishOptions::default()).await
    }

    /// Publish with options, without acknowledgment
    pub async fn publish_with(&self, topic: &str, payload: Payload, options: PublishOptions) -> Result<()> {
        self.send_publish(topic, payload, &options, false).await.map(|_| ())
    }

    /// Publish and wait for PUBLISHED
    pub async fn publish_ack(&self, topic: &str, payload: Payload) -> Result<Publication> {
        self.publish_ack_with(topic, payload, PublishOptions::default()).await
    }

    /// Publish with options and wait for PUBLISHED
    pub async fn publish_ack_with(
        &self,
        topic: &str,
        payload: Payload,
        options: PublishOptions,
    ) -> Result<Publication> {
        self.send_publish(topic, payload, &options, true)
            .await?
            .ok_or_else(|| WampError::ProtocolAnomaly("PUBLISHED without a publication".to_string()))
    }

    async fn send_publish(
        &self,
        topic: &str,
        payload: Payload,
        options: &PublishOptions,
        acknowledge: bool,
    ) -> Result<Option<Publication>> {
        validate(topic, UriRole::Topic, self.policy)?;
        request(&self.commands, |reply| Command::Publish {
            epoch: self.epoch,
            topic: topic.to_string(),
            options: options.to_dict(acknowledge),
            payload,
            acknowledge,
            reply,
        })
        .await
    }

    /// Subscribe to `topic`; `handler` runs for each event, in order
    pub async fn subscribe<F, Fut>(&self, topic: &str, handler: F) -> Result<Subscription>
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.subscribe_with(topic, SubscribeOptions::default(), handler).await
    }

    /// Subscribe with options
    pub async fn subscribe_with<F, Fut>(
        &self,
        topic: &str,
        options: SubscribeOptions,
        handler: F,
    ) -> Result<Subscription>
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        // pattern subscriptions may carry empty components
        if options.match_policy == MatchPolicy::Exact {
            validate(topic, UriRole::Topic, self.policy)?;
        }
        let ack = request(&self.commands, |reply| Command::Subscribe {
            epoch: self.epoch,
            topic: topic.to_string(),
            options: options.to_dict(),
            handler: event_handler(handler),
            reply,
        })
        .await?;
        Ok(Subscription {
            session: self.clone(),
            id: ack.subscription,
            listener: ack.listener,
            topic: topic.to_string(),
        })
    }

    /// Call `procedure` and wait for its result
    pub async fn call(&self, procedure: &str, payload: Payload) -> Result<CallResult> {
        self.call_with(procedure, payload, CallOptions::default()).await
    }

    /// Call with options
    pub async fn call_with(&self, procedure: &str, payload: Payload, options: CallOptions) -> Result<CallResult> {
        validate(procedure, UriRole::Procedure, self.policy)?;
        let CallOptions { timeout, extra } = options;
        request(&self.commands, |reply| Command::Call {
            epoch: self.epoch,
            procedure: procedure.to_string(),
            options: extra,
            payload,
            timeout,
            reply,
        })
        .await
    }

    /// Register `procedure`; `handler` answers each invocation
    pub async fn register<F, Fut>(&self, procedure: &str, handler: F) -> Result<Registration>
    where
        F: Fn(Invocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = InvocationOutcome> + Send + 'static,
    {
        self.register_with(procedure, RegisterOptions::default(), handler).await
    }

    /// Register with options
    pub async fn register_with<F, Fut>(
        &self,
        procedure: &str,
        options: RegisterOptions,
        handler: F,
    ) -> Result<Registration>
    where
        F: Fn(Invocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = InvocationOutcome> + Send + 'static,
    {
        validate_registration(procedure, self.policy)?;
        let RegisterOptions { concurrency, extra } = options;
        let ack = request(&self.commands, |reply| Command::Register {
            epoch: self.epoch,
            procedure: procedure.to_string(),
            options: extra,
            handler: invocation_handler(handler),
            concurrency,
            reply,
        })
        .await?;
        Ok(Registration {
            session: self.clone(),
            id: ack.registration,
            procedure: procedure.to_string(),
        })
    }

    /// Close with `wamp.close.close_realm`
    pub async fn close(&self) -> Result<Closed> {
        self.close_with(reasons::CLOSE_NORMAL).await
    }

    /// Close with a reason URI and wait for the router's GOODBYE
    pub async fn close_with(&self, reason: &str) -> Result<Closed> {
        validate(reason, UriRole::Error, self.policy)?;
        request(&self.commands, |reply| Command::Close {
            epoch: self.epoch,
            reason: reason.to_string(),
            reply,
        })
        .await
    }
}

/// An active subscription listener.
#[derive(Debug, Clone)]
pub struct Subscription {
    session: Session,
    id: Id,
    listener: ListenerId,
    topic: String,
}

impl Subscription {
    /// Router-assigned subscription id
    pub fn id(&self) -> Id {
        self.id
    }

    /// Subscribed topic
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Stop this listener; UNSUBSCRIBE goes out when it was the last one
    pub async fn unsubscribe(&self) -> Result<Unsubscribed> {
        request(&self.session.commands, |reply| Command::Unsubscribe {
            epoch: self.session.epoch,
            subscription: self.id,
            listener: self.listener,
            reply,
        })
        .await
    }
}

/// An active procedure registration.
#[derive(Debug, Clone)]
pub struct Registration {
    session: Session,
    id: Id,
    procedure: String,
}

impl Registration {
    /// Router-assigned registration id
    pub fn id(&self) -> Id {
        self.id
    }

    /// Registered procedure
    pub fn procedure(&self) -> &str {
        &self.procedure
    }

    /// Withdraw the registration
    pub async fn unregister(&self) -> Result<Unregistered> {
        request(&self.session.commands, |reply| Command::Unregister {
            epoch: self.session.epoch,
            registration: self.id,
            reply,
        })
        .await
    }
}

/// Acknowledged publication
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Publication {
    /// Router-assigned publication id
    pub id: Id,
}

/// UNSUBSCRIBED (or local listener removal)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Unsubscribed;

/// UNREGISTERED
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Unregistered;

/// Link dropped on request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Disconnected;

/// RESULT of a call
#[derive(Debug, Clone, PartialEq)]
pub struct CallResult {
    /// RESULT details
    pub details: Dict,
    /// Returned payload
    pub payload: Payload,
}

impl CallResult {
    /// Positional result `index`
    pub fn arg(&self, index: usize) -> Option<&serde_json::Value> {
        self.payload.arg(index)
    }
}

/// Outcome of a local close
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Closed {
    /// Router's GOODBYE reason, or ours if it never replied
    pub reason: String,
    /// True if the router replied before the close timeout
    pub acknowledged: bool,
}

async fn request<T>(
    commands: &mpsc::UnboundedSender<Command>,
    build: impl FnOnce(oneshot::Sender<Result<T>>) -> Command,
) -> Result<T> {
    let (tx, rx) = oneshot::channel();
    commands
        .send(build(tx))
        .map_err(|_| WampError::Cancelled(CancelReason::Shutdown))?;
    rx.await
        .unwrap_or(Err(WampError::Cancelled(CancelReason::Shutdown)))
}
