//! Shared fixtures: a small in-memory broker/dealer and scripted-peer helpers.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::oneshot;
use wamp::protocol::{reasons, Dict, Id, Message, MessageKind, Payload};
use wamp::transport::{self, MemoryConnector, MemoryListener, MemoryPeer, PeerSender};
use wamp::{ClientConfig, Client, ReconnectPolicy};

pub const ENDPOINT: &str = "memory://router";

/// Fail the test if `fut` takes longer than two seconds
pub async fn within<F: Future>(fut: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(2), fut)
        .await
        .expect("timed out")
}

/// Config with quick retries and short close timeout
pub fn fast_config() -> ClientConfig {
    ClientConfig::default()
        .with_reconnect(ReconnectPolicy::fixed(3, Duration::from_millis(10)))
        .with_close_timeout(Duration::from_millis(200))
}

pub fn dict(value: Value) -> Dict {
    value.as_object().cloned().unwrap_or_default()
}

pub fn client(connector: &MemoryConnector, config: ClientConfig) -> Client {
    Client::with_connector(config, Arc::new(connector.clone()))
}

// ---------------------------------------------------------------------------
// Scripted peer helpers
// ---------------------------------------------------------------------------

/// Receive the next client message
pub async fn next(peer: &mut MemoryPeer) -> Message {
    within(peer.recv()).await.expect("client dropped the link")
}

/// Accept the next link and complete the handshake as session `session`
pub async fn accept_session(listener: &mut MemoryListener, session: Id) -> MemoryPeer {
    let mut peer = within(listener.accept()).await.expect("no link");
    welcome(&mut peer, session).await;
    peer
}

/// Answer the HELLO on `peer`
pub async fn welcome(peer: &mut MemoryPeer, session: Id) {
    match next(peer).await {
        Message::Hello { .. } => {},
        other => panic!("expected HELLO, got {other:?}"),
    }
    peer.send(Message::Welcome {
        session,
        details: router_details(),
    });
}

fn router_details() -> Dict {
    dict(json!({ "roles": { "broker": {}, "dealer": {} }, "authrole": "anonymous" }))
}

// ---------------------------------------------------------------------------
// In-memory router
// ---------------------------------------------------------------------------

#[derive(Default)]
struct RouterState {
    next_id: Id,
    sessions: HashMap<Id, PeerSender>,
    kill: HashMap<Id, oneshot::Sender<()>>,
    hellos: Vec<String>,
    /// topic → (subscription id, subscribers)
    topics: HashMap<String, (Id, HashSet<Id>)>,
    /// procedure → (registration id, callee)
    procedures: HashMap<String, (Id, Id)>,
    /// invocation id → (caller, call request id)
    invocations: HashMap<Id, (Id, Id)>,
    /// sessions we sent GOODBYE to
    closing: HashSet<Id>,
}

impl RouterState {
    fn next_id(&mut self) -> Id {
        self.next_id += 1;
        self.next_id
    }

    fn send(&self, session: Id, message: Message) {
        if let Some(peer) = self.sessions.get(&session) {
            peer.send(message);
        }
    }

    fn forget(&mut self, session: Id) {
        self.sessions.remove(&session);
        self.kill.remove(&session);
        self.closing.remove(&session);
        for (_, subscribers) in self.topics.values_mut() {
            subscribers.remove(&session);
        }
        self.topics.retain(|_, (_, subscribers)| !subscribers.is_empty());
        self.procedures.retain(|_, (_, callee)| *callee != session);
    }
}

/// A broker and dealer serving every link opened through its connector.
///
/// Realm `reject` is refused with ABORT.
#[derive(Clone, Default)]
pub struct TestRouter {
    state: Arc<Mutex<RouterState>>,
}

impl TestRouter {
    pub fn start() -> (Self, MemoryConnector) {
        let (connector, mut listener) = transport::channel();
        let router = Self::default();
        let serving = router.clone();
        tokio::spawn(async move {
            while let Some(peer) = listener.accept().await {
                tokio::spawn(serving.clone().serve(peer));
            }
        });
        (router, connector)
    }

    /// Live session ids
    pub fn sessions(&self) -> Vec<Id> {
        let mut ids: Vec<_> = self.state.lock().unwrap().sessions.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Realms of every HELLO received so far
    pub fn hellos(&self) -> Vec<String> {
        self.state.lock().unwrap().hellos.clone()
    }

    /// Fail the link of `session`
    pub fn drop_link(&self, session: Id) {
        if let Some(kill) = self.state.lock().unwrap().kill.remove(&session) {
            let _ = kill.send(());
        }
    }

    /// Close `session` from the router side
    pub fn kick(&self, session: Id, reason: &str) {
        let mut state = self.state.lock().unwrap();
        state.closing.insert(session);
        state.send(session, Message::goodbye(reason));
    }

    async fn serve(self, mut peer: MemoryPeer) {
        let (kill_tx, mut kill_rx) = oneshot::channel();
        let mut kill_tx = Some(kill_tx);
        let mut session: Option<Id> = None;

        loop {
            let message = tokio::select! {
                _ = &mut kill_rx => {
                    if let Some(id) = session {
                        self.forget(id);
                    }
                    peer.fail("router dropped the link");
                    return;
                },
                message = peer.recv() => message,
            };
            let Some(message) = message else { break };

            match (session, message) {
                (None, Message::Hello { realm, .. }) => match self.hello(&realm, peer.sender()) {
                    Some(id) => {
                        if let Some(kill) = kill_tx.take() {
                            self.state.lock().unwrap().kill.insert(id, kill);
                        }
                        session = Some(id);
                        peer.send(Message::Welcome {
                            session: id,
                            details: router_details(),
                        });
                    },
                    None => {
                        peer.send(Message::abort(reasons::NO_SUCH_REALM, "no such realm"));
                    },
                },
                (Some(id), message) => {
                    if !self.handle(id, message) {
                        session = None;
                    }
                },
                (None, _) => {},
            }
        }

        if let Some(id) = session {
            self.forget(id);
        }
    }

    fn forget(&self, session: Id) {
        self.state.lock().unwrap().forget(session);
    }

    fn hello(&self, realm: &str, sender: PeerSender) -> Option<Id> {
        let mut state = self.state.lock().unwrap();
        state.hellos.push(realm.to_string());
        if realm == "reject" {
            return None;
        }
        let id = state.next_id();
        state.sessions.insert(id, sender);
        Some(id)
    }

    /// Handle one message of an open session; false once the session ended
    fn handle(&self, session: Id, message: Message) -> bool {
        let mut state = self.state.lock().unwrap();
        match message {
            Message::Goodbye { .. } => {
                if !state.closing.contains(&session) {
                    state.send(session, Message::goodbye(reasons::GOODBYE_AND_OUT));
                }
                state.forget(session);
                return false;
            },
            Message::Subscribe { request, topic, .. } => {
                let fresh = state.next_id();
                let entry = state.topics.entry(topic).or_insert_with(|| (fresh, HashSet::new()));
                entry.1.insert(session);
                let subscription = entry.0;
                state.send(session, Message::Subscribed { request, subscription });
            },
            Message::Unsubscribe { request, subscription } => {
                let found = state
                    .topics
                    .values_mut()
                    .find(|(id, _)| *id == subscription)
                    .is_some_and(|(_, subscribers)| subscribers.remove(&session));
                let reply = if found {
                    Message::Unsubscribed { request }
                } else {
                    Message::error(
                        MessageKind::Unsubscribe,
                        request,
                        reasons::NO_SUCH_SUBSCRIPTION,
                        Payload::new(),
                    )
                };
                state.topics.retain(|_, (_, subscribers)| !subscribers.is_empty());
                state.send(session, reply);
            },
            Message::Publish {
                request,
                options,
                topic,
                payload,
            } => {
                let publication = state.next_id();
                let exclude_me = options.get("exclude_me").and_then(Value::as_bool).unwrap_or(true);
                if let Some((subscription, subscribers)) = state.topics.get(&topic) {
                    for subscriber in subscribers {
                        if exclude_me && *subscriber == session {
                            continue;
                        }
                        state.send(
                            *subscriber,
                            Message::Event {
                                subscription: *subscription,
                                publication,
                                details: Dict::new(),
                                payload: payload.clone(),
                            },
                        );
                    }
                }
                if options.get("acknowledge") == Some(&Value::Bool(true)) {
                    state.send(session, Message::Published { request, publication });
                }
            },
            Message::Register { request, procedure, .. } => {
                if state.procedures.contains_key(&procedure) {
                    state.send(
                        session,
                        Message::error(
                            MessageKind::Register,
                            request,
                            reasons::PROCEDURE_ALREADY_EXISTS,
                            Payload::new(),
                        ),
                    );
                } else {
                    let registration = state.next_id();
                    state.procedures.insert(procedure, (registration, session));
                    state.send(session, Message::Registered { request, registration });
                }
            },
            Message::Unregister { request, registration } => {
                let before = state.procedures.len();
                state
                    .procedures
                    .retain(|_, (id, callee)| !(*id == registration && *callee == session));
                let reply = if state.procedures.len() < before {
                    Message::Unregistered { request }
                } else {
                    Message::error(
                        MessageKind::Unregister,
                        request,
                        reasons::NO_SUCH_REGISTRATION,
                        Payload::new(),
                    )
                };
                state.send(session, reply);
            },
            Message::Call {
                request,
                procedure,
                payload,
                ..
            } => match state.procedures.get(&procedure).copied() {
                Some((registration, callee)) => {
                    let invocation = state.next_id();
                    state.invocations.insert(invocation, (session, request));
                    state.send(
                        callee,
                        Message::Invocation {
                            request: invocation,
                            registration,
                            details: Dict::new(),
                            payload,
                        },
                    );
                },
                None => state.send(
                    session,
                    Message::error(
                        MessageKind::Call,
                        request,
                        reasons::NO_SUCH_PROCEDURE,
                        Payload::new(),
                    ),
                ),
            },
            Message::Yield { request, payload, .. } => {
                if let Some((caller, call)) = state.invocations.remove(&request) {
                    state.send(
                        caller,
                        Message::Result {
                            request: call,
                            details: Dict::new(),
                            payload,
                        },
                    );
                }
            },
            Message::Error {
                request_type: MessageKind::Invocation,
                request,
                details,
                error,
                payload,
            } => {
                if let Some((caller, call)) = state.invocations.remove(&request) {
                    state.send(
                        caller,
                        Message::Error {
                            request_type: MessageKind::Call,
                            request: call,
                            details,
                            error,
                            payload,
                        },
                    );
                }
            },
            _ => {},
        }
        true
    }
}

/// Read connection events until one matches `pred`; returns everything seen
pub async fn events_until<F>(
    events: &mut tokio::sync::broadcast::Receiver<wamp::ConnectionEvent>,
    pred: F,
) -> Vec<wamp::ConnectionEvent>
where
    F: Fn(&wamp::ConnectionEvent) -> bool,
{
    within(async {
        let mut seen = Vec::new();
        loop {
            let event = events.recv().await.expect("event stream ended");
            let done = pred(&event);
            seen.push(event);
            if done {
                return seen;
            }
        }
    })
    .await
}

/// Wait until `connection` reports `phase`
pub async fn phase_becomes(connection: &wamp::Connection, phase: wamp::Phase) {
    let mut phases = connection.phases();
    within(phases.wait_for(|p| *p == phase))
        .await
        .expect("engine stopped");
}
