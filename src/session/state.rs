//! Engine states and their observable projection.
//!
//! | Phase        | Link | Session | Leaves on                                  |
//! |--------------|------|---------|--------------------------------------------|
//! | `Idle`       | no   | no      | connect                                    |
//! | `Connecting` | no   | no      | attempt succeeds, supervisor gives up      |
//! | `Connected`  | yes  | no      | WELCOME, ABORT, link loss                  |
//! | `Open`       | yes  | yes     | close, peer GOODBYE/ABORT, link loss       |
//! | `Closing`    | yes  | no      | GOODBYE reply, close timeout, link loss    |
//! | `Closed`     | no   | no      | connect                                    |
//! | `Aborted`    | no   | no      | (transient, on the way to reconnection)    |
//!
//! Any phase moves to `Closed` on disconnect.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::client::{Closed, ConnectionInfo, Session, SessionInfo};
use super::engine::Resolver;
use super::pending::PendingRequestTable;
use super::registry::{RegistrationRegistry, SubscriptionRegistry};
use crate::error::Result;
use crate::protocol::{Dict, IdGenerator};
use crate::transport::Link;

/// Observable connection phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No link, nothing scheduled
    Idle,
    /// Opening a link or waiting to retry
    Connecting,
    /// Link up, no session
    Connected,
    /// Session established
    Open,
    /// GOODBYE sent, waiting for the reply
    Closing,
    /// Link released
    Closed,
    /// Session or handshake aborted by the router
    Aborted,
}

impl Phase {
    /// Lower-case name
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::Aborted => "aborted",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Notable things that happen to a connection.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// A link is up
    Connected,
    /// Another attempt is scheduled
    Reconnecting {
        /// Attempt number within the cycle
        attempt: u32,
        /// Delay before the attempt
        delay: Duration,
    },
    /// A session was established (including automatic re-opens)
    SessionOpened(Session),
    /// A session ended with GOODBYE
    SessionClosed {
        /// GOODBYE reason
        reason: String,
        /// True if the router initiated it
        by_peer: bool,
    },
    /// The router aborted the handshake or the session
    SessionAborted {
        /// ABORT reason
        reason: String,
    },
    /// The link went away
    Disconnected {
        /// Why
        reason: String,
    },
    /// Reconnection exhausted
    GaveUp {
        /// Attempts made in the failed cycle
        attempts: u32,
    },
}

/// Aborts the wrapped task when dropped.
#[derive(Debug)]
pub(crate) struct Timer(JoinHandle<()>);

impl Timer {
    pub(crate) fn new(handle: JoinHandle<()>) -> Self {
        Self(handle)
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.0.abort();
    }
}

pub(crate) type ConnectWaiter = oneshot::Sender<Result<ConnectionInfo>>;

pub(crate) struct Connecting {
    pub(crate) epoch: u64,
    pub(crate) waiters: Vec<ConnectWaiter>,
    /// Running attempt or pending retry
    pub(crate) _timer: Timer,
    /// Started by the engine after a loss, not by a caller
    pub(crate) automatic: bool,
}

pub(crate) struct Opening {
    pub(crate) realm: String,
    pub(crate) details: Dict,
    /// `None` for an automatic re-open
    pub(crate) reply: Option<oneshot::Sender<Result<Session>>>,
}

pub(crate) struct Connected {
    pub(crate) link: Link,
    pub(crate) opening: Option<Opening>,
}

/// A correlated request waiting for its response.
pub(crate) struct Pending {
    pub(crate) resolver: Resolver,
    pub(crate) _timeout: Option<Timer>,
}

/// Everything that lives exactly as long as one session.
pub(crate) struct LiveSession {
    pub(crate) info: Arc<SessionInfo>,
    pub(crate) epoch: u64,
    pub(crate) ids: IdGenerator,
    pub(crate) pending: PendingRequestTable<Pending>,
    pub(crate) subscriptions: SubscriptionRegistry,
    pub(crate) registrations: RegistrationRegistry,
}

pub(crate) struct Open {
    pub(crate) link: Link,
    pub(crate) session: LiveSession,
}

pub(crate) struct Closing {
    pub(crate) link: Link,
    pub(crate) epoch: u64,
    /// Reason sent in our GOODBYE
    pub(crate) reason: String,
    pub(crate) reply: oneshot::Sender<Result<Closed>>,
    pub(crate) _timer: Timer,
}

pub(crate) enum State {
    Idle,
    Connecting(Connecting),
    Connected(Connected),
    Open(Open),
    Closing(Closing),
    Closed,
}

impl State {
    pub(crate) fn phase(&self) -> Phase {
        match self {
            Self::Idle => Phase::Idle,
            Self::Connecting(_) => Phase::Connecting,
            Self::Connected(_) => Phase::Connected,
            Self::Open(_) => Phase::Open,
            Self::Closing(_) => Phase::Closing,
            Self::Closed => Phase::Closed,
        }
    }

    pub(crate) fn link_mut(&mut self) -> Option<&mut Link> {
        match self {
            Self::Connected(c) => Some(&mut c.link),
            Self::Open(o) => Some(&mut o.link),
            Self::Closing(c) => Some(&mut c.link),
            Self::Idle | Self::Connecting(_) | Self::Closed => None,
        }
    }
}
