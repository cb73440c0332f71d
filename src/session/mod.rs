//! Client session engine.
//!
//! A [`Client`] connects to a router endpoint and returns a [`Connection`].
//! Each connection runs one engine task that owns the transport link, the
//! session (if any), and everything correlated with it. A [`Session`] is a
//! cheap handle for PubSub and RPC operations on the current session.
//!
//! ```text
//!  Client::connect ─> [Connecting] ──link up──> [Connected]
//!                          ^                        │ open(realm)
//!                          │ retry / reconnect      v
//!                          └──── loss ──────────  [Open] ── close ──> [Closing]
//!                                                                          │
//!  disconnect (any phase) ───────────────────────────────────────────> [Closed]
//! ```
//!
//! ## Delivery
//!
//! - Events are delivered per subscription listener in arrival order.
//! - Invocations run on a per-registration lane with configurable concurrency.
//! - Handler errors and panics are contained; invocation failures go back to
//!   the caller as `ERROR` messages.
//!
//! ## Reconnection
//!
//! Connection attempts are bounded by [`ReconnectPolicy`]. After a loss the
//! engine reconnects on its own and re-opens the last realm; subscriptions and
//! registrations are not replayed. Watch [`ConnectionEvent::SessionOpened`] to
//! restore them.

mod client;
mod engine;
mod handler;
mod options;
mod pending;
mod reconnect;
mod registry;
mod state;

pub use client::{
    CallResult, Client, Closed, Connection, ConnectionInfo, Disconnected, Publication,
    Registration, Session, SessionInfo, Subscription, Unregistered, Unsubscribed,
};
pub use handler::{
    event_handler, invocation_handler, Event, EventHandler, Invocation, InvocationError,
    InvocationHandler, InvocationOutcome,
};
pub use options::{CallOptions, MatchPolicy, PublishOptions, RegisterOptions, SubscribeOptions};
pub use pending::{Lookup, PendingRequestTable, RequestKind};
pub use reconnect::{DelayPolicy, ReconnectPolicy, ReconnectionSupervisor, Retry};
pub use registry::ListenerId;
pub use state::{ConnectionEvent, Phase};
