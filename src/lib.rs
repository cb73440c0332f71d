//! # wamp-core - WAMP client session engine
//!
//! Client side of the Web Application Messaging Protocol (basic profile):
//! routed Publish/Subscribe and routed Remote Procedure Calls over a
//! persistent link to a WAMP router.
//!
//! ## Features
//!
//! - **Session lifecycle**: HELLO/WELCOME handshake, GOODBYE close, ABORT
//! - **PubSub**: publish (with or without acknowledgment), subscribe, unsubscribe
//! - **RPC**: call with timeouts, register procedures with bounded concurrency
//! - **Reconnection**: bounded attempts with fixed or exponential backoff
//! - **Transports**: WebSocket (`wamp.2.json`) and RawSocket over TCP
//!
//! ## Architecture
//!
//! ```text
//!   Session handle ──cmd──┐
//!   Connection handle ─cmd─┼──> [engine task] <──LinkEvent── transport tasks
//!   timers / lanes ──cmd──┘         │                            ^
//!                                   └──────── Message ───────────┘
//! ```
//!
//! One engine task per connection owns all mutable state. Handlers run on
//! their own lanes, never on the engine.
//!
//! ### Message Types
//!
//! | Code | Message      | Direction       |
//! |------|--------------|-----------------|
//! | 1    | HELLO        | Client→Router   |
//! | 2    | WELCOME      | Router→Client   |
//! | 3    | ABORT        | Bidirectional   |
//! | 6    | GOODBYE      | Bidirectional   |
//! | 8    | ERROR        | Bidirectional   |
//! | 16   | PUBLISH      | Client→Router   |
//! | 32   | SUBSCRIBE    | Client→Router   |
//! | 36   | EVENT        | Router→Client   |
//! | 48   | CALL         | Client→Router   |
//! | 50   | RESULT       | Router→Client   |
//! | 64   | REGISTER     | Client→Router   |
//! | 68   | INVOCATION   | Router→Client   |
//! | 70   | YIELD        | Client→Router   |
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use wamp::{Client, ClientConfig, Format, Payload};
//!
//! let client = Client::new(ClientConfig::default());
//! let connection = client.connect("ws://127.0.0.1:8080/ws", Format::Json).await?;
//! let session = connection.open("realm1").await?;
//!
//! session
//!     .subscribe("com.example.tick", |event| async move {
//!         println!("tick {:?}", event.payload.arg(0));
//!         Ok(())
//!     })
//!     .await?;
//!
//! session
//!     .register("com.example.add", |inv| async move {
//!         let a = inv.payload.arg(0).and_then(|v| v.as_i64()).unwrap_or(0);
//!         let b = inv.payload.arg(1).and_then(|v| v.as_i64()).unwrap_or(0);
//!         Ok(Payload::with_args([a + b]))
//!     })
//!     .await?;
//!
//! let sum = session.call("com.example.add", Payload::with_args([2, 3])).await?;
//! assert_eq!(sum.arg(0), Some(&5.into()));
//!
//! session.close().await?;
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Message model, ids, URIs and roles
//! - [`transport`]: Link abstraction, WebSocket/RawSocket/in-memory connectors
//! - [`session`]: Client, connection engine, session handles
//! - [`config`]: Configuration management
//! - [`error`]: Error types and result aliases

pub mod config;
pub mod error;
pub mod protocol;
pub mod session;
pub mod transport;

// Re-exports for convenience
pub use config::{ClientConfig, Config, LoggingConfig};
pub use error::{CancelReason, Result, WampError};
pub use protocol::{Dict, Id, Message, MessageKind, Payload, UriPolicy};
pub use session::{
    CallOptions, CallResult, Client, Closed, Connection, ConnectionEvent, DelayPolicy, Event,
    Invocation, InvocationError, Phase, PublishOptions, ReconnectPolicy, RegisterOptions,
    Registration, Session, SubscribeOptions, Subscription,
};
pub use transport::{Connector, Endpoint, Format, Link, LinkEvent};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// WAMP protocol version spoken
pub const PROTOCOL_VERSION: &str = "2";
