//! WAMP protocol messages, identifiers, roles and URI rules.
//!
//! This module is pure data: it knows how to build, encode and decode
//! messages but holds no connection or session state. The session engine in
//! [`crate::session`] drives the exchange.
//!
//! # Message Flow
//!
//! ```text
//! Client                              Router
//!    |                                   |
//!    |-------- HELLO (realm, roles) ---->|  Open a session
//!    |<------- WELCOME (session id) -----|  Session established
//!    |         or ABORT (reason)         |  or rejected
//!    |                                   |
//!    |-------- SUBSCRIBE / REGISTER ---->|  Correlated by request id
//!    |<------- SUBSCRIBED / REGISTERED --|
//!    |<------- EVENT / INVOCATION -------|  Notifications
//!    |-------- YIELD / ERROR ----------->|  Invocation outcome
//!    |                                   |
//!    |-------- GOODBYE ----------------->|  Close the session
//!    |<------- GOODBYE ------------------|
//! ```
//!
//! ## Correlated Requests
//!
//! | Request       | Success        | Failure |
//! |---------------|----------------|---------|
//! | `SUBSCRIBE`   | `SUBSCRIBED`   | `ERROR` |
//! | `UNSUBSCRIBE` | `UNSUBSCRIBED` | `ERROR` |
//! | `PUBLISH`     | `PUBLISHED` (when acknowledged) | `ERROR` |
//! | `REGISTER`    | `REGISTERED`   | `ERROR` |
//! | `UNREGISTER`  | `UNREGISTERED` | `ERROR` |
//! | `CALL`        | `RESULT`       | `ERROR` |
//!
//! # Usage
//!
//! ```rust
//! use wamp::protocol::{Message, Payload};
//!
//! let msg = Message::from_json(r#"[36, 1, 7, {}, ["hello"]]"#).unwrap();
//! assert_eq!(msg.payload(), Some(&Payload::with_args(["hello"])));
//! ```

mod ids;
mod message;
mod roles;
mod uri;

pub use ids::{is_valid_id, Id, IdGenerator, MAX_ID};
pub use message::{Dict, Message, MessageKind, Payload};
pub use roles::{ClientRoles, RouterRoles, DEFAULT_AGENT};
pub use uri::{
    validate, validate_registration, UriPolicy, UriRole, LOOSE_URI_PATTERN, RESERVED_PREFIX,
    STRICT_URI_PATTERN,
};

/// WebSocket subprotocol for the JSON serializer
pub const SUBPROTOCOL_JSON: &str = "wamp.2.json";

/// WebSocket subprotocol for the MessagePack serializer
pub const SUBPROTOCOL_MSGPACK: &str = "wamp.2.msgpack";

/// Well-known reason and error URIs
pub mod reasons {
    /// Normal close initiated by either side
    pub const CLOSE_NORMAL: &str = "wamp.close.normal";
    /// Local shutdown
    pub const SYSTEM_SHUTDOWN: &str = "wamp.close.system_shutdown";
    /// Reply to a peer-initiated GOODBYE
    pub const GOODBYE_AND_OUT: &str = "wamp.close.goodbye_and_out";
    /// Realm does not exist
    pub const NO_SUCH_REALM: &str = "wamp.error.no_such_realm";
    /// Handler failed without a more specific error
    pub const RUNTIME_ERROR: &str = "wamp.error.runtime_error";
    /// Invocation for a registration the callee does not hold
    pub const NO_SUCH_REGISTRATION: &str = "wamp.error.no_such_registration";
    /// Protocol violation by the peer
    pub const PROTOCOL_VIOLATION: &str = "wamp.error.protocol_violation";
    /// Procedure is not registered
    pub const NO_SUCH_PROCEDURE: &str = "wamp.error.no_such_procedure";
    /// Subscription does not exist
    pub const NO_SUCH_SUBSCRIPTION: &str = "wamp.error.no_such_subscription";
    /// Procedure already registered by another callee
    pub const PROCEDURE_ALREADY_EXISTS: &str = "wamp.error.procedure_already_exists";
}
