//! WAMP client error types.
//!
//! Errors fall into two groups:
//!
//! - **Delivered** errors reach exactly one waiting caller: `OperationFailed`
//!   for a router ERROR, `Cancelled` when the engine gives up on a request,
//!   `HandshakeRejected` for an ABORT during the handshake, and
//!   `TransportFailure` once reconnection is exhausted.
//! - **Logged** errors never reach a caller: `ProtocolAnomaly` (a response for
//!   an unknown or mismatched request) and `HandlerFault` (an event handler
//!   failed). The engine keeps processing after both.

use std::fmt;

use thiserror::Error;

use crate::protocol::{Dict, Payload};

/// Why a pending operation was resolved without a router response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The engine stopped (all handles dropped or the engine task ended).
    Shutdown,
    /// The caller disconnected the connection.
    Disconnected,
    /// The per-request timeout elapsed.
    Timeout,
    /// The session ended under the request (peer GOODBYE/ABORT or transport loss).
    SessionLost,
    /// The session was closed locally.
    SessionClosed,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shutdown => write!(f, "engine shut down"),
            Self::Disconnected => write!(f, "connection disconnected"),
            Self::Timeout => write!(f, "request timed out"),
            Self::SessionLost => write!(f, "session lost"),
            Self::SessionClosed => write!(f, "session closed"),
        }
    }
}

/// WAMP client errors.
#[derive(Error, Debug)]
pub enum WampError {
    /// The transport could not be established or was lost.
    #[error("Transport failure: {0}")]
    TransportFailure(String),

    /// The router declined the session (ABORT during handshake).
    #[error("Handshake rejected: {reason}")]
    HandshakeRejected {
        /// ABORT reason URI.
        reason: String,
        /// ABORT details.
        details: Dict,
    },

    /// A response carried an unknown or mismatched request id.
    #[error("Protocol anomaly: {0}")]
    ProtocolAnomaly(String),

    /// The router answered a correlated request with ERROR.
    #[error("Operation failed: {error}")]
    OperationFailed {
        /// Error URI.
        error: String,
        /// ERROR details.
        details: Dict,
        /// Error arguments.
        payload: Payload,
    },

    /// The request was resolved locally without a result.
    #[error("Cancelled: {0}")]
    Cancelled(CancelReason),

    /// A caller-supplied handler failed.
    #[error("Handler fault: {0}")]
    HandlerFault(String),

    /// The operation is not valid in the current connection phase.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A topic, procedure or realm is not a valid WAMP URI.
    #[error("Invalid URI: {0}")]
    InvalidUri(String),

    /// A message could not be decoded.
    #[error("Invalid message format: {0}")]
    InvalidMessage(String),

    /// Configuration error.
    #[error("Config error: {0}")]
    Config(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WampError {
    /// True for errors the reconnection supervisor may retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransportFailure(_) | Self::Io(_))
    }

    /// True if this is a cancellation for the given reason.
    pub fn is_cancelled(&self, reason: CancelReason) -> bool {
        matches!(self, Self::Cancelled(r) if *r == reason)
    }
}

/// Result type alias for WAMP operations
pub type Result<T> = std::result::Result<T, WampError>;

impl From<toml::de::Error> for WampError {
    fn from(err: toml::de::Error) -> Self {
        WampError::Config(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for WampError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        WampError::TransportFailure(err.to_string())
    }
}
