//! Transport layer for WAMP sessions.
//!
//! A [`Connector`] opens a [`Link`]: a bidirectional, message-oriented pipe
//! that carries decoded [`Message`]s. Framing and serialization live entirely
//! inside the connector; the session engine only sees messages and
//! [`LinkEvent`]s.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │            Session engine               │
//! │         (Transport-Agnostic)            │
//! └──────────────────┬──────────────────────┘
//!                    │ Link
//!       ┌────────────┼─────────────┐
//!       ▼            ▼             ▼
//! ┌───────────┐ ┌───────────┐ ┌───────────┐
//! │ WebSocket │ │ RawSocket │ │  Memory   │
//! │  ws://    │ │  tcp://   │ │ memory:// │
//! └───────────┘ └───────────┘ └───────────┘
//! ```
//!
//! Each wire connector runs a reader task and a writer task per link.
//! Dropping the [`Link`] closes the writer's queue, which closes the socket.

mod memory;
mod tcp;
mod websocket;

pub use memory::{channel, MemoryConnector, MemoryListener, MemoryPeer, PeerSender};
pub use tcp::{rawsocket, RawSocketConnector};
pub use websocket::WebSocketConnector;

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;

use http::Uri;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{Result, WampError};
use crate::protocol::{Message, SUBPROTOCOL_JSON, SUBPROTOCOL_MSGPACK};

/// Serialization format negotiated with the router.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    /// JSON arrays (default)
    #[default]
    Json,
    /// MessagePack (memory transport only)
    #[serde(rename = "msgpack")]
    MsgPack,
}

impl Format {
    /// Short name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::MsgPack => "msgpack",
        }
    }

    /// WebSocket subprotocol for this format
    pub fn subprotocol(&self) -> &'static str {
        match self {
            Self::Json => SUBPROTOCOL_JSON,
            Self::MsgPack => SUBPROTOCOL_MSGPACK,
        }
    }

    /// RawSocket serializer id
    pub fn rawsocket_id(&self) -> u8 {
        match self {
            Self::Json => 1,
            Self::MsgPack => 2,
        }
    }

    /// Encode a message for a wire transport
    pub fn encode(&self, message: &Message) -> Result<String> {
        match self {
            Self::Json => message.to_json(),
            Self::MsgPack => Err(unsupported_format(*self)),
        }
    }

    /// Decode a message received on a wire transport
    pub fn decode(&self, bytes: &[u8]) -> Result<Message> {
        match self {
            Self::Json => Message::from_value(serde_json::from_slice(bytes)?),
            Self::MsgPack => Err(unsupported_format(*self)),
        }
    }
}

fn unsupported_format(format: Format) -> WampError {
    WampError::Config(format!(
        "serializer '{format}' is not supported on wire transports"
    ))
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Format {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "msgpack" | "messagepack" => Ok(Self::MsgPack),
            _ => Err(format!("Unknown serialization format: {}", s)),
        }
    }
}

/// Router endpoint, e.g. `ws://127.0.0.1:8080/wamp` or `tcp://host:8081`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    uri: Uri,
}

impl Endpoint {
    /// Parse an endpoint URI; it must carry a scheme and a host.
    pub fn parse(s: &str) -> Result<Self> {
        let uri: Uri = s
            .parse()
            .map_err(|e| WampError::Config(format!("invalid endpoint '{s}': {e}")))?;
        if uri.scheme_str().is_none() || uri.host().is_none() {
            return Err(WampError::Config(format!(
                "endpoint '{s}' needs a scheme and a host"
            )));
        }
        Ok(Self { uri })
    }

    /// URI scheme (`ws`, `wss`, `tcp`, `rs`, `memory`)
    pub fn scheme(&self) -> &str {
        self.uri.scheme_str().unwrap_or_default()
    }

    /// Host name or address
    pub fn host(&self) -> &str {
        self.uri.host().unwrap_or_default()
    }

    /// Port, defaulting per scheme
    pub fn port(&self) -> u16 {
        self.uri.port_u16().unwrap_or(match self.scheme() {
            "wss" => 443,
            "tcp" | "rs" => 8081,
            _ => 80,
        })
    }

    /// Underlying URI
    pub fn uri(&self) -> &Uri {
        &self.uri
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.uri)
    }
}

impl FromStr for Endpoint {
    type Err = WampError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Something that happened on a link.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// A decoded message arrived
    Message(Message),
    /// The peer closed the link cleanly
    Closed,
    /// The link failed
    Failed(String),
}

/// An open transport connection carrying WAMP messages.
#[derive(Debug)]
pub struct Link {
    endpoint: Endpoint,
    format: Format,
    outbound: Outbound,
    inbound: mpsc::UnboundedReceiver<LinkEvent>,
}

#[derive(Debug)]
enum Outbound {
    /// Message values, for in-process peers
    Messages(mpsc::UnboundedSender<Message>),
    /// Serialized text, at most `max_len` octets per message
    Encoded {
        tx: mpsc::UnboundedSender<String>,
        max_len: usize,
    },
}

/// The transport side of a [`Link`], driven by connector tasks.
///
/// Wire connectors use `LinkIo<String>`: messages arrive already encoded and
/// within the peer's length limit.
#[derive(Debug)]
pub struct LinkIo<T = Message> {
    /// What the session wants sent
    pub outgoing: mpsc::UnboundedReceiver<T>,
    /// Where to report inbound messages and link state
    pub incoming: mpsc::UnboundedSender<LinkEvent>,
}

impl Link {
    /// Create a link carrying message values and the transport half that serves it
    pub fn channel(endpoint: Endpoint, format: Format) -> (Self, LinkIo) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (link, incoming) = Self::with_outbound(endpoint, format, Outbound::Messages(out_tx));
        (
            link,
            LinkIo {
                outgoing: out_rx,
                incoming,
            },
        )
    }

    /// Create a link that serializes in [`Link::send`], refusing messages
    /// longer than `max_len` octets.
    pub fn encoded(endpoint: Endpoint, format: Format, max_len: usize) -> (Self, LinkIo<String>) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let outbound = Outbound::Encoded { tx: out_tx, max_len };
        let (link, incoming) = Self::with_outbound(endpoint, format, outbound);
        (
            link,
            LinkIo {
                outgoing: out_rx,
                incoming,
            },
        )
    }

    fn with_outbound(
        endpoint: Endpoint,
        format: Format,
        outbound: Outbound,
    ) -> (Self, mpsc::UnboundedSender<LinkEvent>) {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let link = Self {
            endpoint,
            format,
            outbound,
            inbound: in_rx,
        };
        (link, in_tx)
    }

    /// Remote endpoint
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Negotiated format
    pub fn format(&self) -> Format {
        self.format
    }

    /// Queue a message for sending.
    ///
    /// On an encoded link the message is serialized here, so a message that
    /// cannot be encoded or exceeds the peer's limit fails this call with
    /// [`WampError::InvalidMessage`] and nothing is queued.
    pub fn send(&self, message: Message) -> Result<()> {
        let queued = match &self.outbound {
            Outbound::Messages(tx) => tx.send(message).is_ok(),
            Outbound::Encoded { tx, max_len } => {
                let text = self.format.encode(&message).map_err(|e| {
                    WampError::InvalidMessage(format!("cannot encode {}: {e}", message.kind()))
                })?;
                if text.len() > *max_len {
                    return Err(WampError::InvalidMessage(format!(
                        "{} of {} octets exceeds the peer limit of {} octets",
                        message.kind(),
                        text.len(),
                        max_len
                    )));
                }
                tx.send(text).is_ok()
            },
        };
        if queued {
            Ok(())
        } else {
            Err(WampError::TransportFailure("link writer is gone".to_string()))
        }
    }

    /// Next inbound event; a vanished transport reads as a failure
    pub async fn recv(&mut self) -> LinkEvent {
        self.inbound
            .recv()
            .await
            .unwrap_or_else(|| LinkEvent::Failed("transport tasks ended".to_string()))
    }
}

/// Boxed future returned by [`Connector::open`]
pub type OpenFuture<'a> = Pin<Box<dyn Future<Output = Result<Link>> + Send + 'a>>;

/// Opens links to router endpoints.
///
/// Implementations own framing and serialization for one transport family.
pub trait Connector: Send + Sync {
    /// Open a link to `endpoint` using `format`.
    fn open(&self, endpoint: &Endpoint, format: Format) -> OpenFuture<'_>;

    /// Connector name for logging.
    fn name(&self) -> &'static str;
}

/// Picks the wire connector from the endpoint scheme.
#[derive(Debug, Clone, Default)]
pub struct DefaultConnector {
    websocket: WebSocketConnector,
    rawsocket: RawSocketConnector,
}

impl Connector for DefaultConnector {
    fn open(&self, endpoint: &Endpoint, format: Format) -> OpenFuture<'_> {
        match endpoint.scheme() {
            "ws" | "wss" => self.websocket.open(endpoint, format),
            "tcp" | "rs" => self.rawsocket.open(endpoint, format),
            other => {
                let err = WampError::Config(format!("unsupported endpoint scheme '{other}'"));
                Box::pin(async move { Err(err) })
            },
        }
    }

    fn name(&self) -> &'static str {
        "default"
    }
}
