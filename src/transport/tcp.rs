//! RawSocket transport over TCP (`tcp://`, `rs://`).
//!
//! # Handshake
//!
//! ```text
//! Client -> Router: 0x7F | LLLL SSSS | 0x00 | 0x00
//! Router -> Client: 0x7F | LLLL SSSS | 0x00 | 0x00   (accepted)
//!                   0x7F | EEEE 0000 | 0x00 | 0x00   (error EEEE)
//! ```
//!
//! `LLLL` is the maximum message length the sender accepts, as `2^(9+L)`;
//! `SSSS` the serializer (1 JSON, 2 MessagePack).
//!
//! # Frames
//!
//! Every frame starts with a 4-octet header: 5 reserved bits, a 3-bit frame
//! type (0 message, 1 ping, 2 pong) and a 24-bit big-endian payload length.

use tokio::net::TcpStream;
use tokio::sync::mpsc;

use super::{Connector, Endpoint, Format, Link, LinkEvent, LinkIo, OpenFuture};
use crate::error::{Result, WampError};

/// RawSocket framing primitives, shared by the connector and test routers.
pub mod rawsocket {
    use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

    /// First handshake octet
    pub const MAGIC: u8 = 0x7F;

    /// Largest length exponent (2^24 octets)
    pub const MAX_LENGTH_EXP: u8 = 0x0F;

    /// Frame types
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum FrameKind {
        /// WAMP message
        Message,
        /// Ping, echoed back as pong
        Ping,
        /// Pong
        Pong,
    }

    impl FrameKind {
        fn code(self) -> u8 {
            match self {
                Self::Message => 0,
                Self::Ping => 1,
                Self::Pong => 2,
            }
        }

        fn from_code(code: u8) -> Option<Self> {
            match code {
                0 => Some(Self::Message),
                1 => Some(Self::Ping),
                2 => Some(Self::Pong),
                _ => None,
            }
        }
    }

    /// Maximum message length for a length exponent
    pub fn max_length(exp: u8) -> usize {
        1 << (9 + u32::from(exp.min(MAX_LENGTH_EXP)))
    }

    /// Handshake octets for a serializer and length exponent
    pub fn handshake(serializer: u8, length_exp: u8) -> [u8; 4] {
        [MAGIC, (length_exp.min(MAX_LENGTH_EXP) << 4) | (serializer & 0x0F), 0, 0]
    }

    /// Handshake error reply with `code` in the upper nibble
    pub fn handshake_error(code: u8) -> [u8; 4] {
        [MAGIC, (code & 0x0F) << 4, 0, 0]
    }

    /// Describe a router handshake error code
    pub fn describe_error(code: u8) -> &'static str {
        match code {
            1 => "serializer unsupported",
            2 => "maximum message length unacceptable",
            3 => "use of reserved bits",
            4 => "maximum connection count reached",
            _ => "unknown error",
        }
    }

    /// Write one frame
    pub async fn write_frame<W: AsyncWrite + Unpin>(
        writer: &mut W,
        kind: FrameKind,
        payload: &[u8],
    ) -> std::io::Result<()> {
        let len = payload.len();
        if len >= 1 << 24 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("frame of {len} octets exceeds the 24-bit length field"),
            ));
        }
        let header = (u32::from(kind.code()) << 24) | len as u32;
        writer.write_all(&header.to_be_bytes()).await?;
        writer.write_all(payload).await?;
        writer.flush().await
    }

    /// Read one frame, refusing payloads longer than `max_len`
    pub async fn read_frame<R: AsyncRead + Unpin>(
        reader: &mut R,
        max_len: usize,
    ) -> std::io::Result<(FrameKind, Vec<u8>)> {
        let mut header = [0u8; 4];
        reader.read_exact(&mut header).await?;
        let kind = FrameKind::from_code(header[0] & 0x07).ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unknown frame type {}", header[0] & 0x07),
            )
        })?;
        let len = u32::from_be_bytes([0, header[1], header[2], header[3]]) as usize;
        if len > max_len {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("frame of {len} octets exceeds limit {max_len}"),
            ));
        }
        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload).await?;
        Ok((kind, payload))
    }
}

use rawsocket::FrameKind;

/// RawSocket connector.
#[derive(Debug, Clone)]
pub struct RawSocketConnector {
    /// Maximum inbound message length exponent announced to the router
    length_exp: u8,
}

impl RawSocketConnector {
    /// Create a connector accepting messages up to `2^(9+length_exp)` octets.
    pub fn new(length_exp: u8) -> Self {
        Self {
            length_exp: length_exp.min(rawsocket::MAX_LENGTH_EXP),
        }
    }
}

impl Default for RawSocketConnector {
    fn default() -> Self {
        Self::new(rawsocket::MAX_LENGTH_EXP)
    }
}

impl Connector for RawSocketConnector {
    fn open(&self, endpoint: &Endpoint, format: Format) -> OpenFuture<'_> {
        let endpoint = endpoint.clone();
        let length_exp = self.length_exp;
        Box::pin(async move { connect(endpoint, format, length_exp).await })
    }

    fn name(&self) -> &'static str {
        "rawsocket"
    }
}

async fn connect(endpoint: Endpoint, format: Format, length_exp: u8) -> Result<Link> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    if format != Format::Json {
        return Err(super::unsupported_format(format));
    }

    let addr = format!("{}:{}", endpoint.host(), endpoint.port());
    let mut stream = TcpStream::connect(&addr)
        .await
        .map_err(|e| WampError::TransportFailure(format!("Failed to connect to {}: {}", addr, e)))?;
    stream.set_nodelay(true)?;

    stream
        .write_all(&rawsocket::handshake(format.rawsocket_id(), length_exp))
        .await?;
    let mut reply = [0u8; 4];
    stream
        .read_exact(&mut reply)
        .await
        .map_err(|e| WampError::TransportFailure(format!("RawSocket handshake: {e}")))?;

    if reply[0] != rawsocket::MAGIC {
        return Err(WampError::TransportFailure(format!(
            "peer at {addr} is not a RawSocket router"
        )));
    }
    if reply[1] & 0x0F == 0 {
        let code = reply[1] >> 4;
        return Err(WampError::TransportFailure(format!(
            "router refused RawSocket handshake: {}",
            rawsocket::describe_error(code)
        )));
    }
    if reply[1] & 0x0F != format.rawsocket_id() {
        return Err(WampError::TransportFailure(format!(
            "router answered with serializer {}",
            reply[1] & 0x0F
        )));
    }

    let outbound_max = rawsocket::max_length(reply[1] >> 4);
    let inbound_max = rawsocket::max_length(length_exp);
    tracing::debug!(
        "RawSocket link open to {} (out max {}, in max {})",
        addr,
        outbound_max,
        inbound_max
    );

    // the 24-bit length field caps frames just below 2^24 octets
    let (link, io) = Link::encoded(endpoint, format, outbound_max.min((1 << 24) - 1));
    let LinkIo {
        mut outgoing,
        incoming,
    } = io;
    let (mut reader, mut writer) = stream.into_split();
    let (pong_tx, mut pong_rx) = mpsc::unbounded_channel::<Vec<u8>>();

    let writer_events = incoming.clone();
    tokio::spawn(async move {
        loop {
            let (kind, payload) = tokio::select! {
                text = outgoing.recv() => match text {
                    Some(text) => (FrameKind::Message, text.into_bytes()),
                    None => break,
                },
                Some(ping) = pong_rx.recv() => (FrameKind::Pong, ping),
            };
            if let Err(e) = rawsocket::write_frame(&mut writer, kind, &payload).await {
                let _ = writer_events.send(LinkEvent::Failed(format!("RawSocket write: {e}")));
                return;
            }
        }
        let _ = writer.shutdown().await;
    });

    tokio::spawn(async move {
        loop {
            let event = match rawsocket::read_frame(&mut reader, inbound_max).await {
                Ok((FrameKind::Message, payload)) => match format.decode(&payload) {
                    Ok(message) => LinkEvent::Message(message),
                    Err(e) => LinkEvent::Failed(format!("undecodable message: {e}")),
                },
                Ok((FrameKind::Ping, payload)) => {
                    let _ = pong_tx.send(payload);
                    continue;
                },
                Ok((FrameKind::Pong, _)) => continue,
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => LinkEvent::Closed,
                Err(e) => LinkEvent::Failed(format!("RawSocket read: {e}")),
            };
            let terminal = !matches!(event, LinkEvent::Message(_));
            if incoming.send(event).is_err() || terminal {
                return;
            }
        }
    });

    Ok(link)
}
