//! WebSocket transport (`ws://`, `wss://`).
//!
//! Negotiates the `wamp.2.<format>` subprotocol and carries one message per
//! text frame.

use futures::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as Frame;
use tokio_tungstenite::connect_async;

use super::{Connector, Endpoint, Format, Link, LinkEvent, LinkIo, OpenFuture};
use crate::error::{Result, WampError};

/// WebSocket connector built on `tokio-tungstenite`.
#[derive(Debug, Clone, Default)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    /// Create a new WebSocket connector.
    pub fn new() -> Self {
        Self
    }
}

impl Connector for WebSocketConnector {
    fn open(&self, endpoint: &Endpoint, format: Format) -> OpenFuture<'_> {
        let endpoint = endpoint.clone();
        Box::pin(async move { connect(endpoint, format).await })
    }

    fn name(&self) -> &'static str {
        "websocket"
    }
}

async fn connect(endpoint: Endpoint, format: Format) -> Result<Link> {
    if format != Format::Json {
        return Err(super::unsupported_format(format));
    }

    let mut request = endpoint.to_string().into_client_request()?;
    request.headers_mut().insert(
        SEC_WEBSOCKET_PROTOCOL,
        HeaderValue::from_static(format.subprotocol()),
    );

    let (ws, response) = connect_async(request)
        .await
        .map_err(|e| WampError::TransportFailure(format!("WebSocket connect to {endpoint}: {e}")))?;

    let agreed = response
        .headers()
        .get(SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok());
    if agreed != Some(format.subprotocol()) {
        return Err(WampError::TransportFailure(format!(
            "router did not accept subprotocol {}",
            format.subprotocol()
        )));
    }

    tracing::debug!("WebSocket link open to {}", endpoint);

    let (link, io) = Link::encoded(endpoint, format, usize::MAX);
    let LinkIo {
        mut outgoing,
        incoming,
    } = io;
    let (mut sink, mut stream) = ws.split();

    let writer_events = incoming.clone();
    tokio::spawn(async move {
        while let Some(text) = outgoing.recv().await {
            if let Err(e) = sink.send(Frame::Text(text.into())).await {
                let _ = writer_events.send(LinkEvent::Failed(format!("WebSocket write: {e}")));
                return;
            }
        }
        let _ = sink.close().await;
    });

    tokio::spawn(async move {
        while let Some(frame) = stream.next().await {
            let event = match frame {
                Ok(Frame::Text(text)) => match format.decode(text.as_bytes()) {
                    Ok(message) => LinkEvent::Message(message),
                    Err(e) => LinkEvent::Failed(format!("undecodable message: {e}")),
                },
                Ok(Frame::Binary(_)) => {
                    LinkEvent::Failed("binary frame on a text subprotocol".to_string())
                },
                Ok(Frame::Close(_)) => LinkEvent::Closed,
                Ok(_) => continue,
                Err(e) => LinkEvent::Failed(format!("WebSocket read: {e}")),
            };
            let terminal = !matches!(event, LinkEvent::Message(_));
            if incoming.send(event).is_err() || terminal {
                return;
            }
        }
        let _ = incoming.send(LinkEvent::Closed);
    });

    Ok(link)
}
