//! In-process transport (`memory://`).
//!
//! Links exchange [`Message`] values directly, so any [`Format`] is accepted.
//! Used by embedders that host a router in the same process, and by tests.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use super::{Connector, Endpoint, Format, Link, LinkEvent, OpenFuture};
use crate::error::WampError;
use crate::protocol::Message;

#[derive(Debug, Default)]
struct Shared {
    attempts: AtomicU32,
    refusing: AtomicBool,
}

/// Create a connected connector/listener pair
pub fn channel() -> (MemoryConnector, MemoryListener) {
    let (tx, rx) = mpsc::unbounded_channel();
    let shared = Arc::new(Shared::default());
    (
        MemoryConnector {
            accept: tx,
            shared,
        },
        MemoryListener { incoming: rx },
    )
}

/// Connector half: every `open` hands a new peer to the listener.
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    accept: mpsc::UnboundedSender<MemoryPeer>,
    shared: Arc<Shared>,
}

impl MemoryConnector {
    /// Number of `open` calls so far, successful or not
    pub fn attempts(&self) -> u32 {
        self.shared.attempts.load(Ordering::SeqCst)
    }

    /// Make subsequent `open` calls fail (or succeed again)
    pub fn refuse_connections(&self, refuse: bool) {
        self.shared.refusing.store(refuse, Ordering::SeqCst);
    }
}

impl Connector for MemoryConnector {
    fn open(&self, endpoint: &Endpoint, format: Format) -> OpenFuture<'_> {
        self.shared.attempts.fetch_add(1, Ordering::SeqCst);
        let result = if self.shared.refusing.load(Ordering::SeqCst) {
            Err(WampError::TransportFailure(format!(
                "{endpoint} refused the connection"
            )))
        } else {
            let (link, io) = Link::channel(endpoint.clone(), format);
            let peer = MemoryPeer {
                format,
                from_client: io.outgoing,
                to_client: io.incoming,
            };
            self.accept
                .send(peer)
                .map(|()| link)
                .map_err(|_| WampError::TransportFailure(format!("nothing listens on {endpoint}")))
        };
        Box::pin(async move { result })
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Listener half.
#[derive(Debug)]
pub struct MemoryListener {
    incoming: mpsc::UnboundedReceiver<MemoryPeer>,
}

impl MemoryListener {
    /// Wait for the next client link; `None` once every connector is gone
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.incoming.recv().await
    }
}

/// The router side of one memory link.
#[derive(Debug)]
pub struct MemoryPeer {
    format: Format,
    from_client: mpsc::UnboundedReceiver<Message>,
    to_client: mpsc::UnboundedSender<LinkEvent>,
}

impl MemoryPeer {
    /// Format the client asked for
    pub fn format(&self) -> Format {
        self.format
    }

    /// Next message from the client; `None` when the client dropped the link
    pub async fn recv(&mut self) -> Option<Message> {
        self.from_client.recv().await
    }

    /// Deliver a message to the client; false if the client is gone
    pub fn send(&self, message: Message) -> bool {
        self.to_client.send(LinkEvent::Message(message)).is_ok()
    }

    /// A handle for sending to this client from elsewhere
    pub fn sender(&self) -> PeerSender {
        PeerSender {
            tx: self.to_client.clone(),
        }
    }

    /// Close the link cleanly
    pub fn close(self) {
        let _ = self.to_client.send(LinkEvent::Closed);
    }

    /// Fail the link
    pub fn fail(self, reason: &str) {
        let _ = self.to_client.send(LinkEvent::Failed(reason.to_string()));
    }
}

/// Cloneable sender towards one memory client.
#[derive(Debug, Clone)]
pub struct PeerSender {
    tx: mpsc::UnboundedSender<LinkEvent>,
}

impl PeerSender {
    /// Deliver a message; false if the client is gone
    pub fn send(&self, message: Message) -> bool {
        self.tx.send(LinkEvent::Message(message)).is_ok()
    }
}
