//! Outstanding correlated requests.

use std::collections::HashMap;
use std::fmt;

use crate::protocol::{Id, MessageKind};

/// Kind of a correlated request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    /// SUBSCRIBE
    Subscribe,
    /// UNSUBSCRIBE
    Unsubscribe,
    /// PUBLISH with acknowledgment
    Publish,
    /// REGISTER
    Register,
    /// UNREGISTER
    Unregister,
    /// CALL
    Call,
}

impl RequestKind {
    /// Request kind named by an ERROR's request type
    pub fn from_request_type(kind: MessageKind) -> Option<Self> {
        match kind {
            MessageKind::Subscribe => Some(Self::Subscribe),
            MessageKind::Unsubscribe => Some(Self::Unsubscribe),
            MessageKind::Publish => Some(Self::Publish),
            MessageKind::Register => Some(Self::Register),
            MessageKind::Unregister => Some(Self::Unregister),
            MessageKind::Call => Some(Self::Call),
            _ => None,
        }
    }

    /// Request kind answered by a success response
    pub fn answered_by(kind: MessageKind) -> Option<Self> {
        match kind {
            MessageKind::Subscribed => Some(Self::Subscribe),
            MessageKind::Unsubscribed => Some(Self::Unsubscribe),
            MessageKind::Published => Some(Self::Publish),
            MessageKind::Registered => Some(Self::Register),
            MessageKind::Unregistered => Some(Self::Unregister),
            MessageKind::Result => Some(Self::Call),
            _ => None,
        }
    }

    /// Message type of the request
    pub fn message_kind(self) -> MessageKind {
        match self {
            Self::Subscribe => MessageKind::Subscribe,
            Self::Unsubscribe => MessageKind::Unsubscribe,
            Self::Publish => MessageKind::Publish,
            Self::Register => MessageKind::Register,
            Self::Unregister => MessageKind::Unregister,
            Self::Call => MessageKind::Call,
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message_kind())
    }
}

/// Outcome of looking up a response's request id.
#[derive(Debug)]
pub enum Lookup<T> {
    /// Entry matched and was removed
    Found(T),
    /// No entry with that id
    Unknown,
    /// An entry exists but for another kind; it stays in the table
    KindMismatch(RequestKind),
}

/// Request id → (kind, continuation). At most one entry per id.
#[derive(Debug)]
pub struct PendingRequestTable<T> {
    entries: HashMap<Id, (RequestKind, T)>,
}

impl<T> Default for PendingRequestTable<T> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<T> PendingRequestTable<T> {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a request; gives the value back if `id` is already taken
    pub fn insert(&mut self, id: Id, kind: RequestKind, value: T) -> Result<(), T> {
        if self.entries.contains_key(&id) {
            return Err(value);
        }
        self.entries.insert(id, (kind, value));
        Ok(())
    }

    /// Remove the entry for a response of `kind`
    pub fn take(&mut self, id: Id, kind: RequestKind) -> Lookup<T> {
        match self.entries.get(&id) {
            None => Lookup::Unknown,
            Some((recorded, _)) if *recorded != kind => Lookup::KindMismatch(*recorded),
            Some(_) => match self.entries.remove(&id) {
                Some((_, value)) => Lookup::Found(value),
                None => Lookup::Unknown,
            },
        }
    }

    /// Remove an entry regardless of kind
    pub fn remove(&mut self, id: Id) -> Option<(RequestKind, T)> {
        self.entries.remove(&id)
    }

    /// Remove every entry
    pub fn drain(&mut self) -> impl Iterator<Item = (Id, RequestKind, T)> + '_ {
        self.entries
            .drain()
            .map(|(id, (kind, value))| (id, kind, value))
    }

    /// True if `id` is outstanding
    pub fn contains(&self, id: Id) -> bool {
        self.entries.contains_key(&id)
    }

    /// Number of outstanding requests
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if nothing is outstanding
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
