//! Peer roles announced during the HELLO/WELCOME handshake.
//!
//! The client advertises which of the four client roles it implements; the
//! router answers with the broker and/or dealer role in WELCOME details.
//! Anything else in the details maps is opaque and passed through.

use serde_json::{json, Value};

use super::message::Dict;

/// Default `agent` string sent in HELLO
pub const DEFAULT_AGENT: &str = concat!("wamp-core/", env!("CARGO_PKG_VERSION"));

/// Client roles advertised in HELLO
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientRoles {
    /// Can publish events
    pub publisher: bool,
    /// Can subscribe to topics
    pub subscriber: bool,
    /// Can call procedures
    pub caller: bool,
    /// Can register procedures
    pub callee: bool,
}

impl Default for ClientRoles {
    fn default() -> Self {
        Self {
            publisher: true,
            subscriber: true,
            caller: true,
            callee: true,
        }
    }
}

impl ClientRoles {
    /// Roles as the HELLO `roles` dictionary
    pub fn to_dict(self) -> Dict {
        let mut roles = Dict::new();
        for (name, enabled) in [
            ("publisher", self.publisher),
            ("subscriber", self.subscriber),
            ("caller", self.caller),
            ("callee", self.callee),
        ] {
            if enabled {
                roles.insert(name.to_string(), json!({}));
            }
        }
        roles
    }

    /// Build HELLO details: caller details first, then `agent` and `roles`
    /// unless the caller already set them.
    pub fn hello_details(self, agent: &str, extra: &Dict) -> Dict {
        let mut details = extra.clone();
        details
            .entry("agent")
            .or_insert_with(|| Value::String(agent.to_string()));
        details
            .entry("roles")
            .or_insert_with(|| Value::Object(self.to_dict()));
        details
    }
}

/// Router roles found in WELCOME details
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterRoles {
    /// Router acts as broker (pub/sub)
    pub broker: bool,
    /// Router acts as dealer (RPC)
    pub dealer: bool,
}

impl RouterRoles {
    /// Read roles from WELCOME details
    pub fn from_details(details: &Dict) -> Self {
        let roles = details.get("roles").and_then(Value::as_object);
        let has = |name: &str| roles.is_some_and(|r| r.contains_key(name));
        Self {
            broker: has("broker"),
            dealer: has("dealer"),
        }
    }
}
