//! Protocol messages for WAMP communication.
//!
//! Messages are modelled as one enum with a variant per message type. The JSON
//! wire format is the WAMP array form: `[TYPE, field, field, ...]`, with the
//! optional `args`/`kwargs` payload appended last.

use std::convert::TryFrom;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::ids::{is_valid_id, Id};
use crate::error::{Result, WampError};

/// WAMP dictionary (details, options, kwargs).
pub type Dict = serde_json::Map<String, Value>;

/// Message type codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u64)]
pub enum MessageKind {
    /// Open a session
    Hello = 1,
    /// Session accepted
    Welcome = 2,
    /// Session rejected or aborted
    Abort = 3,
    /// Session closing
    Goodbye = 6,
    /// Error response to a request
    Error = 8,
    /// Publish to a topic
    Publish = 16,
    /// Publication acknowledged
    Published = 17,
    /// Subscribe to a topic
    Subscribe = 32,
    /// Subscription acknowledged
    Subscribed = 33,
    /// Remove a subscription
    Unsubscribe = 34,
    /// Unsubscription acknowledged
    Unsubscribed = 35,
    /// Event delivered to a subscriber
    Event = 36,
    /// Call a procedure
    Call = 48,
    /// Call result
    Result = 50,
    /// Register a procedure
    Register = 64,
    /// Registration acknowledged
    Registered = 65,
    /// Remove a registration
    Unregister = 66,
    /// Unregistration acknowledged
    Unregistered = 67,
    /// Call delivered to a callee
    Invocation = 68,
    /// Callee's result
    Yield = 70,
}

impl MessageKind {
    /// Numeric wire code
    pub fn code(self) -> u64 {
        self as u64
    }

    /// Upper-case protocol name, for logs
    pub fn name(self) -> &'static str {
        match self {
            Self::Hello => "HELLO",
            Self::Welcome => "WELCOME",
            Self::Abort => "ABORT",
            Self::Goodbye => "GOODBYE",
            Self::Error => "ERROR",
            Self::Publish => "PUBLISH",
            Self::Published => "PUBLISHED",
            Self::Subscribe => "SUBSCRIBE",
            Self::Subscribed => "SUBSCRIBED",
            Self::Unsubscribe => "UNSUBSCRIBE",
            Self::Unsubscribed => "UNSUBSCRIBED",
            Self::Event => "EVENT",
            Self::Call => "CALL",
            Self::Result => "RESULT",
            Self::Register => "REGISTER",
            Self::Registered => "REGISTERED",
            Self::Unregister => "UNREGISTER",
            Self::Unregistered => "UNREGISTERED",
            Self::Invocation => "INVOCATION",
            Self::Yield => "YIELD",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl TryFrom<u64> for MessageKind {
    type Error = WampError;

    fn try_from(code: u64) -> Result<Self> {
        Ok(match code {
            1 => Self::Hello,
            2 => Self::Welcome,
            3 => Self::Abort,
            6 => Self::Goodbye,
            8 => Self::Error,
            16 => Self::Publish,
            17 => Self::Published,
            32 => Self::Subscribe,
            33 => Self::Subscribed,
            34 => Self::Unsubscribe,
            35 => Self::Unsubscribed,
            36 => Self::Event,
            48 => Self::Call,
            50 => Self::Result,
            64 => Self::Register,
            65 => Self::Registered,
            66 => Self::Unregister,
            67 => Self::Unregistered,
            68 => Self::Invocation,
            70 => Self::Yield,
            other => {
                return Err(WampError::InvalidMessage(format!(
                    "unknown message type {other}"
                )))
            },
        })
    }
}

/// Application payload: positional and keyword arguments
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    /// Positional arguments
    #[serde(default)]
    pub args: Vec<Value>,
    /// Keyword arguments
    #[serde(default)]
    pub kwargs: Dict,
}

impl Payload {
    /// Empty payload
    pub fn new() -> Self {
        Self::default()
    }

    /// Payload with positional arguments
    pub fn with_args<I, V>(args: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
            kwargs: Dict::new(),
        }
    }

    /// Add a keyword argument
    pub fn kwarg(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.kwargs.insert(key.to_string(), value.into());
        self
    }

    /// True if there are no arguments at all
    pub fn is_empty(&self) -> bool {
        self.args.is_empty() && self.kwargs.is_empty()
    }

    /// Positional argument at `index`
    pub fn arg(&self, index: usize) -> Option<&Value> {
        self.args.get(index)
    }

    /// Deserialize the keyword arguments into a typed value
    pub fn kwargs_as<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(Value::Object(self.kwargs.clone()))?)
    }

    fn append_to(&self, fields: &mut Vec<Value>) {
        if !self.kwargs.is_empty() {
            fields.push(Value::Array(self.args.clone()));
            fields.push(Value::Object(self.kwargs.clone()));
        } else if !self.args.is_empty() {
            fields.push(Value::Array(self.args.clone()));
        }
    }
}

/// A WAMP protocol message
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// `[HELLO, Realm|uri, Details|dict]`
    Hello {
        /// Realm to join
        realm: String,
        /// Roles and opaque handshake details
        details: Dict,
    },
    /// `[WELCOME, Session|id, Details|dict]`
    Welcome {
        /// Router-assigned session id
        session: Id,
        /// Router details
        details: Dict,
    },
    /// `[ABORT, Details|dict, Reason|uri]`
    Abort {
        /// Abort details
        details: Dict,
        /// Reason URI
        reason: String,
    },
    /// `[GOODBYE, Details|dict, Reason|uri]`
    Goodbye {
        /// Goodbye details
        details: Dict,
        /// Reason URI
        reason: String,
    },
    /// `[ERROR, REQUEST.Type|int, REQUEST.Request|id, Details|dict, Error|uri, Arguments?, ArgumentsKw?]`
    Error {
        /// Type of the request that failed
        request_type: MessageKind,
        /// Id of the request that failed
        request: Id,
        /// Error details
        details: Dict,
        /// Error URI
        error: String,
        /// Error arguments
        payload: Payload,
    },
    /// `[PUBLISH, Request|id, Options|dict, Topic|uri, Arguments?, ArgumentsKw?]`
    Publish {
        /// Request id
        request: Id,
        /// Publish options
        options: Dict,
        /// Topic URI
        topic: String,
        /// Event payload
        payload: Payload,
    },
    /// `[PUBLISHED, PUBLISH.Request|id, Publication|id]`
    Published {
        /// Request id of the PUBLISH
        request: Id,
        /// Publication id
        publication: Id,
    },
    /// `[SUBSCRIBE, Request|id, Options|dict, Topic|uri]`
    Subscribe {
        /// Request id
        request: Id,
        /// Subscribe options
        options: Dict,
        /// Topic URI or pattern
        topic: String,
    },
    /// `[SUBSCRIBED, SUBSCRIBE.Request|id, Subscription|id]`
    Subscribed {
        /// Request id of the SUBSCRIBE
        request: Id,
        /// Subscription id
        subscription: Id,
    },
    /// `[UNSUBSCRIBE, Request|id, SUBSCRIBED.Subscription|id]`
    Unsubscribe {
        /// Request id
        request: Id,
        /// Subscription id
        subscription: Id,
    },
    /// `[UNSUBSCRIBED, UNSUBSCRIBE.Request|id]`
    Unsubscribed {
        /// Request id of the UNSUBSCRIBE
        request: Id,
    },
    /// `[EVENT, SUBSCRIBED.Subscription|id, PUBLISHED.Publication|id, Details|dict, Arguments?, ArgumentsKw?]`
    Event {
        /// Subscription id
        subscription: Id,
        /// Publication id
        publication: Id,
        /// Event details
        details: Dict,
        /// Event payload
        payload: Payload,
    },
    /// `[CALL, Request|id, Options|dict, Procedure|uri, Arguments?, ArgumentsKw?]`
    Call {
        /// Request id
        request: Id,
        /// Call options
        options: Dict,
        /// Procedure URI
        procedure: String,
        /// Call arguments
        payload: Payload,
    },
    /// `[RESULT, CALL.Request|id, Details|dict, YIELD.Arguments?, YIELD.ArgumentsKw?]`
    Result {
        /// Request id of the CALL
        request: Id,
        /// Result details
        details: Dict,
        /// Result payload
        payload: Payload,
    },
    /// `[REGISTER, Request|id, Options|dict, Procedure|uri]`
    Register {
        /// Request id
        request: Id,
        /// Register options
        options: Dict,
        /// Procedure URI
        procedure: String,
    },
    /// `[REGISTERED, REGISTER.Request|id, Registration|id]`
    Registered {
        /// Request id of the REGISTER
        request: Id,
        /// Registration id
        registration: Id,
    },
    /// `[UNREGISTER, Request|id, REGISTERED.Registration|id]`
    Unregister {
        /// Request id
        request: Id,
        /// Registration id
        registration: Id,
    },
    /// `[UNREGISTERED, UNREGISTER.Request|id]`
    Unregistered {
        /// Request id of the UNREGISTER
        request: Id,
    },
    /// `[INVOCATION, Request|id, REGISTERED.Registration|id, Details|dict, CALL.Arguments?, CALL.ArgumentsKw?]`
    Invocation {
        /// Router-assigned invocation request id
        request: Id,
        /// Registration id
        registration: Id,
        /// Invocation details
        details: Dict,
        /// Call arguments
        payload: Payload,
    },
    /// `[YIELD, INVOCATION.Request|id, Options|dict, Arguments?, ArgumentsKw?]`
    Yield {
        /// Request id of the INVOCATION
        request: Id,
        /// Yield options
        options: Dict,
        /// Result payload
        payload: Payload,
    },
}

impl Message {
    /// Message type of this message
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Hello { .. } => MessageKind::Hello,
            Self::Welcome { .. } => MessageKind::Welcome,
            Self::Abort { .. } => MessageKind::Abort,
            Self::Goodbye { .. } => MessageKind::Goodbye,
            Self::Error { .. } => MessageKind::Error,
            Self::Publish { .. } => MessageKind::Publish,
            Self::Published { .. } => MessageKind::Published,
            Self::Subscribe { .. } => MessageKind::Subscribe,
            Self::Subscribed { .. } => MessageKind::Subscribed,
            Self::Unsubscribe { .. } => MessageKind::Unsubscribe,
            Self::Unsubscribed { .. } => MessageKind::Unsubscribed,
            Self::Event { .. } => MessageKind::Event,
            Self::Call { .. } => MessageKind::Call,
            Self::Result { .. } => MessageKind::Result,
            Self::Register { .. } => MessageKind::Register,
            Self::Registered { .. } => MessageKind::Registered,
            Self::Unregister { .. } => MessageKind::Unregister,
            Self::Unregistered { .. } => MessageKind::Unregistered,
            Self::Invocation { .. } => MessageKind::Invocation,
            Self::Yield { .. } => MessageKind::Yield,
        }
    }

    /// Request id carried by the message, if any
    pub fn request_id(&self) -> Option<Id> {
        match self {
            Self::Error { request, .. }
            | Self::Publish { request, .. }
            | Self::Published { request, .. }
            | Self::Subscribe { request, .. }
            | Self::Subscribed { request, .. }
            | Self::Unsubscribe { request, .. }
            | Self::Unsubscribed { request }
            | Self::Call { request, .. }
            | Self::Result { request, .. }
            | Self::Register { request, .. }
            | Self::Registered { request, .. }
            | Self::Unregister { request, .. }
            | Self::Unregistered { request }
            | Self::Invocation { request, .. }
            | Self::Yield { request, .. } => Some(*request),
            Self::Hello { .. }
            | Self::Welcome { .. }
            | Self::Abort { .. }
            | Self::Goodbye { .. }
            | Self::Event { .. } => None,
        }
    }

    /// Create a GOODBYE message
    pub fn goodbye(reason: &str) -> Self {
        Self::Goodbye {
            details: Dict::new(),
            reason: reason.to_string(),
        }
    }

    /// Create an ABORT message
    pub fn abort(reason: &str, message: &str) -> Self {
        let mut details = Dict::new();
        details.insert("message".to_string(), Value::String(message.to_string()));
        Self::Abort {
            details,
            reason: reason.to_string(),
        }
    }

    /// Create an ERROR response for a request
    pub fn error(request_type: MessageKind, request: Id, error: &str, payload: Payload) -> Self {
        Self::Error {
            request_type,
            request,
            details: Dict::new(),
            error: error.to_string(),
            payload,
        }
    }

    /// Encode into the WAMP JSON array form
    pub fn to_value(&self) -> Value {
        let code = json!(self.kind().code());
        let mut fields = match self {
            Self::Hello { realm, details } => vec![code, json!(realm), json!(details)],
            Self::Welcome { session, details } => vec![code, json!(session), json!(details)],
            Self::Abort { details, reason } | Self::Goodbye { details, reason } => {
                vec![code, json!(details), json!(reason)]
            },
            Self::Error {
                request_type,
                request,
                details,
                error,
                ..
            } => vec![
                code,
                json!(request_type.code()),
                json!(request),
                json!(details),
                json!(error),
            ],
            Self::Publish {
                request,
                options,
                topic,
                ..
            } => vec![code, json!(request), json!(options), json!(topic)],
            Self::Published {
                request,
                publication,
            } => vec![code, json!(request), json!(publication)],
            Self::Subscribe {
                request,
                options,
                topic,
            } => vec![code, json!(request), json!(options), json!(topic)],
            Self::Subscribed {
                request,
                subscription,
            }
            | Self::Unsubscribe {
                request,
                subscription,
            } => vec![code, json!(request), json!(subscription)],
            Self::Unsubscribed { request } | Self::Unregistered { request } => {
                vec![code, json!(request)]
            },
            Self::Event {
                subscription,
                publication,
                details,
                ..
            } => vec![code, json!(subscription), json!(publication), json!(details)],
            Self::Call {
                request,
                options,
                procedure,
                ..
            } => vec![code, json!(request), json!(options), json!(procedure)],
            Self::Result {
                request, details, ..
            } => vec![code, json!(request), json!(details)],
            Self::Register {
                request,
                options,
                procedure,
            } => vec![code, json!(request), json!(options), json!(procedure)],
            Self::Registered {
                request,
                registration,
            }
            | Self::Unregister {
                request,
                registration,
            } => vec![code, json!(request), json!(registration)],
            Self::Invocation {
                request,
                registration,
                details,
                ..
            } => vec![code, json!(request), json!(registration), json!(details)],
            Self::Yield {
                request, options, ..
            } => vec![code, json!(request), json!(options)],
        };

        if let Some(payload) = self.payload() {
            payload.append_to(&mut fields);
        }
        Value::Array(fields)
    }

    /// Payload carried by the message, if its type has one
    pub fn payload(&self) -> Option<&Payload> {
        match self {
            Self::Error { payload, .. }
            | Self::Publish { payload, .. }
            | Self::Event { payload, .. }
            | Self::Call { payload, .. }
            | Self::Result { payload, .. }
            | Self::Invocation { payload, .. }
            | Self::Yield { payload, .. } => Some(payload),
            _ => None,
        }
    }

    /// Decode from the WAMP JSON array form
    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Array(items) = value else {
            return Err(WampError::InvalidMessage(
                "message is not a JSON array".to_string(),
            ));
        };
        let mut items = items.into_iter();
        let code = items
            .next()
            .and_then(|v| v.as_u64())
            .ok_or_else(|| WampError::InvalidMessage("missing message type".to_string()))?;
        let kind = MessageKind::try_from(code)?;
        let mut f = Fields { kind, items };

        let message = match kind {
            MessageKind::Hello => Self::Hello {
                realm: f.string("realm")?,
                details: f.dict("details")?,
            },
            MessageKind::Welcome => Self::Welcome {
                session: f.id("session")?,
                details: f.dict("details")?,
            },
            MessageKind::Abort => Self::Abort {
                details: f.dict("details")?,
                reason: f.string("reason")?,
            },
            MessageKind::Goodbye => Self::Goodbye {
                details: f.dict("details")?,
                reason: f.string("reason")?,
            },
            MessageKind::Error => {
                let request_type = MessageKind::try_from(f.int("request type")?)?;
                Self::Error {
                    request_type,
                    request: f.id("request")?,
                    details: f.dict("details")?,
                    error: f.string("error")?,
                    payload: f.payload()?,
                }
            },
            MessageKind::Publish => Self::Publish {
                request: f.id("request")?,
                options: f.dict("options")?,
                topic: f.string("topic")?,
                payload: f.payload()?,
            },
            MessageKind::Published => Self::Published {
                request: f.id("request")?,
                publication: f.id("publication")?,
            },
            MessageKind::Subscribe => Self::Subscribe {
                request: f.id("request")?,
                options: f.dict("options")?,
                topic: f.string("topic")?,
            },
            MessageKind::Subscribed => Self::Subscribed {
                request: f.id("request")?,
                subscription: f.id("subscription")?,
            },
            MessageKind::Unsubscribe => Self::Unsubscribe {
                request: f.id("request")?,
                subscription: f.id("subscription")?,
            },
            MessageKind::Unsubscribed => Self::Unsubscribed {
                request: f.id("request")?,
            },
            MessageKind::Event => Self::Event {
                subscription: f.id("subscription")?,
                publication: f.id("publication")?,
                details: f.dict("details")?,
                payload: f.payload()?,
            },
            MessageKind::Call => Self::Call {
                request: f.id("request")?,
                options: f.dict("options")?,
                procedure: f.string("procedure")?,
                payload: f.payload()?,
            },
            MessageKind::Result => Self::Result {
                request: f.id("request")?,
                details: f.dict("details")?,
                payload: f.payload()?,
            },
            MessageKind::Register => Self::Register {
                request: f.id("request")?,
                options: f.dict("options")?,
                procedure: f.string("procedure")?,
            },
            MessageKind::Registered => Self::Registered {
                request: f.id("request")?,
                registration: f.id("registration")?,
            },
            MessageKind::Unregister => Self::Unregister {
                request: f.id("request")?,
                registration: f.id("registration")?,
            },
            MessageKind::Unregistered => Self::Unregistered {
                request: f.id("request")?,
            },
            MessageKind::Invocation => Self::Invocation {
                request: f.id("request")?,
                registration: f.id("registration")?,
                details: f.dict("details")?,
                payload: f.payload()?,
            },
            MessageKind::Yield => Self::Yield {
                request: f.id("request")?,
                options: f.dict("options")?,
                payload: f.payload()?,
            },
        };
        Ok(message)
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.to_value())?)
    }

    /// Deserialize from JSON
    pub fn from_json(json: &str) -> Result<Self> {
        Self::from_value(serde_json::from_str(json)?)
    }
}

/// Positional field reader used while decoding.
struct Fields {
    kind: MessageKind,
    items: std::vec::IntoIter<Value>,
}

impl Fields {
    fn next(&mut self, what: &str) -> Result<Value> {
        self.items
            .next()
            .ok_or_else(|| WampError::InvalidMessage(format!("{} missing {what}", self.kind)))
    }

    fn int(&mut self, what: &str) -> Result<u64> {
        let kind = self.kind;
        self.next(what)?
            .as_u64()
            .ok_or_else(|| WampError::InvalidMessage(format!("{kind} {what} is not an integer")))
    }

    fn id(&mut self, what: &str) -> Result<Id> {
        let id = self.int(what)?;
        if is_valid_id(id) {
            Ok(id)
        } else {
            Err(WampError::InvalidMessage(format!(
                "{} {what} {id} is out of range",
                self.kind
            )))
        }
    }

    fn string(&mut self, what: &str) -> Result<String> {
        match self.next(what)? {
            Value::String(s) => Ok(s),
            _ => Err(WampError::InvalidMessage(format!(
                "{} {what} is not a string",
                self.kind
            ))),
        }
    }

    fn dict(&mut self, what: &str) -> Result<Dict> {
        match self.next(what)? {
            Value::Object(map) => Ok(map),
            _ => Err(WampError::InvalidMessage(format!(
                "{} {what} is not a dictionary",
                self.kind
            ))),
        }
    }

    fn payload(&mut self) -> Result<Payload> {
        let args = match self.items.next() {
            None => return Ok(Payload::default()),
            Some(Value::Array(args)) => args,
            Some(_) => {
                return Err(WampError::InvalidMessage(format!(
                    "{} arguments are not a list",
                    self.kind
                )))
            },
        };
        let kwargs = match self.items.next() {
            None => Dict::new(),
            Some(Value::Object(kwargs)) => kwargs,
            Some(_) => {
                return Err(WampError::InvalidMessage(format!(
                    "{} keyword arguments are not a dictionary",
                    self.kind
                )))
            },
        };
        Ok(Payload { args, kwargs })
    }
}
