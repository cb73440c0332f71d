//! Per-request options.
//!
//! Each options type carries a few typed fields plus `extra`, a dictionary of
//! WAMP options passed to the router untouched.

use std::time::Duration;

use serde_json::Value;

use crate::protocol::Dict;

/// Options for `PUBLISH`
#[derive(Debug, Clone, PartialEq)]
pub struct PublishOptions {
    /// Skip delivery to the publishing session (router default: true)
    pub exclude_me: bool,
    /// Opaque extra options
    pub extra: Dict,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            exclude_me: true,
            extra: Dict::new(),
        }
    }
}

impl PublishOptions {
    /// Set `exclude_me`
    pub fn with_exclude_me(mut self, exclude_me: bool) -> Self {
        self.exclude_me = exclude_me;
        self
    }

    /// Add an opaque option
    pub fn with_option(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.extra.insert(key.to_string(), value.into());
        self
    }

    pub(crate) fn to_dict(&self, acknowledge: bool) -> Dict {
        let mut options = self.extra.clone();
        if !self.exclude_me {
            options.insert("exclude_me".to_string(), Value::Bool(false));
        }
        if acknowledge {
            options.insert("acknowledge".to_string(), Value::Bool(true));
        }
        options
    }
}

/// Topic matching policy for `SUBSCRIBE`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MatchPolicy {
    /// Topic must equal the subscribed URI
    #[default]
    Exact,
    /// Topic starts with the subscribed URI
    Prefix,
    /// Empty URI components match anything
    Wildcard,
}

impl MatchPolicy {
    /// Wire name, `None` for the default exact match
    pub fn as_option(self) -> Option<&'static str> {
        match self {
            Self::Exact => None,
            Self::Prefix => Some("prefix"),
            Self::Wildcard => Some("wildcard"),
        }
    }
}

/// Options for `SUBSCRIBE`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubscribeOptions {
    /// Matching policy
    pub match_policy: MatchPolicy,
    /// Opaque extra options
    pub extra: Dict,
}

impl SubscribeOptions {
    /// Set the matching policy
    pub fn with_match(mut self, policy: MatchPolicy) -> Self {
        self.match_policy = policy;
        self
    }

    /// Add an opaque option
    pub fn with_option(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.extra.insert(key.to_string(), value.into());
        self
    }

    pub(crate) fn to_dict(&self) -> Dict {
        let mut options = self.extra.clone();
        if let Some(policy) = self.match_policy.as_option() {
            options.insert("match".to_string(), Value::String(policy.to_string()));
        }
        options
    }
}

/// Options for `CALL`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallOptions {
    /// Local timeout; overrides the client's request timeout
    pub timeout: Option<Duration>,
    /// Opaque extra options
    pub extra: Dict,
}

impl CallOptions {
    /// Set a local timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Add an opaque option
    pub fn with_option(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.extra.insert(key.to_string(), value.into());
        self
    }
}

/// Options for `REGISTER`
#[derive(Debug, Clone, PartialEq)]
pub struct RegisterOptions {
    /// Invocations run at once on this registration
    pub concurrency: usize,
    /// Opaque extra options
    pub extra: Dict,
}

impl Default for RegisterOptions {
    fn default() -> Self {
        Self {
            concurrency: 1,
            extra: Dict::new(),
        }
    }
}

impl RegisterOptions {
    /// Allow `concurrency` invocations in flight (minimum 1)
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Add an opaque option
    pub fn with_option(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.extra.insert(key.to_string(), value.into());
        self
    }
}
