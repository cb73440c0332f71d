//! URI validation for realms, topics and procedures.
//!
//! | Policy   | Component rule   | Example                 |
//! |----------|------------------|-------------------------|
//! | `loose`  | no whitespace, `.` or `#` | `com.myapp.Topic-1` |
//! | `strict` | `[0-9a-z_]+`     | `com.myapp.topic_1`     |
//!
//! Components are joined by single dots; empty components are invalid for
//! exact URIs. Pattern subscriptions (`prefix`, `wildcard`) are not checked
//! here, the router owns their semantics.

use std::fmt;
use std::str::FromStr;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Result, WampError};

/// Loose URI rule
pub const LOOSE_URI_PATTERN: &str = r"^([^\s\.#]+\.)*([^\s\.#]+)$";

/// Strict URI rule
pub const STRICT_URI_PATTERN: &str = r"^([0-9a-z_]+\.)*([0-9a-z_]+)$";

/// Prefix reserved for router-defined procedures and topics
pub const RESERVED_PREFIX: &str = "wamp.";

/// Which URI rule to enforce before sending
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UriPolicy {
    /// Any non-empty components without whitespace, `.` or `#`
    #[default]
    Loose,
    /// Lower-case letters, digits and underscore only
    Strict,
}

impl UriPolicy {
    fn pattern(self) -> &'static str {
        match self {
            Self::Loose => LOOSE_URI_PATTERN,
            Self::Strict => STRICT_URI_PATTERN,
        }
    }

    /// Check `uri` against this policy
    pub fn is_valid(self, uri: &str) -> bool {
        URI_REGEX
            .iter()
            .find(|(policy, _)| *policy == self)
            .is_some_and(|(_, re)| re.is_match(uri))
    }
}

impl fmt::Display for UriPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Loose => write!(f, "loose"),
            Self::Strict => write!(f, "strict"),
        }
    }
}

impl FromStr for UriPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "loose" => Ok(Self::Loose),
            "strict" => Ok(Self::Strict),
            _ => Err(format!("Unknown URI policy: {}", s)),
        }
    }
}

lazy_static! {
    /// Compiled URI rules, one per policy
    static ref URI_REGEX: Vec<(UriPolicy, Regex)> = {
        [UriPolicy::Loose, UriPolicy::Strict]
            .into_iter()
            .filter_map(|p| Regex::new(p.pattern()).ok().map(|r| (p, r)))
            .collect()
    };
}

/// What a URI names, for error messages
#[derive(Debug, Clone, Copy)]
pub enum UriRole {
    /// Realm name
    Realm,
    /// Topic
    Topic,
    /// Procedure
    Procedure,
    /// Error or reason
    Error,
}

impl fmt::Display for UriRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Realm => write!(f, "realm"),
            Self::Topic => write!(f, "topic"),
            Self::Procedure => write!(f, "procedure"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Validate `uri` under `policy`
pub fn validate(uri: &str, role: UriRole, policy: UriPolicy) -> Result<()> {
    if policy.is_valid(uri) {
        Ok(())
    } else {
        Err(WampError::InvalidUri(format!(
            "{role} '{uri}' is not a valid {policy} URI"
        )))
    }
}

/// Validate a procedure the client wants to register.
///
/// The `wamp.` namespace belongs to the router.
pub fn validate_registration(procedure: &str, policy: UriPolicy) -> Result<()> {
    validate(procedure, UriRole::Procedure, policy)?;
    if procedure.starts_with(RESERVED_PREFIX) {
        return Err(WampError::InvalidUri(format!(
            "procedure '{procedure}' uses the reserved '{RESERVED_PREFIX}' prefix"
        )));
    }
    Ok(())
}
