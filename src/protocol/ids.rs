//! Session-scoped request identifiers.
//!
//! WAMP ids are integers in `[1, 2^53]` so they survive a round trip through
//! IEEE-754 doubles. Request ids chosen by the client are sequential within a
//! session and restart at 1 whenever a new session is established.

/// A WAMP identifier (session, request, subscription, ...)
pub type Id = u64;

/// Largest valid WAMP id (2^53)
pub const MAX_ID: Id = 1 << 53;

/// Check that `id` lies within the WAMP id range
pub fn is_valid_id(id: Id) -> bool {
    (1..=MAX_ID).contains(&id)
}

/// Sequential request id generator owned by one live session.
///
/// Not thread-safe on purpose: only the engine loop touches it.
#[derive(Debug, Default)]
pub struct IdGenerator {
    last: Id,
}

impl IdGenerator {
    /// Create a generator whose first id is 1
    pub fn new() -> Self {
        Self::default()
    }

    /// Next id; wraps back to 1 after [`MAX_ID`]
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Id {
        self.last = if self.last >= MAX_ID { 1 } else { self.last + 1 };
        self.last
    }

    /// Restart the sequence at 1
    pub fn reset(&mut self) {
        self.last = 0;
    }

    /// Last id handed out (0 if none)
    pub fn last(&self) -> Id {
        self.last
    }
}
