//! Bounded reconnection with backoff.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Delay between connection attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum DelayPolicy {
    /// Same delay before every retry
    Fixed {
        /// Delay in milliseconds
        delay_ms: u64,
    },
    /// Delay grows by `multiplier` per failed attempt, capped at `max_ms`
    Exponential {
        /// First delay in milliseconds
        initial_ms: u64,
        /// Upper bound in milliseconds
        max_ms: u64,
        /// Growth factor
        multiplier: f64,
    },
}

impl Default for DelayPolicy {
    fn default() -> Self {
        Self::Exponential {
            initial_ms: 1_000,
            max_ms: 60_000,
            multiplier: 2.0,
        }
    }
}

impl DelayPolicy {
    /// Delay before the attempt following `failures` failed ones (1-based)
    pub fn delay_for(&self, failures: u32) -> Duration {
        match *self {
            Self::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            Self::Exponential {
                initial_ms,
                max_ms,
                multiplier,
            } => {
                let exp = failures.saturating_sub(1).min(64) as i32;
                let ms = (initial_ms as f64) * multiplier.max(1.0).powi(exp);
                Duration::from_millis(ms.min(max_ms as f64) as u64)
            },
        }
    }
}

/// When and how often to reconnect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Total connection attempts per cycle; 0 fails immediately
    pub max_attempts: u32,
    /// Delay between attempts
    pub delay: DelayPolicy,
    /// Reconnect after transport loss or peer GOODBYE
    pub reconnect_on_loss: bool,
    /// Reconnect after ABORT
    pub reconnect_on_abort: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            delay: DelayPolicy::default(),
            reconnect_on_loss: true,
            reconnect_on_abort: false,
        }
    }
}

impl ReconnectPolicy {
    /// Single attempt, never reconnect
    pub fn never() -> Self {
        Self {
            max_attempts: 1,
            reconnect_on_loss: false,
            ..Self::default()
        }
    }

    /// Fixed delay between at most `max_attempts` attempts
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay: DelayPolicy::Fixed {
                delay_ms: delay.as_millis() as u64,
            },
            ..Self::default()
        }
    }

    /// Also reconnect after ABORT
    pub fn with_reconnect_on_abort(mut self, enabled: bool) -> Self {
        self.reconnect_on_abort = enabled;
        self
    }

    /// Reconnect after transport loss
    pub fn with_reconnect_on_loss(mut self, enabled: bool) -> Self {
        self.reconnect_on_loss = enabled;
        self
    }
}

/// Supervisor verdict after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retry {
    /// Try again after the delay
    After(Duration),
    /// Attempts exhausted
    GiveUp,
}

/// Counts attempts within one connection cycle.
#[derive(Debug, Clone)]
pub struct ReconnectionSupervisor {
    policy: ReconnectPolicy,
    attempts: u32,
}

impl ReconnectionSupervisor {
    /// Create a supervisor for `policy`
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
        }
    }

    /// Policy in force
    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// Attempts made in the current cycle
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// True if another attempt is allowed
    pub fn can_attempt(&self) -> bool {
        self.attempts < self.policy.max_attempts
    }

    /// Record the start of an attempt; false if none is allowed
    pub fn begin_attempt(&mut self) -> bool {
        if !self.can_attempt() {
            return false;
        }
        self.attempts += 1;
        true
    }

    /// Delay before the attempt after `attempt` failed ones
    pub fn next_delay(&self, attempt: u32) -> Retry {
        if attempt >= self.policy.max_attempts {
            Retry::GiveUp
        } else {
            Retry::After(self.policy.delay.delay_for(attempt.max(1)))
        }
    }

    /// Verdict for the attempt that just failed
    pub fn on_failure(&self) -> Retry {
        self.next_delay(self.attempts)
    }

    /// Start a new cycle (after a successful connection, or a fresh connect)
    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}
