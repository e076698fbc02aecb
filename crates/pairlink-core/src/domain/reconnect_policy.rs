//! Backoff schedule for automatic reconnection.
//!
//! The schedule is attempt-count based rather than exponential:
//!
//! ```text
//! attempt:   1    2    3    4    5    6    7    8   ...
//! wait:     10s  10s  10s  10s  10s  10s  60s  60s  ...
//! ```
//!
//! and the whole loop is time-boxed by `window` (10 minutes by default)
//! measured from the moment the loop started.

use std::time::Duration;

/// Timing parameters of the reconnect loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Total time the loop may run before giving up.
    pub window: Duration,
    /// Number of attempts that use `fast_delay`.
    pub fast_attempts: u32,
    /// Wait before each of the first `fast_attempts` attempts.
    pub fast_delay: Duration,
    /// Wait before every later attempt.
    pub slow_delay: Duration,
    /// Granularity at which a wait re-checks for success or cancellation.
    pub poll_tick: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(10 * 60),
            fast_attempts: 6,
            fast_delay: Duration::from_secs(10),
            slow_delay: Duration::from_secs(60),
            poll_tick: Duration::from_millis(500),
        }
    }
}

impl ReconnectPolicy {
    /// Wait that precedes attempt number `attempt` (1-based).
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= self.fast_attempts {
            self.fast_delay
        } else {
            self.slow_delay
        }
    }

    /// Returns `true` once `elapsed` has reached the window.
    pub fn window_exhausted(&self, elapsed: Duration) -> bool {
        elapsed >= self.window
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
