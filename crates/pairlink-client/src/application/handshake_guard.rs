//! Handshake timeout guard.
//!
//! Armed when a transport opens, disarmed when the peer-info message arrives
//! or the attempt ends.  If it fires, the caller reclassifies the attempt as an
//! authentication failure: the socket opened, so the network is fine, but the
//! peer never proved it holds the session key.
//!
//! At most one timer exists at a time.  Arming again replaces the previous
//! timer unless that timer belongs to a newer attempt, and every cancel
//! variant is a no-op when nothing is armed.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;

struct Armed {
    generation: u64,
    task: JoinHandle<()>,
}

/// Single cancellable delayed action keyed by attempt generation.
pub struct HandshakeGuard {
    timeout: Duration,
    armed: Mutex<Option<Armed>>,
}

impl HandshakeGuard {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            armed: Mutex::new(None),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Arms the guard for attempt `generation`.
    ///
    /// `on_timeout` runs once, on a Tokio task, after the timeout elapses,
    /// unless the guard is cancelled or re-armed first.  Must be called from
    /// within a Tokio runtime.
    ///
    /// Returns `false`, and arms nothing, if a newer generation already holds
    /// the guard.
    pub fn arm<F>(&self, generation: u64, on_timeout: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let timeout = self.timeout;
        let mut slot = self.armed.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(current) = slot.as_ref().filter(|a| a.generation > generation) {
            debug!(
                generation,
                current = current.generation,
                "stale attempt left the handshake guard alone"
            );
            return false;
        }
        let task = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            on_timeout();
        });
        if let Some(previous) = slot.replace(Armed { generation, task }) {
            previous.task.abort();
        }
        debug!(generation, ?timeout, "handshake guard armed");
        true
    }

    /// Disarms whatever is armed.
    pub fn cancel(&self) {
        let armed = self
            .armed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(armed) = armed {
            armed.task.abort();
            debug!(generation = armed.generation, "handshake guard cancelled");
        }
    }

    /// Disarms the guard only if it belongs to attempt `generation`.
    pub fn cancel_for(&self, generation: u64) {
        let mut slot = self.armed.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|a| a.generation == generation) {
            if let Some(armed) = slot.take() {
                armed.task.abort();
                debug!(generation, "handshake guard cancelled");
            }
        }
    }

    /// `true` while a timer is pending.
    pub fn is_armed(&self) -> bool {
        self.armed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|a| !a.task.is_finished())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
