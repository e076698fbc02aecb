//! Connection event stream.
//!
//! Two delivery mechanisms, for two kinds of observer:
//!
//! - [`EventBus::subscribe`] hands out a `broadcast` receiver of every
//!   [`ConnectionEvent`].  Slow receivers lag (and see `Lagged`) instead of
//!   blocking the connection manager.  Unsubscribing is dropping the receiver.
//! - [`EventBus::watch_status`] hands out a `watch` receiver that always holds
//!   the latest connected flag, for observers that only need "are we
//!   connected right now" and may have been created after the last change.
//!
//! Events are published from whichever task performed the transition, so
//! observers must not assume any particular delivery thread.

use pairlink_core::PeerIdentity;
use tokio::sync::{broadcast, watch};
use tracing::trace;

/// Why the auto-reconnect loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Cancelled by a manual action, a network change, or shutdown.
    Cancelled,
    /// A session was authenticated.
    Reconnected,
    /// The retry window elapsed without success.
    WindowExhausted,
    /// No endpoint could be resolved for the next attempt.
    NoTarget,
}

/// Observable lifecycle events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Connected flag after a confirmed transition.
    StatusChanged { connected: bool },
    /// The transport opened but the peer never authenticated in time.
    HandshakeTimedOut { peer: PeerIdentity },
    /// A user-initiated attempt started (pre-empting automatic recovery).
    ManualConnectStarted { peer: PeerIdentity },
    /// An attempt failed before the transport opened.
    AttemptFailed { peer: PeerIdentity, reason: String },
    AutoReconnectStarted,
    AutoReconnectStopped { reason: StopReason },
}

/// Fan-out point for [`ConnectionEvent`]s.
#[derive(Debug)]
pub struct EventBus {
    events: broadcast::Sender<ConnectionEvent>,
    status: watch::Sender<bool>,
}

impl EventBus {
    /// Creates a bus whose broadcast channel buffers `capacity` events.
    pub fn new(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity);
        let (status, _) = watch::channel(false);
        Self { events, status }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    pub fn watch_status(&self) -> watch::Receiver<bool> {
        self.status.subscribe()
    }

    /// Current connected flag as last published.
    pub fn status(&self) -> bool {
        *self.status.borrow()
    }

    pub fn publish(&self, event: ConnectionEvent) {
        trace!(?event, "publish");
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Publishes a status transition on both channels.
    pub fn publish_status(&self, connected: bool) {
        self.status.send_replace(connected);
        self.publish(ConnectionEvent::StatusChanged { connected });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(64)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_status_reaches_both_channels() {
        // Arrange
        let bus = EventBus::default();
        let mut events = bus.subscribe();
        let watcher = bus.watch_status();

        // Act
        bus.publish_status(true);

        // Assert
        assert_eq!(
            events.recv().await.unwrap(),
            ConnectionEvent::StatusChanged { connected: true }
        );
        assert!(*watcher.borrow());
        assert!(bus.status());
    }

    #[test]
    fn test_publish_without_subscribers_does_not_panic() {
        let bus = EventBus::default();
        bus.publish(ConnectionEvent::AutoReconnectStarted);
        bus.publish_status(false);
        assert!(!bus.status());
    }

    #[tokio::test]
    async fn test_late_watcher_sees_latest_status() {
        let bus = EventBus::default();
        bus.publish_status(true);
        let watcher = bus.watch_status();
        assert!(*watcher.borrow());
    }
}
