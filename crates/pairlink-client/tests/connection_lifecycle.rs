//! Integration tests for the connection lifecycle: one attempt at a time,
//! handshake timeout, manual versus automatic recovery, and the reconnect
//! backoff schedule.
//!
//! Every test runs on Tokio's paused clock with in-memory transports, so the
//! 7 s guard and the 10 s / 60 s backoff are exercised without waiting.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use pairlink_client::application::connection::{ConnectMode, ConnectStatus, ConnectionManager};
use pairlink_client::application::events::{ConnectionEvent, StopReason};
use pairlink_client::application::ports::{
    LinkConfig, LinkDependencies, OutboundFrame, SettingsStore, Transport, TransportChannel,
    TransportError,
};
use pairlink_client::infrastructure::crypto::AesGcmCipher;
use pairlink_client::infrastructure::dispatcher::LoggingDispatcher;
use pairlink_client::infrastructure::storage::memory::MemorySettingsStore;
use pairlink_client::infrastructure::transport::mock::{MockPeer, MockTransport};
use pairlink_core::{
    DialTarget, EndpointRecord, NetworkIdentity, Phase, PeerIdentity, CLOSE_HANDSHAKE_TIMEOUT,
};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

const HOME: &str = "192.168.1.20";
const PEER_ADDRESS: &str = "192.168.1.10";
const PEER_INFO: &str = r#"{"type":"macInfo","data":{"name":"Studio","isPlus":false}}"#;

struct Fixture {
    manager: Arc<ConnectionManager>,
    transport: Arc<MockTransport>,
    settings: Arc<MemorySettingsStore>,
    payloads: mpsc::UnboundedReceiver<String>,
}

/// A LAN where mDNS names fail at once and the peer's address never answers:
/// every direct dial hangs for `open_time` before timing out.
struct UnresponsiveTransport {
    start: Instant,
    open_time: Duration,
    direct_dials: Mutex<Vec<u64>>,
}

impl UnresponsiveTransport {
    fn new(open_time: Duration) -> Self {
        Self {
            start: Instant::now(),
            open_time,
            direct_dials: Mutex::new(Vec::new()),
        }
    }

    fn direct_dial_offsets(&self) -> Vec<u64> {
        self.direct_dials.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for UnresponsiveTransport {
    async fn open(&self, target: &DialTarget) -> Result<TransportChannel, TransportError> {
        if target.url.contains(".local") {
            return Err(TransportError::Open {
                url: target.url.clone(),
                reason: "name not resolved".to_string(),
            });
        }
        self.direct_dials
            .lock()
            .unwrap()
            .push(self.start.elapsed().as_secs());
        tokio::time::sleep(self.open_time).await;
        Err(TransportError::TimedOut {
            url: target.url.clone(),
            after: self.open_time,
        })
    }
}

fn fixture() -> Fixture {
    let transport = Arc::new(MockTransport::new());
    // mDNS names never resolve in tests; every attempt falls back to the address.
    transport.refuse_urls_containing(".local");
    let settings = Arc::new(MemorySettingsStore::default());
    let (payload_tx, payloads) = mpsc::unbounded_channel();
    let deps = LinkDependencies {
        transport: Arc::clone(&transport) as _,
        cipher: Arc::new(AesGcmCipher),
        settings: Arc::clone(&settings) as _,
        dispatcher: Arc::new(LoggingDispatcher::forwarding(payload_tx)),
    };
    let manager = ConnectionManager::new(
        LinkConfig::default(),
        deps,
        Some(NetworkIdentity::new(HOME)),
    );
    Fixture {
        manager,
        transport,
        settings,
        payloads,
    }
}

fn studio() -> EndpointRecord {
    EndpointRecord::new(PeerIdentity::new("Studio"), PEER_ADDRESS, 6996, None)
}

fn drain(events: &mut broadcast::Receiver<ConnectionEvent>) -> Vec<ConnectionEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

/// Connects manually and completes the handshake.
async fn authenticated(f: &Fixture) -> MockPeer {
    f.manager.connect(studio(), ConnectMode::Manual).await.unwrap();
    let peer = f.transport.next_peer().await.unwrap();
    let mut status = f.manager.watch_status();
    peer.send_text(PEER_INFO).await;
    status.changed().await.unwrap();
    assert!(f.manager.is_connected());
    peer
}

// ── Single attempt ────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_concurrent_connects_open_exactly_one_transport() {
    // Arrange
    let f = fixture();

    // Act
    let (first, second) = tokio::join!(
        f.manager.connect(studio(), ConnectMode::Manual),
        f.manager.connect(studio(), ConnectMode::Automatic),
    );

    // Assert
    assert_eq!(first.unwrap(), ConnectStatus::TransportOpen);
    assert_eq!(second.unwrap(), ConnectStatus::AlreadyActive);
    assert!(f.transport.try_next_peer().is_some());
    assert!(f.transport.try_next_peer().is_none(), "no second transport");
}

#[tokio::test(start_paused = true)]
async fn test_connect_while_authenticated_is_a_noop() {
    let f = fixture();
    let _peer = authenticated(&f).await;
    let dialled = f.transport.opened_urls().len();

    let status = f.manager.connect(studio(), ConnectMode::Manual).await.unwrap();

    assert_eq!(status, ConnectStatus::AlreadyActive);
    assert_eq!(f.transport.opened_urls().len(), dialled);
    assert!(f.manager.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_every_payload_reaches_dispatcher_including_peer_info() {
    // Arrange
    let mut f = fixture();
    let peer = authenticated(&f).await;

    // Act
    peer.send_text(r#"{"type":"clipboard","data":"hi"}"#).await;
    tokio::time::sleep(Duration::from_millis(10)).await;

    // Assert
    assert_eq!(f.payloads.try_recv().unwrap(), PEER_INFO);
    assert!(f.payloads.try_recv().unwrap().contains("clipboard"));
}

#[tokio::test(start_paused = true)]
async fn test_non_peer_info_frame_does_not_authenticate() {
    // Arrange
    let mut f = fixture();
    f.manager.connect(studio(), ConnectMode::Manual).await.unwrap();
    let peer = f.transport.next_peer().await.unwrap();

    // Act
    peer.send_text(r#"{"type":"macInfo"}"#).await;
    peer.send_text("not json").await;
    tokio::time::sleep(Duration::from_millis(10)).await;

    // Assert: still waiting for peer-info, both frames forwarded
    assert_eq!(f.manager.phase(), Phase::TransportOpen);
    assert!(f.payloads.try_recv().is_ok());
    assert!(f.payloads.try_recv().is_ok());
}

// ── Handshake timeout ─────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_handshake_timeout_fires_once_and_closes_with_4001() {
    // Arrange
    let f = fixture();
    let mut events = f.manager.subscribe();
    f.manager.connect(studio(), ConnectMode::Manual).await.unwrap();
    let mut peer = f.transport.next_peer().await.unwrap();
    let _hello = peer.next_outbound().await;

    // Act
    tokio::time::sleep(Duration::from_millis(6_900)).await;
    let before_deadline = f.manager.phase();
    tokio::time::sleep(Duration::from_secs(30)).await;

    // Assert
    assert_eq!(before_deadline, Phase::TransportOpen);
    assert_eq!(f.manager.phase(), Phase::Idle);
    assert_eq!(
        peer.next_outbound().await,
        Some(OutboundFrame::Close {
            code: CLOSE_HANDSHAKE_TIMEOUT,
            reason: "handshake timeout".to_string()
        })
    );
    let timeouts = drain(&mut events)
        .into_iter()
        .filter(|e| matches!(e, ConnectionEvent::HandshakeTimedOut { .. }))
        .count();
    assert_eq!(timeouts, 1);
}

#[tokio::test(start_paused = true)]
async fn test_peer_info_just_before_deadline_wins_over_timeout() {
    // Arrange
    let f = fixture();
    f.manager.connect(studio(), ConnectMode::Manual).await.unwrap();
    let peer = f.transport.next_peer().await.unwrap();

    // Act
    tokio::time::sleep(Duration::from_millis(6_990)).await;
    peer.send_text(PEER_INFO).await;
    tokio::time::sleep(Duration::from_secs(10)).await;

    // Assert
    assert!(f.manager.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_automatic_handshake_timeout_starts_auto_reconnect() {
    // Arrange: the registry knows the peer on this network
    let f = fixture();
    f.manager
        .registry()
        .upsert(&NetworkIdentity::new(HOME), &studio());
    f.manager.connect(studio(), ConnectMode::Automatic).await.unwrap();
    let _peer = f.transport.next_peer().await.unwrap();

    // Act
    tokio::time::sleep(Duration::from_secs(8)).await;

    // Assert
    assert_eq!(f.manager.phase(), Phase::Idle);
    assert!(!f.settings.snapshot().manually_disconnected);
    assert!(f.manager.is_auto_reconnecting());
    f.manager.shutdown();
}

// ── Manual versus automatic ───────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_manual_disconnect_suppresses_auto_reconnect() {
    // Arrange
    let f = fixture();
    let _peer = authenticated(&f).await;
    let dialled = f.transport.opened_urls().len();

    // Act
    f.manager.disconnect();
    tokio::time::sleep(Duration::from_secs(120)).await;

    // Assert
    assert!(!f.manager.is_connected());
    assert!(!f.manager.is_auto_reconnecting());
    assert!(f.settings.snapshot().manually_disconnected);
    assert_eq!(f.transport.opened_urls().len(), dialled, "nothing redialled");
}

#[tokio::test(start_paused = true)]
async fn test_manual_connect_cancels_running_auto_reconnect() {
    // Arrange
    let f = fixture();
    f.manager
        .registry()
        .upsert(&NetworkIdentity::new(HOME), &studio());
    assert!(f.manager.consider_auto_reconnect());
    let mut events = f.manager.subscribe();

    // Act
    f.manager.connect(studio(), ConnectMode::Manual).await.unwrap();

    // Assert
    assert!(!f.manager.is_auto_reconnecting());
    let seen = drain(&mut events);
    assert!(seen.contains(&ConnectionEvent::AutoReconnectStopped {
        reason: StopReason::Cancelled
    }));
    assert!(seen.contains(&ConnectionEvent::ManualConnectStarted {
        peer: PeerIdentity::new("Studio")
    }));
}

// ── Auto-reconnect schedule ───────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_drop_after_auth_redials_at_ten_second_spacing() {
    // Arrange
    let f = fixture();
    let peer = authenticated(&f).await;
    let mut events = f.manager.subscribe();

    // Act: the peer goes away
    peer.close(1001, "going away").await;
    tokio::time::sleep(Duration::from_millis(9_900)).await;
    let before_first = f.transport.try_next_peer();
    tokio::time::sleep(Duration::from_millis(200)).await;
    let first = f.transport.try_next_peer();
    tokio::time::sleep(Duration::from_secs(9)).await;
    let before_second = f.transport.try_next_peer();
    tokio::time::sleep(Duration::from_millis(1_200)).await;
    let second = f.transport.try_next_peer();

    // Assert
    assert!(before_first.is_none());
    assert!(first.is_some(), "first retry at ~10s");
    assert!(before_second.is_none());
    let second = second.expect("second retry at ~20s");
    assert_eq!(f.manager.reconnect_state().attempt_count, 2);
    let seen = drain(&mut events);
    assert!(seen.contains(&ConnectionEvent::StatusChanged { connected: false }));
    assert!(seen.contains(&ConnectionEvent::AutoReconnectStarted));

    // Act: the second retry authenticates
    second.send_text(PEER_INFO).await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    // Assert
    assert!(f.manager.is_connected());
    assert!(!f.manager.is_auto_reconnecting());
    assert!(drain(&mut events).contains(&ConnectionEvent::AutoReconnectStopped {
        reason: StopReason::Reconnected
    }));
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_peer_exhausts_ten_minute_window() {
    // Arrange: nothing is reachable
    let f = fixture();
    f.transport.refuse_urls_containing("ws://");
    f.manager
        .registry()
        .upsert(&NetworkIdentity::new(HOME), &studio());
    let mut events = f.manager.subscribe();

    // Act
    assert!(f.manager.consider_auto_reconnect());
    tokio::time::sleep(Duration::from_secs(599)).await;
    let still_running = f.manager.is_auto_reconnecting();
    tokio::time::sleep(Duration::from_secs(2)).await;

    // Assert: 6 fast + 8 slow attempts, two dial candidates each
    assert!(still_running);
    assert!(!f.manager.is_auto_reconnecting());
    assert_eq!(f.manager.reconnect_state().attempt_count, 14);
    assert_eq!(f.transport.opened_urls().len(), 28);
    assert!(drain(&mut events).contains(&ConnectionEvent::AutoReconnectStopped {
        reason: StopReason::WindowExhausted
    }));
}

#[tokio::test(start_paused = true)]
async fn test_slow_dials_keep_backoff_spacing() {
    // Arrange
    let transport = Arc::new(UnresponsiveTransport::new(Duration::from_secs(8)));
    let (payload_tx, _payloads) = mpsc::unbounded_channel();
    let deps = LinkDependencies {
        transport: Arc::clone(&transport) as _,
        cipher: Arc::new(AesGcmCipher),
        settings: Arc::new(MemorySettingsStore::default()),
        dispatcher: Arc::new(LoggingDispatcher::forwarding(payload_tx)),
    };
    let manager = ConnectionManager::new(
        LinkConfig::default(),
        deps,
        Some(NetworkIdentity::new(HOME)),
    );
    manager
        .registry()
        .upsert(&NetworkIdentity::new(HOME), &studio());

    // Act
    assert!(manager.request_auto_reconnect());
    tokio::time::sleep(Duration::from_secs(601)).await;

    // Assert: dials start on the schedule, not schedule plus dial time
    assert_eq!(
        transport.direct_dial_offsets(),
        vec![10, 20, 30, 40, 50, 60, 120, 180, 240, 300, 360, 420, 480, 540]
    );
    assert_eq!(manager.reconnect_state().attempt_count, 14);
    assert!(!manager.is_auto_reconnecting());
}

#[tokio::test(start_paused = true)]
async fn test_disabling_auto_reconnect_stops_loop() {
    let f = fixture();
    f.manager
        .registry()
        .upsert(&NetworkIdentity::new(HOME), &studio());
    assert!(f.manager.consider_auto_reconnect());

    f.manager.set_auto_reconnect_enabled(false);

    assert!(!f.manager.is_auto_reconnecting());
    assert!(!f.manager.consider_auto_reconnect());
    assert!(!f.settings.snapshot().auto_reconnect_enabled);
}
