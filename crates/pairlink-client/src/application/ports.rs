//! Collaborator ports of the connection manager.
//!
//! The manager owns the lifecycle; everything with side effects outside the
//! process sits behind one of these traits so the lifecycle can be driven
//! deterministically in tests:
//!
//! | Port                  | Production adapter                    | Test double          |
//! |-----------------------|---------------------------------------|----------------------|
//! | [`Transport`]         | `infrastructure::transport::websocket` | `MockTransport`      |
//! | [`PayloadCipher`]     | `infrastructure::crypto::AesGcmCipher` | same (no key = plain)|
//! | [`SettingsStore`]     | `infrastructure::storage::config`      | `MemorySettingsStore`|
//! | [`MessageDispatcher`] | `infrastructure::dispatcher`           | `MockMessageDispatcher` |
//!
//! # Transport shape
//!
//! A successful [`Transport::open`] *is* the "on open" event.  After that the
//! transport reports everything else on the channel's event receiver, and the
//! manager talks back through the cloneable, non-blocking [`TransportHandle`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pairlink_core::{DialTarget, EndpointRecord, KnownPeer, ReconnectPolicy, SessionKey};
use thiserror::Error;
use tokio::sync::{mpsc, Notify};

// ── Transport ─────────────────────────────────────────────────────────────────

/// Why a transport could not be opened.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The connection was refused, unreachable, or the name did not resolve.
    #[error("failed to open {url}: {reason}")]
    Open { url: String, reason: String },
    /// The open did not complete within the configured bound.
    #[error("opening {url} timed out after {after:?}")]
    TimedOut { url: String, after: Duration },
    /// The dial target is not a usable `ws://` URL.
    #[error("invalid url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
}

/// Something the transport observed after it opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A text frame from the peer (still encrypted).
    Message(String),
    /// The peer (or the transport) started an orderly close.
    Closing { code: u16, reason: String },
    /// The transport failed.
    Failure(String),
}

/// A frame queued for the transport's writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    Text(String),
    Close { code: u16, reason: String },
}

/// Write side of an open transport.
///
/// Sends are fire-and-forget: they queue the frame and return immediately.
#[derive(Debug, Clone)]
pub struct TransportHandle {
    outbound: mpsc::UnboundedSender<OutboundFrame>,
    closed: Arc<Notify>,
}

impl TransportHandle {
    pub fn new(outbound: mpsc::UnboundedSender<OutboundFrame>) -> Self {
        Self {
            outbound,
            closed: Arc::new(Notify::new()),
        }
    }

    /// Queues a text frame.  Returns `false` once the writer is gone.
    pub fn send(&self, text: String) -> bool {
        self.outbound.send(OutboundFrame::Text(text)).is_ok()
    }

    /// Queues a close frame and wakes whoever waits in [`TransportHandle::closed`].
    pub fn close(&self, code: u16, reason: &str) {
        let _ = self.outbound.send(OutboundFrame::Close {
            code,
            reason: reason.to_string(),
        });
        self.closed.notify_one();
    }

    /// Resolves once [`TransportHandle::close`] has been called on any clone.
    pub async fn closed(&self) {
        self.closed.notified().await;
    }
}

/// An open transport: the write handle plus the inbound event stream.
#[derive(Debug)]
pub struct TransportChannel {
    pub handle: TransportHandle,
    pub events: mpsc::Receiver<TransportEvent>,
}

/// Opens transports to the peer.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Opens a connection to `target`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] when the connection cannot be established.
    async fn open(&self, target: &DialTarget) -> Result<TransportChannel, TransportError>;
}

// ── Crypto ────────────────────────────────────────────────────────────────────

/// Payload encryption failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CipherError {
    /// The session key is not valid base64 or has the wrong length.
    #[error("invalid session key")]
    InvalidKey,
    /// The ciphertext is malformed or failed authentication.
    #[error("invalid ciphertext: {0}")]
    InvalidCiphertext(String),
    /// The plaintext could not be encrypted.
    #[error("encryption failed")]
    Encrypt,
}

/// Encrypts and decrypts text payloads with the session key.
///
/// A `None` key means the session is unencrypted and payloads pass through.
pub trait PayloadCipher: Send + Sync {
    fn encrypt(&self, plaintext: &str, key: Option<&SessionKey>) -> Result<String, CipherError>;
    fn decrypt(&self, ciphertext: &str, key: Option<&SessionKey>) -> Result<String, CipherError>;
}

// ── Settings ──────────────────────────────────────────────────────────────────

/// Current value of every persisted setting the lifecycle depends on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkSettings {
    pub manually_disconnected: bool,
    pub auto_reconnect_enabled: bool,
    pub expanded_networking: bool,
    /// Single-slot fallback used when no network-specific record matches.
    pub last_active_device: Option<EndpointRecord>,
    /// The persisted endpoint registry table.
    pub peers: Vec<KnownPeer>,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            manually_disconnected: false,
            auto_reconnect_enabled: true,
            expanded_networking: false,
            last_active_device: None,
            peers: Vec::new(),
        }
    }
}

/// Persistent settings.
///
/// Reads return a current-value snapshot.  Writes are durable but
/// fire-and-forget: adapters log their own failures instead of returning
/// them, so a full disk never changes connection behaviour.
pub trait SettingsStore: Send + Sync {
    fn snapshot(&self) -> LinkSettings;
    fn set_manually_disconnected(&self, value: bool);
    fn set_auto_reconnect_enabled(&self, value: bool);
    fn set_last_active_device(&self, record: &EndpointRecord);
    fn save_peers(&self, peers: &[KnownPeer]);
}

// ── Messages ──────────────────────────────────────────────────────────────────

/// Receives every decrypted inbound payload, peer-info included.
#[cfg_attr(test, mockall::automock)]
pub trait MessageDispatcher: Send + Sync {
    fn dispatch(&self, payload: String);
}

// ── Wiring ────────────────────────────────────────────────────────────────────

/// Everything the connection manager needs from the outside world.
#[derive(Clone)]
pub struct LinkDependencies {
    pub transport: Arc<dyn Transport>,
    pub cipher: Arc<dyn PayloadCipher>,
    pub settings: Arc<dyn SettingsStore>,
    pub dispatcher: Arc<dyn MessageDispatcher>,
}

/// Tunables of the connection lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkConfig {
    /// Name this device announces in its client hello.
    pub device_name: String,
    /// How long an open transport may stay silent before the attempt is
    /// treated as an authentication failure.
    pub handshake_timeout: Duration,
    pub reconnect: ReconnectPolicy,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            device_name: "pairlink".to_string(),
            handshake_timeout: Duration::from_secs(7),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
