//! Mock transport for unit and integration testing.
//!
//! # Why a mock transport?
//!
//! The real WebSocket transport needs a listening peer, real sockets, and
//! wall-clock time.  The lifecycle tests need none of that: they need to
//! decide which URLs "resolve", play the peer's side of the conversation, and
//! run under Tokio's paused clock.
//!
//! `MockTransport` records every URL it is asked to open.  Each accepted open
//! hands the test a [`MockPeer`]: the far end of the connection, which can
//! push frames, close, or fail the transport and read what the client sent.
//!
//! # Usage in tests
//!
//! ```ignore
//! let transport = Arc::new(MockTransport::new());
//! transport.refuse_urls_containing(".local"); // force the direct fallback
//!
//! manager.connect(record, ConnectMode::Manual).await?;
//! let mut peer = transport.next_peer().await.unwrap();
//! peer.send_text(r#"{"type":"macInfo","data":{}}"#).await;
//! ```

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use pairlink_core::DialTarget;
use tokio::sync::mpsc;

use crate::application::ports::{
    OutboundFrame, Transport, TransportChannel, TransportError, TransportEvent, TransportHandle,
};

/// Far end of one mock connection.
#[derive(Debug)]
pub struct MockPeer {
    /// URL the client opened.
    pub url: String,
    events: mpsc::Sender<TransportEvent>,
    outbound: mpsc::UnboundedReceiver<OutboundFrame>,
}

impl MockPeer {
    /// Delivers a text frame to the client.  Returns `false` if the client
    /// stopped listening.
    pub async fn send_text(&self, text: &str) -> bool {
        self.events
            .send(TransportEvent::Message(text.to_string()))
            .await
            .is_ok()
    }

    /// Closes the connection from the peer's side.
    pub async fn close(&self, code: u16, reason: &str) {
        let _ = self
            .events
            .send(TransportEvent::Closing {
                code,
                reason: reason.to_string(),
            })
            .await;
    }

    /// Fails the transport.
    pub async fn fail(&self, error: &str) {
        let _ = self
            .events
            .send(TransportEvent::Failure(error.to_string()))
            .await;
    }

    /// Next frame the client wrote, waiting for it if necessary.
    pub async fn next_outbound(&mut self) -> Option<OutboundFrame> {
        self.outbound.recv().await
    }

    /// Next frame the client wrote, if one is already queued.
    pub fn try_next_outbound(&mut self) -> Option<OutboundFrame> {
        self.outbound.try_recv().ok()
    }
}

/// In-memory [`Transport`] with scriptable name resolution.
pub struct MockTransport {
    opened: Mutex<Vec<String>>,
    refused: Mutex<Vec<String>>,
    peers_tx: mpsc::UnboundedSender<MockPeer>,
    peers_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<MockPeer>>,
}

impl MockTransport {
    /// Creates a transport that accepts every URL.
    pub fn new() -> Self {
        let (peers_tx, peers_rx) = mpsc::unbounded_channel();
        Self {
            opened: Mutex::new(Vec::new()),
            refused: Mutex::new(Vec::new()),
            peers_tx,
            peers_rx: tokio::sync::Mutex::new(peers_rx),
        }
    }

    /// Refuses every later open whose URL contains `pattern`.
    pub fn refuse_urls_containing(&self, pattern: &str) {
        self.refused
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(pattern.to_string());
    }

    /// Accepts every URL again.
    pub fn accept_all(&self) {
        self.refused
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Every URL `open` was called with, in order, refused ones included.
    pub fn opened_urls(&self) -> Vec<String> {
        self.opened
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Waits for the next accepted connection.
    pub async fn next_peer(&self) -> Option<MockPeer> {
        self.peers_rx.lock().await.recv().await
    }

    /// Returns the next accepted connection if one is already waiting.
    pub fn try_next_peer(&self) -> Option<MockPeer> {
        self.peers_rx.try_lock().ok()?.try_recv().ok()
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&self, target: &DialTarget) -> Result<TransportChannel, TransportError> {
        self.opened
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(target.url.clone());

        let refused = self
            .refused
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|pattern| target.url.contains(pattern.as_str()));
        if refused {
            return Err(TransportError::Open {
                url: target.url.clone(),
                reason: "connection refused".to_string(),
            });
        }

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::channel(64);
        let _ = self.peers_tx.send(MockPeer {
            url: target.url.clone(),
            events: events_tx,
            outbound: outbound_rx,
        });
        Ok(TransportChannel {
            handle: TransportHandle::new(outbound_tx),
            events: events_rx,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
