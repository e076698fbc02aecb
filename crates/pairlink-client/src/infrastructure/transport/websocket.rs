//! WebSocket transport over `tokio-tungstenite`.
//!
//! Each open spawns two tasks around the split stream:
//!
//! ```text
//!              TransportHandle ──mpsc──▶ writer task ──▶ ws sink
//! ws stream ──▶ reader task ──mpsc──▶ TransportEvent receiver
//! ```
//!
//! The writer stops after it sends a close frame.  The reader reports exactly
//! one terminal event (`Closing` or `Failure`) and stops.
//!
//! Ping/Pong is answered by tungstenite itself; binary frames are not part of
//! the protocol and are dropped.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use pairlink_core::DialTarget;
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        protocol::{frame::coding::CloseCode, CloseFrame},
        Error as WsError, Message as WsMessage,
    },
};
use tracing::{debug, trace, warn};

use crate::application::ports::{
    OutboundFrame, Transport, TransportChannel, TransportError, TransportEvent, TransportHandle,
};

/// Close code reported when the stream ends without a close frame.
const ABNORMAL_CLOSURE: u16 = 1006;

/// Production [`Transport`].
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    open_timeout: Duration,
}

impl WebSocketTransport {
    pub fn new(open_timeout: Duration) -> Self {
        Self { open_timeout }
    }
}

impl Default for WebSocketTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self, target: &DialTarget) -> Result<TransportChannel, TransportError> {
        let url = target.url.clone();
        let (stream, _response) =
            match tokio::time::timeout(self.open_timeout, connect_async(url.as_str())).await {
                Err(_) => {
                    return Err(TransportError::TimedOut {
                        url,
                        after: self.open_timeout,
                    })
                }
                Ok(Err(WsError::Url(e))) => {
                    return Err(TransportError::InvalidUrl {
                        url,
                        reason: e.to_string(),
                    })
                }
                Ok(Err(e)) => {
                    return Err(TransportError::Open {
                        url,
                        reason: e.to_string(),
                    })
                }
                Ok(Ok(pair)) => pair,
            };
        debug!(%url, "websocket open");

        let (mut sink, mut source) = stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<OutboundFrame>();
        let (events_tx, events_rx) = mpsc::channel(128);

        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                match frame {
                    OutboundFrame::Text(text) => {
                        if let Err(e) = sink.send(WsMessage::Text(text)).await {
                            debug!("websocket write failed: {e}");
                            break;
                        }
                    }
                    OutboundFrame::Close { code, reason } => {
                        let frame = CloseFrame {
                            code: CloseCode::from(code),
                            reason: reason.into(),
                        };
                        if let Err(e) = sink.send(WsMessage::Close(Some(frame))).await {
                            debug!("websocket close failed: {e}");
                        }
                        break;
                    }
                }
            }
            trace!("websocket writer stopped");
        });

        tokio::spawn(async move {
            let terminal = loop {
                match source.next().await {
                    Some(Ok(WsMessage::Text(text))) => {
                        if events_tx.send(TransportEvent::Message(text)).await.is_err() {
                            return;
                        }
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        let (code, reason) = frame
                            .map(|f| (u16::from(f.code), f.reason.into_owned()))
                            .unwrap_or((ABNORMAL_CLOSURE, String::new()));
                        break TransportEvent::Closing { code, reason };
                    }
                    Some(Ok(WsMessage::Binary(data))) => {
                        warn!(len = data.len(), "ignoring binary websocket frame");
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break TransportEvent::Failure(e.to_string()),
                    None => {
                        break TransportEvent::Closing {
                            code: ABNORMAL_CLOSURE,
                            reason: "stream ended".to_string(),
                        }
                    }
                }
            };
            let _ = events_tx.send(terminal).await;
            trace!("websocket reader stopped");
        });

        Ok(TransportChannel {
            handle: TransportHandle::new(outbound_tx),
            events: events_rx,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use pairlink_core::DialKind;

    use super::*;

    #[tokio::test]
    async fn test_open_refused_port_reports_open_error() {
        // Arrange: bind then drop a listener so the port is closed
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let transport = WebSocketTransport::new(Duration::from_secs(2));

        // Act
        let result = transport
            .open(&DialTarget {
                kind: DialKind::Direct,
                url: format!("ws://{addr}/socket"),
            })
            .await;

        // Assert
        assert!(matches!(result, Err(TransportError::Open { .. })));
    }

    #[tokio::test]
    async fn test_open_non_ws_scheme_reports_invalid_url() {
        let transport = WebSocketTransport::default();
        let result = transport
            .open(&DialTarget {
                kind: DialKind::Direct,
                url: "http://10.0.0.2/socket".to_string(),
            })
            .await;
        assert!(matches!(result, Err(TransportError::InvalidUrl { .. })));
    }
}
