//! Message dispatcher that logs every inbound payload and optionally forwards
//! it to a channel for the rest of the application.

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::application::ports::MessageDispatcher;

#[derive(Debug, Default)]
pub struct LoggingDispatcher {
    forward: Option<mpsc::UnboundedSender<String>>,
}

impl LoggingDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also forwards every payload to `sink`.
    pub fn forwarding(sink: mpsc::UnboundedSender<String>) -> Self {
        Self {
            forward: Some(sink),
        }
    }
}

/// `type` discriminator of a JSON payload, if it has one.
fn payload_kind(payload: &str) -> Option<String> {
    let value: Value = serde_json::from_str(payload).ok()?;
    value.get("type")?.as_str().map(str::to_string)
}

impl MessageDispatcher for LoggingDispatcher {
    fn dispatch(&self, payload: String) {
        let kind = payload_kind(&payload);
        debug!(kind = kind.as_deref().unwrap_or("-"), len = payload.len(), "inbound payload");
        trace!(%payload);
        if let Some(forward) = &self.forward {
            // The receiver going away only means nobody is listening any more.
            let _ = forward.send(payload);
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
