//! Peer-info detection and the client hello.
//!
//! # Frame shapes
//!
//! ```json
//! {"type":"macInfo","data":{"name":"Studio","isPlus":true,"model":"Mac14,2","type":"desktop","version":"2.1.0"}}
//! {"type":"device","data":{"name":"Pixel 8","ipAddress":"192.168.1.20","port":6996,"version":"0.3.0"}}
//! ```
//!
//! [`classify_frame`] only decides "is this the peer-info message or not".
//! A frame that is valid JSON but has any other shape (unknown type, missing
//! `data`, a `macInfo` whose `data` does not parse) is [`InboundFrame::Other`]:
//! it does not authenticate the session, but it is still a legitimate payload
//! for the message dispatcher.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ProtocolError;
use crate::domain::endpoint::PeerAttributes;

/// `type` discriminator of the peer-info message.
pub const PEER_INFO_TYPE: &str = "macInfo";

/// `type` discriminator of the client hello.
pub const CLIENT_HELLO_TYPE: &str = "device";

/// What the desktop peer reports about itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub is_plus: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub device_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl PeerInfo {
    /// Capability attributes to persist alongside the endpoint.
    pub fn attributes(&self) -> PeerAttributes {
        PeerAttributes {
            is_plus: self.is_plus,
            model: self.model.clone(),
            device_type: self.device_type.clone(),
        }
    }
}

/// First frame the client sends after the transport opens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientHello {
    pub name: String,
    pub ip_address: String,
    pub port: u16,
    pub version: String,
}

#[derive(Serialize)]
struct Envelope<'a, T> {
    #[serde(rename = "type")]
    kind: &'a str,
    data: &'a T,
}

impl ClientHello {
    /// Serializes the hello into its `{"type":"device","data":{...}}` frame.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Malformed`] only if serialization itself fails.
    pub fn to_frame(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(&Envelope {
            kind: CLIENT_HELLO_TYPE,
            data: self,
        })?)
    }
}

/// Result of inspecting one decrypted inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    /// The peer-info message: completes the handshake.
    PeerInfo(PeerInfo),
    /// Any other JSON payload.  `kind` is its `type` field, if it had one.
    Other { kind: Option<String> },
}

/// Classifies a decrypted frame.
///
/// # Errors
///
/// Returns [`ProtocolError::Malformed`] when the frame is not JSON at all.
pub fn classify_frame(text: &str) -> Result<InboundFrame, ProtocolError> {
    let value: Value = serde_json::from_str(text)?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .map(str::to_string);

    if kind.as_deref() != Some(PEER_INFO_TYPE) {
        return Ok(InboundFrame::Other { kind });
    }

    match value.get("data").cloned().map(serde_json::from_value::<PeerInfo>) {
        Some(Ok(info)) => Ok(InboundFrame::PeerInfo(info)),
        _ => Ok(InboundFrame::Other { kind }),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
