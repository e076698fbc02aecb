//! Wire-level shapes of a Pairlink session.
//!
//! The transport is a text WebSocket.  Every payload is a JSON object with a
//! `"type"` discriminator, encrypted end-to-end by the payload cipher once a
//! session key is known.  Only two message types matter to the connection
//! lifecycle and live here:
//!
//! - `macInfo` (peer → client): the peer-info message.  Receiving it proves
//!   the peer decrypted our traffic with the shared key, so it completes the
//!   handshake.
//! - `device` (client → peer): the client hello sent right after the
//!   transport opens.
//!
//! Everything else is business payload and is forwarded untouched.

pub mod dial;
pub mod handshake;

use thiserror::Error;

/// Well-known port the desktop peer listens on.
pub const DEFAULT_PORT: u16 = 6996;

/// Close code for an orderly, user- or coordinator-initiated close.
pub const CLOSE_NORMAL: u16 = 1000;

/// Close code sent when the peer never produced a peer-info message in time.
///
/// Private-use range (4000-4999) so the peer can tell an authentication
/// failure apart from an ordinary close.
pub const CLOSE_HANDSHAKE_TIMEOUT: u16 = 4001;

/// Errors produced while parsing or building protocol messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The frame is not valid JSON.
    #[error("malformed JSON frame: {0}")]
    Malformed(#[from] serde_json::Error),
}
