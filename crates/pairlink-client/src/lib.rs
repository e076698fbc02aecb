//! pairlink-client library entry point.
//!
//! Re-exports all public modules so that integration tests in `tests/`
//! and the binary entry point in `main.rs` share the same module tree.
//!
//! # What does pairlink-client do?
//!
//! It keeps one authenticated session alive between this device and a
//! desktop peer on the same local network:
//!
//! 1. Dials the peer over WebSocket, by mDNS name first and literal address
//!    second.
//! 2. Sends a client hello and waits for the peer's peer-info message, which
//!    proves both sides share the session key.  A peer that stays silent for
//!    seven seconds is reported as an authentication failure.
//! 3. Records where the peer was reachable on the current Wi-Fi network.
//! 4. When the session drops, retries in the background (10 s apart, then
//!    60 s apart, for up to ten minutes) unless the user disconnected.
//! 5. When the device changes network, switches to the peer's address on the
//!    new network instead of keeping a socket to the old one.

/// Application layer: connection lifecycle use cases and ports.
pub mod application;

/// Infrastructure layer: transport, crypto, storage, and network adapters.
pub mod infrastructure;
