//! Application layer of the client: the connection lifecycle.
//!
//! # What lives here?
//!
//! - **`connection`** – The `ConnectionManager`.  Owns the one transport to the
//!   desktop peer, drives the handshake, and reports status.
//!
//! - **`handshake_guard`** – The timer that turns a silent peer into an
//!   authentication failure.
//!
//! - **`reconnect`** – The auto-reconnect loop with its 10 s / 60 s backoff
//!   and ten-minute window.
//!
//! - **`network_change`** – Reacts to Wi-Fi changes by switching endpoint or
//!   handing over to auto-reconnect.
//!
//! - **`events`** – Typed event stream observers subscribe to.
//!
//! - **`ports`** – Traits for the outside world (transport, cipher, settings,
//!   message dispatch).  Implemented in `infrastructure`.

pub mod connection;
pub mod events;
pub mod handshake_guard;
pub mod network_change;
pub mod ports;
pub mod reconnect;
