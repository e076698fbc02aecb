//! Infrastructure layer for the client application.
//!
//! Adapters implementing the application ports against real I/O.
//!
//! **Dependency rule**: this layer may depend on `application` and
//! `pairlink_core`, but MUST NOT be imported by the `application` layer.
//!
//! # Sub-modules
//!
//! - **`transport`** – WebSocket transport (`tokio-tungstenite`) plus an
//!   in-memory `MockTransport` for tests.
//!
//! - **`crypto`** – AES-256-GCM payload cipher.
//!
//! - **`storage`** – TOML config file doubling as the persistent settings
//!   store, and an in-memory store for tests.
//!
//! - **`network_observer`** – Polls the device's LAN address and reports
//!   network identity changes.
//!
//! - **`dispatcher`** – Default message dispatcher that logs and forwards
//!   inbound payloads.

pub mod crypto;
pub mod dispatcher;
pub mod network_observer;
pub mod storage;
pub mod transport;
