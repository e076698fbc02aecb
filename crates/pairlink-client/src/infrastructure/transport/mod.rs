//! Transport adapters.
//!
//! - **`websocket`** – Production transport over `tokio-tungstenite`.
//! - **`mock`** – Scriptable in-memory transport for tests.

pub mod mock;
pub mod websocket;
