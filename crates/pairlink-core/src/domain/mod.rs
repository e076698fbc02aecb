//! Domain entities for Pairlink.
//!
//! Pure business logic with no infrastructure dependencies.  Code in the
//! client's application and infrastructure layers depends on these types, but
//! nothing in here depends on them.

/// Local-network address policy (which hosts a client may dial).
pub mod address;

/// Peer, network, and endpoint value types.
pub mod endpoint;

/// Attempt-count based backoff schedule for automatic reconnection.
pub mod reconnect_policy;

/// (peer, network) → endpoint mapping.
pub mod registry;

/// Lock-free record of the current connection phase.
pub mod session;
