//! # pairlink-core
//!
//! Shared library for Pairlink containing the domain model of a single
//! mobile-to-desktop peer session and the handshake protocol shapes.
//!
//! This crate has zero dependencies on sockets, timers, or the file system.
//! Everything in here can be unit-tested synchronously.
//!
//! # Architecture overview
//!
//! Pairlink keeps one authenticated session alive between a mobile client and
//! a companion desktop peer on the same local network.  The client has to
//! survive Wi-Fi changes, silent peers, and transient drops without the user
//! having to reconnect by hand.
//!
//! - **`domain`** – The data the connection lifecycle is built on: peer and
//!   network identities, the [`EndpointRegistry`] that remembers where a peer
//!   was reachable on each network, the lock-free [`SessionState`] phase
//!   record, the local-address policy, and the reconnect backoff schedule.
//!
//! - **`protocol`** – What travels over the wire during the handshake: the
//!   peer-info message that authenticates a session, the client hello, the
//!   close codes, and the dial URL scheme.

pub mod domain;
pub mod protocol;

pub use domain::address::{AddressError, AddressPolicy};
pub use domain::endpoint::{
    now_ms, EndpointRecord, KnownPeer, NetworkIdentity, PeerAttributes, PeerIdentity, SessionKey,
};
pub use domain::reconnect_policy::ReconnectPolicy;
pub use domain::registry::EndpointRegistry;
pub use domain::session::{Phase, SessionSnapshot, SessionState};
pub use protocol::dial::{dial_plan, DialKind, DialTarget};
pub use protocol::handshake::{classify_frame, ClientHello, InboundFrame, PeerInfo};
pub use protocol::{ProtocolError, CLOSE_HANDSHAKE_TIMEOUT, CLOSE_NORMAL, DEFAULT_PORT};
