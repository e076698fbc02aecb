//! Peer, network, and endpoint value types.
//!
//! A desktop peer keeps one stable name ([`PeerIdentity`]) but may be reachable
//! at a different address on every Wi-Fi network the phone joins.  The client
//! identifies "which network am I on" by an opaque [`NetworkIdentity`]
//! (in practice the phone's own LAN IP on that network).
//!
//! Two shapes describe a peer:
//!
//! - [`KnownPeer`] is what gets stored: one entry per peer holding the
//!   network → address map plus the pairing key and capability attributes.
//! - [`EndpointRecord`] is what gets dialled: a single resolved address for a
//!   peer, produced by looking a [`KnownPeer`] up under one network.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Logical name of the desktop peer.  Stable across networks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerIdentity(String);

impl PeerIdentity {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque token naming the local network the device is currently on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NetworkIdentity(String);

impl NetworkIdentity {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NetworkIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Base64 session key shared with the peer at pairing time.
///
/// The key has to round-trip through the settings file, so unlike an API
/// token it serializes normally; it only refuses to show up in `Debug` output
/// so it never leaks into logs.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionKey(String);

impl SessionKey {
    pub fn new(encoded: impl Into<String>) -> Self {
        Self(encoded.into())
    }

    /// The encoded key.  Only call this when handing the key to a cipher.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionKey([REDACTED; {} chars])", self.0.len())
    }
}

/// Descriptive attributes the peer reports about itself in its peer-info.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAttributes {
    /// Capability flag for the paid desktop tier.
    #[serde(default)]
    pub is_plus: bool,
    /// Hardware model string, e.g. `"MacBookPro18,3"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Device type string, e.g. `"laptop"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_type: Option<String>,
}

/// One reachable address for a peer: the thing a connection attempt dials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointRecord {
    pub peer: PeerIdentity,
    /// Literal IP address of the peer on the network this record was resolved for.
    pub address: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<SessionKey>,
    /// Milliseconds since the Unix epoch of the last authenticated session, 0 if never.
    #[serde(default)]
    pub last_connected_ms: u64,
    #[serde(default)]
    pub attributes: PeerAttributes,
}

impl EndpointRecord {
    /// Builds a record with no attributes and no connection history.
    pub fn new(
        peer: PeerIdentity,
        address: impl Into<String>,
        port: u16,
        key: Option<SessionKey>,
    ) -> Self {
        Self {
            peer,
            address: address.into(),
            port,
            key,
            last_connected_ms: 0,
            attributes: PeerAttributes::default(),
        }
    }

    /// Returns `true` when both records point at the same socket address.
    pub fn same_address(&self, other: &EndpointRecord) -> bool {
        self.address == other.address && self.port == other.port
    }
}

/// Stored registry entry for one peer across every network it was seen on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownPeer {
    pub name: PeerIdentity,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<SessionKey>,
    #[serde(default)]
    pub last_connected_ms: u64,
    /// Network identity → peer address on that network.  One entry per network.
    #[serde(default)]
    pub addresses: BTreeMap<NetworkIdentity, String>,
    #[serde(default)]
    pub attributes: PeerAttributes,
}

impl KnownPeer {
    /// Resolves this peer to a dialable record for `network`, if it was ever
    /// reached on that network.
    pub fn resolve(&self, network: &NetworkIdentity) -> Option<EndpointRecord> {
        self.addresses.get(network).map(|address| EndpointRecord {
            peer: self.name.clone(),
            address: address.clone(),
            port: self.port,
            key: self.key.clone(),
            last_connected_ms: self.last_connected_ms,
            attributes: self.attributes.clone(),
        })
    }
}

/// Milliseconds since the Unix epoch, or 0 if the clock is before it.
pub fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_peer() -> KnownPeer {
        let mut addresses = BTreeMap::new();
        addresses.insert(NetworkIdentity::new("192.168.1.20"), "192.168.1.10".to_string());
        KnownPeer {
            name: PeerIdentity::new("studio"),
            port: 6996,
            key: Some(SessionKey::new("a2V5")),
            last_connected_ms: 42,
            addresses,
            attributes: PeerAttributes {
                is_plus: true,
                model: Some("Mac14,2".to_string()),
                device_type: None,
            },
        }
    }

    #[test]
    fn test_session_key_debug_never_shows_key_material() {
        // Arrange
        let key = SessionKey::new("c3VwZXItc2VjcmV0");

        // Act
        let rendered = format!("{key:?}");

        // Assert
        assert!(!rendered.contains("c3VwZXItc2VjcmV0"));
        assert!(rendered.contains("REDACTED"));
    }

    #[test]
    fn test_known_peer_resolves_address_for_seen_network() {
        // Arrange
        let peer = sample_peer();

        // Act
        let record = peer.resolve(&NetworkIdentity::new("192.168.1.20")).unwrap();

        // Assert
        assert_eq!(record.address, "192.168.1.10");
        assert_eq!(record.port, 6996);
        assert_eq!(record.last_connected_ms, 42);
        assert!(record.attributes.is_plus);
    }

    #[test]
    fn test_known_peer_resolve_returns_none_for_unseen_network() {
        let peer = sample_peer();
        assert!(peer.resolve(&NetworkIdentity::new("10.0.0.7")).is_none());
    }

    #[test]
    fn test_same_address_compares_host_and_port() {
        let a = EndpointRecord::new(PeerIdentity::new("a"), "10.0.0.2", 6996, None);
        let b = EndpointRecord::new(PeerIdentity::new("b"), "10.0.0.2", 6996, None);
        let c = EndpointRecord::new(PeerIdentity::new("a"), "10.0.0.2", 7000, None);
        assert!(a.same_address(&b));
        assert!(!a.same_address(&c));
    }

    #[test]
    fn test_known_peer_survives_toml_with_network_keyed_addresses() {
        // Arrange
        let peer = sample_peer();

        // Act
        let text = toml::to_string(&peer).expect("serialize");
        let restored: KnownPeer = toml::from_str(&text).expect("deserialize");

        // Assert
        assert_eq!(restored, peer);
    }

    #[test]
    fn test_now_ms_is_positive() {
        assert!(now_ms() > 0);
    }
}
