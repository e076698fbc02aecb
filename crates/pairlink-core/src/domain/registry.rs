//! EndpointRegistry: where has each peer been reachable, per network.
//!
//! The registry is a pure data store.  It never opens sockets and never
//! decides *when* to connect; it only answers "what address should I dial
//! for this peer on this network".  All methods take `&self` and are safe to
//! call from any thread or task.
//!
//! # Invariants
//!
//! - At most one address per (peer, network) pair.  A new handshake on the
//!   same network supersedes the old address.
//! - Entries are never removed automatically, only superseded or replaced
//!   wholesale by [`EndpointRegistry::replace_all`] when the persisted table
//!   is reloaded.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use tracing::debug;

use super::endpoint::{EndpointRecord, KnownPeer, NetworkIdentity, PeerIdentity};

/// Thread-safe (peer, network) → endpoint mapping.
#[derive(Debug, Default)]
pub struct EndpointRegistry {
    peers: RwLock<BTreeMap<PeerIdentity, KnownPeer>>,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a registry pre-populated from a persisted table.
    pub fn from_peers(peers: Vec<KnownPeer>) -> Self {
        let registry = Self::new();
        registry.replace_all(peers);
        registry
    }

    /// Replaces the whole in-memory view with `peers`.
    ///
    /// Later duplicates of the same peer name win.
    pub fn replace_all(&self, peers: Vec<KnownPeer>) {
        let map: BTreeMap<PeerIdentity, KnownPeer> =
            peers.into_iter().map(|p| (p.name.clone(), p)).collect();
        *self.peers.write().unwrap_or_else(PoisonError::into_inner) = map;
    }

    /// Returns every stored peer, ordered by name.
    pub fn snapshot(&self) -> Vec<KnownPeer> {
        self.peers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn get(&self, peer: &PeerIdentity) -> Option<KnownPeer> {
        self.peers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(peer)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.peers.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Records `record` as the authoritative endpoint of its peer on `network`.
    ///
    /// Port, key, attributes and the last-connected timestamp are peer-wide
    /// and overwritten; the address only replaces the entry for `network`.
    /// Returns the updated stored entry.
    pub fn upsert(&self, network: &NetworkIdentity, record: &EndpointRecord) -> KnownPeer {
        let mut peers = self.peers.write().unwrap_or_else(PoisonError::into_inner);
        let entry = peers
            .entry(record.peer.clone())
            .or_insert_with(|| KnownPeer {
                name: record.peer.clone(),
                port: record.port,
                key: None,
                last_connected_ms: 0,
                addresses: BTreeMap::new(),
                attributes: Default::default(),
            });

        entry.port = record.port;
        entry.key = record.key.clone();
        entry.attributes = record.attributes.clone();
        entry.last_connected_ms = entry.last_connected_ms.max(record.last_connected_ms);
        let previous = entry
            .addresses
            .insert(network.clone(), record.address.clone());

        debug!(
            peer = %record.peer,
            network = %network,
            address = %record.address,
            superseded = ?previous,
            "endpoint registry upsert"
        );
        entry.clone()
    }

    /// Resolves `peer` on `network`.
    pub fn lookup(&self, peer: &PeerIdentity, network: &NetworkIdentity) -> Option<EndpointRecord> {
        self.peers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(peer)
            .and_then(|p| p.resolve(network))
    }

    /// Among every peer reachable on `network`, returns the one with the most
    /// recent successful connection.
    pub fn most_recent_across_networks(
        &self,
        network: &NetworkIdentity,
    ) -> Option<EndpointRecord> {
        self.peers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter_map(|p| p.resolve(network))
            .max_by_key(|r| r.last_connected_ms)
    }

    /// Stamps `peer` as successfully connected at `at_ms`.
    ///
    /// Returns `false` if the peer is unknown.
    pub fn touch_last_connected(&self, peer: &PeerIdentity, at_ms: u64) -> bool {
        let mut peers = self.peers.write().unwrap_or_else(PoisonError::into_inner);
        match peers.get_mut(peer) {
            Some(entry) => {
                entry.last_connected_ms = entry.last_connected_ms.max(at_ms);
                true
            }
            None => false,
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::endpoint::{PeerAttributes, SessionKey};

    fn record(peer: &str, address: &str, last_connected_ms: u64) -> EndpointRecord {
        EndpointRecord {
            peer: PeerIdentity::new(peer),
            address: address.to_string(),
            port: 6996,
            key: Some(SessionKey::new("a2V5")),
            last_connected_ms,
            attributes: PeerAttributes::default(),
        }
    }

    fn net(token: &str) -> NetworkIdentity {
        NetworkIdentity::new(token)
    }

    #[test]
    fn test_upsert_then_lookup_returns_address_for_that_network() {
        // Arrange
        let registry = EndpointRegistry::new();

        // Act
        registry.upsert(&net("home"), &record("studio", "192.168.1.10", 1));

        // Assert
        let found = registry.lookup(&PeerIdentity::new("studio"), &net("home")).unwrap();
        assert_eq!(found.address, "192.168.1.10");
        assert!(registry.lookup(&PeerIdentity::new("studio"), &net("office")).is_none());
    }

    #[test]
    fn test_upsert_keeps_one_address_per_network() {
        // Arrange
        let registry = EndpointRegistry::new();
        registry.upsert(&net("home"), &record("studio", "192.168.1.10", 1));

        // Act: the peer moved to a new DHCP lease on the same network
        registry.upsert(&net("home"), &record("studio", "192.168.1.77", 2));

        // Assert
        let stored = registry.get(&PeerIdentity::new("studio")).unwrap();
        assert_eq!(stored.addresses.len(), 1);
        assert_eq!(stored.addresses[&net("home")], "192.168.1.77");
    }

    #[test]
    fn test_upsert_on_second_network_keeps_first_mapping() {
        let registry = EndpointRegistry::new();
        registry.upsert(&net("home"), &record("studio", "192.168.1.10", 1));
        registry.upsert(&net("office"), &record("studio", "10.0.4.2", 2));

        let stored = registry.get(&PeerIdentity::new("studio")).unwrap();
        assert_eq!(stored.addresses.len(), 2);
        assert_eq!(
            registry.lookup(&PeerIdentity::new("studio"), &net("home")).unwrap().address,
            "192.168.1.10"
        );
    }

    #[test]
    fn test_most_recent_across_networks_filters_to_current_network() {
        // Arrange: "laptop" is newer but was never seen on "home"
        let registry = EndpointRegistry::new();
        registry.upsert(&net("home"), &record("studio", "192.168.1.10", 100));
        registry.upsert(&net("office"), &record("laptop", "10.0.4.2", 500));

        // Act
        let best = registry.most_recent_across_networks(&net("home")).unwrap();

        // Assert
        assert_eq!(best.peer, PeerIdentity::new("studio"));
    }

    #[test]
    fn test_most_recent_across_networks_picks_latest_timestamp() {
        let registry = EndpointRegistry::new();
        registry.upsert(&net("home"), &record("studio", "192.168.1.10", 100));
        registry.upsert(&net("home"), &record("laptop", "192.168.1.11", 500));

        let best = registry.most_recent_across_networks(&net("home")).unwrap();
        assert_eq!(best.peer, PeerIdentity::new("laptop"));
    }

    #[test]
    fn test_most_recent_across_networks_empty_registry_returns_none() {
        let registry = EndpointRegistry::new();
        assert!(registry.most_recent_across_networks(&net("home")).is_none());
    }

    #[test]
    fn test_touch_last_connected_never_moves_backwards() {
        // Arrange
        let registry = EndpointRegistry::new();
        registry.upsert(&net("home"), &record("studio", "192.168.1.10", 900));

        // Act
        assert!(registry.touch_last_connected(&PeerIdentity::new("studio"), 1_000));
        assert!(registry.touch_last_connected(&PeerIdentity::new("studio"), 10));

        // Assert
        let stored = registry.get(&PeerIdentity::new("studio")).unwrap();
        assert_eq!(stored.last_connected_ms, 1_000);
    }

    #[test]
    fn test_touch_last_connected_unknown_peer_returns_false() {
        let registry = EndpointRegistry::new();
        assert!(!registry.touch_last_connected(&PeerIdentity::new("ghost"), 1));
    }

    #[test]
    fn test_replace_all_swaps_the_in_memory_view() {
        // Arrange
        let registry = EndpointRegistry::new();
        registry.upsert(&net("home"), &record("studio", "192.168.1.10", 1));
        let other = EndpointRegistry::new();
        other.upsert(&net("office"), &record("laptop", "10.0.4.2", 2));

        // Act
        registry.replace_all(other.snapshot());

        // Assert
        assert_eq!(registry.len(), 1);
        assert!(registry.get(&PeerIdentity::new("studio")).is_none());
        assert!(registry.get(&PeerIdentity::new("laptop")).is_some());
    }
}
