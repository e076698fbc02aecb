//! Local network identity observer.
//!
//! The identity of "the network this device is on" is the device's own
//! private LAN IPv4 address.  A background task samples it at a fixed
//! interval and forwards every distinct value to the network change
//! coordinator:
//!
//! ```text
//! interval tick ─▶ probe() ─▶ dedup ─▶ mpsc<Option<NetworkIdentity>>
//! ```
//!
//! `None` means no usable LAN address (Wi-Fi off, only tunnel interfaces).
//! Loopback, link-local, tunnel interfaces, and the 198.18.0.0/15 range that
//! TUN-mode proxies hand out are never treated as a LAN.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use local_ip_address::list_afinet_netifas;
use pairlink_core::NetworkIdentity;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Failure to enumerate the local interfaces.
#[derive(Debug, Error)]
pub enum NetworkObserverError {
    #[error("failed to enumerate network interfaces: {0}")]
    Interfaces(#[from] local_ip_address::Error),
}

/// Picks the network identity from a list of `(interface, address)` pairs.
pub fn select_lan_identity(interfaces: &[(String, IpAddr)]) -> Option<NetworkIdentity> {
    interfaces.iter().find_map(|(name, ip)| match ip {
        IpAddr::V4(v4) if is_lan_candidate(name, *v4) => Some(NetworkIdentity::new(v4.to_string())),
        _ => None,
    })
}

/// Current network identity of this device.
///
/// # Errors
///
/// Returns [`NetworkObserverError::Interfaces`] if the OS refuses to list
/// interfaces.
pub fn current_network() -> Result<Option<NetworkIdentity>, NetworkObserverError> {
    let interfaces = list_afinet_netifas()?;
    Ok(select_lan_identity(&interfaces))
}

fn is_lan_candidate(interface: &str, ip: Ipv4Addr) -> bool {
    !ip.is_loopback()
        && !ip.is_link_local()
        && !is_tunnel_interface(interface)
        && !is_proxy_tun_address(ip)
        && is_private_ipv4(ip)
}

fn is_tunnel_interface(name: &str) -> bool {
    name.contains("tun") || name.contains("tap") || name.starts_with("wg")
}

fn is_proxy_tun_address(ip: Ipv4Addr) -> bool {
    let octets = ip.octets();
    octets[0] == 198 && (18..=19).contains(&octets[1])
}

fn is_private_ipv4(ip: Ipv4Addr) -> bool {
    let octets = ip.octets();
    match octets[0] {
        10 => true,
        172 => (16..=31).contains(&octets[1]),
        192 => octets[1] == 168,
        _ => false,
    }
}

/// Suppresses repeats so only real changes reach the coordinator.
#[derive(Debug, Default)]
struct ChangeFilter {
    last: Option<Option<NetworkIdentity>>,
}

impl ChangeFilter {
    fn seeded(initial: Option<NetworkIdentity>) -> Self {
        Self {
            last: Some(initial),
        }
    }

    /// Returns the value if it differs from the previous one.
    fn accept(&mut self, value: Option<NetworkIdentity>) -> Option<Option<NetworkIdentity>> {
        if self.last.as_ref() == Some(&value) {
            return None;
        }
        self.last = Some(value.clone());
        Some(value)
    }
}

/// Polls the local network identity and emits every distinct value.
pub struct NetworkObserver {
    interval: Duration,
    initial: Option<NetworkIdentity>,
}

impl NetworkObserver {
    /// `initial` is the identity the consumer already knows about; it is not
    /// re-emitted.
    pub fn new(interval: Duration, initial: Option<NetworkIdentity>) -> Self {
        Self { interval, initial }
    }

    /// Spawns the polling task.  It stops when `changes` is closed.
    pub fn spawn(self, changes: mpsc::Sender<Option<NetworkIdentity>>) -> JoinHandle<()> {
        tokio::spawn(self.run(changes, current_network))
    }

    async fn run<P>(self, changes: mpsc::Sender<Option<NetworkIdentity>>, mut probe: P)
    where
        P: FnMut() -> Result<Option<NetworkIdentity>, NetworkObserverError> + Send,
    {
        let mut filter = ChangeFilter::seeded(self.initial);
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let sample = match probe() {
                Ok(sample) => sample,
                Err(e) => {
                    warn!("network probe failed: {e}");
                    continue;
                }
            };
            let Some(change) = filter.accept(sample) else {
                continue;
            };
            info!(network = ?change, "network identity changed");
            if changes.send(change).await.is_err() {
                debug!("network change receiver dropped; observer stopping");
                return;
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
