//! Network change coordinator.
//!
//! Reacts to "the device is now on network X" events.  It never observes the
//! network itself; an observer feeds it `Option<NetworkIdentity>` values
//! (`None` = no usable network) and it decides, per distinct change, whether
//! to tear down, switch endpoint, or hand over to auto-reconnect.
//!
//! ```text
//! change(X)
//!  ├─ reload registry, cancel auto-reconnect
//!  ├─ X = none        → force disconnect, stop
//!  ├─ peer known on X → switch target; force disconnect if the live socket
//!  │                    points elsewhere; direct connect (fallback: loop)
//!  └─ peer unknown    → disconnect if connected; start loop
//! ```
//!
//! An open socket is never silently re-pointed: a switch is always a full
//! disconnect followed by a fresh attempt.

use std::sync::{Arc, Mutex, PoisonError};

use pairlink_core::NetworkIdentity;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::connection::{ConnectMode, ConnectionManager};

pub struct NetworkChangeCoordinator {
    manager: Arc<ConnectionManager>,
    last_seen: Mutex<Option<NetworkIdentity>>,
}

impl NetworkChangeCoordinator {
    /// The manager's current network counts as already seen.
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        let last_seen = Mutex::new(manager.current_network());
        Self { manager, last_seen }
    }

    /// Consumes change events until the sender is dropped.
    pub async fn run(self, mut changes: mpsc::Receiver<Option<NetworkIdentity>>) {
        while let Some(network) = changes.recv().await {
            self.handle_change(network).await;
        }
        debug!("network change stream ended");
    }

    /// Applies one network change.  Repeats of the last value are ignored.
    pub async fn handle_change(&self, network: Option<NetworkIdentity>) {
        {
            let mut last_seen = self.last_seen.lock().unwrap_or_else(PoisonError::into_inner);
            if *last_seen == network {
                debug!(?network, "network unchanged");
                return;
            }
            *last_seen = network.clone();
        }
        info!(?network, "local network changed");

        let manager = &self.manager;
        manager.set_network(network.clone());
        manager.reload_registry();
        manager.cancel_auto_reconnect();

        let Some(network) = network else {
            if manager.is_connected() || manager.is_connecting() {
                manager.force_disconnect("network lost");
            }
            return;
        };

        let known = manager
            .active_peer()
            .and_then(|active| manager.registry().lookup(&active.peer, &network));

        match known {
            Some(record) => {
                let busy = manager.is_connected() || manager.is_connecting();
                let same_socket = manager
                    .active_peer()
                    .is_some_and(|active| active.same_address(&record));
                if busy && !same_socket {
                    manager.force_disconnect("switching network");
                }
                info!(peer = %record.peer, address = %record.address, "endpoint for new network");
                manager.set_target(record.clone());

                if !manager.auto_reconnect_allowed() {
                    return;
                }
                if let Err(error) = manager.connect(record, ConnectMode::Automatic).await {
                    debug!(%error, "direct connect after network change failed");
                    manager.consider_auto_reconnect();
                }
            }
            None => {
                if manager.is_connected() {
                    manager.force_disconnect("peer unknown on new network");
                }
                if manager.auto_reconnect_allowed() {
                    manager.consider_auto_reconnect();
                }
            }
        }
    }
}
