//! Pairlink client entry point.
//!
//! Wires the connection manager to its production adapters and keeps one
//! session to the desktop peer alive until Ctrl-C.
//!
//! # Architecture
//!
//! ```text
//! main()
//!  ├─ load config.toml            -- tunables + persisted session state
//!  ├─ ConnectionManager::new()    -- WebSocket, AES-GCM, TOML store, dispatcher
//!  ├─ NetworkObserver::spawn()    -- local LAN identity poller
//!  ├─ NetworkChangeCoordinator    -- reacts to identity changes
//!  ├─ initial connect             -- CLI peer, else last active device
//!  └─ stdin loop                  -- lines are sent to the peer
//!       ├─ /status                -> log session snapshot
//!       ├─ /disconnect            -> manual disconnect
//!       └─ /reconnect             -> clear manual flag, start auto-reconnect
//! ```
//!
//! Inbound payloads are printed to stdout, one per line.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use pairlink_client::application::connection::{ConnectMode, ConnectionManager};
use pairlink_client::application::events::ConnectionEvent;
use pairlink_client::application::network_change::NetworkChangeCoordinator;
use pairlink_client::application::ports::LinkDependencies;
use pairlink_client::infrastructure::{
    crypto::AesGcmCipher,
    dispatcher::LoggingDispatcher,
    network_observer::{current_network, NetworkObserver},
    storage::config::{config_file_path, load_config, AppConfig, TomlSettingsStore},
    transport::websocket::WebSocketTransport,
};
use pairlink_core::{EndpointRecord, NetworkIdentity, PeerIdentity, SessionKey};

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Pairlink mobile-side client.
///
/// Connects to a paired desktop peer over the local network and keeps the
/// session alive across drops and Wi-Fi changes.
#[derive(Debug, Parser)]
#[command(name = "pairlink", version)]
struct Cli {
    /// Path to config.toml.  Defaults to the platform config directory.
    #[arg(long, env = "PAIRLINK_CONFIG")]
    config: Option<PathBuf>,

    /// Name of the desktop peer.  Looked up in the registry when no
    /// `--address` is given.
    #[arg(long, env = "PAIRLINK_PEER")]
    peer: Option<String>,

    /// Literal IP address of the desktop peer on the current network.
    #[arg(long, env = "PAIRLINK_ADDRESS")]
    address: Option<String>,

    /// Port of the desktop peer.  Defaults to `link.default_port`.
    #[arg(long, env = "PAIRLINK_PORT")]
    port: Option<u16>,

    /// Base64 session key shared at pairing time.
    #[arg(long, env = "PAIRLINK_KEY", hide_env_values = true)]
    key: Option<String>,

    /// Name announced to the peer.  Overrides `client.device_name`.
    #[arg(long, env = "PAIRLINK_DEVICE_NAME")]
    device_name: Option<String>,

    /// Allow peers outside the private LAN ranges.
    #[arg(long, env = "PAIRLINK_EXPANDED_NETWORKING")]
    expanded_networking: bool,

    /// Never reconnect automatically.
    #[arg(long, env = "PAIRLINK_NO_AUTO_RECONNECT")]
    no_auto_reconnect: bool,
}

impl Cli {
    /// Applies the command-line overrides to the loaded configuration.
    fn apply_to(&self, config: &mut AppConfig) {
        if let Some(name) = &self.device_name {
            config.client.device_name = name.clone();
        }
        if self.expanded_networking {
            config.preferences.expanded_networking = true;
        }
        if self.no_auto_reconnect {
            config.preferences.auto_reconnect_enabled = false;
        }
    }

    /// Endpoint named explicitly on the command line, if any.
    fn explicit_target(&self, default_port: u16) -> Option<EndpointRecord> {
        let address = self.address.clone()?;
        let name = self.peer.clone().unwrap_or_else(|| address.clone());
        Some(EndpointRecord::new(
            PeerIdentity::new(name),
            address,
            self.port.unwrap_or(default_port),
            self.key.clone().map(SessionKey::new),
        ))
    }
}

/// Chooses what to dial at startup and whether the user asked for it.
fn startup_target(
    cli: &Cli,
    manager: &ConnectionManager,
    default_port: u16,
    network: Option<&NetworkIdentity>,
) -> Option<(EndpointRecord, ConnectMode)> {
    if let Some(record) = cli.explicit_target(default_port) {
        return Some((record, ConnectMode::Manual));
    }
    if let Some(name) = &cli.peer {
        let peer = manager.registry().get(&PeerIdentity::new(name.as_str()))?;
        let record = network.and_then(|n| peer.resolve(n)).or_else(|| {
            manager
                .active_peer()
                .filter(|active| active.peer.as_str() == name.as_str())
        })?;
        return Some((record, ConnectMode::Manual));
    }
    if manager.snapshot().manually_disconnected {
        info!("last session was ended by the user; not connecting automatically");
        return None;
    }
    let record = network
        .and_then(|n| {
            manager
                .active_peer()
                .and_then(|active| manager.registry().lookup(&active.peer, n))
        })
        .or_else(|| manager.active_peer())?;
    Some((record, ConnectMode::Automatic))
}

async fn log_events(mut events: broadcast::Receiver<ConnectionEvent>) {
    loop {
        match events.recv().await {
            Ok(ConnectionEvent::StatusChanged { connected }) => {
                info!(connected, "connection status");
            }
            Ok(event) => debug!(?event, "connection event"),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "event log fell behind");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // ── Configuration ─────────────────────────────────────────────────────────
    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => config_file_path().context("locating config file")?,
    };
    let mut config = load_config(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    cli.apply_to(&mut config);

    // ── Logging setup ─────────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.client.log_level)),
        )
        .init();

    info!(config = %config_path.display(), "Pairlink client starting");

    // ── Adapters ──────────────────────────────────────────────────────────────
    let network = current_network().unwrap_or_else(|e| {
        warn!("could not determine local network: {e}");
        None
    });
    let link_config = config.link_config();
    let default_port = config.link.default_port;
    let open_timeout = config.link.open_timeout();
    let poll_interval = config.link.network_poll_interval();

    let (payload_tx, mut payload_rx) = mpsc::unbounded_channel();
    let store = TomlSettingsStore::new(config_path, config);
    let deps = LinkDependencies {
        transport: Arc::new(WebSocketTransport::new(open_timeout)),
        cipher: Arc::new(AesGcmCipher),
        settings: Arc::new(store.clone()),
        dispatcher: Arc::new(LoggingDispatcher::forwarding(payload_tx)),
    };
    let manager = ConnectionManager::new(link_config, deps, network.clone());

    tokio::spawn(log_events(manager.subscribe()));
    tokio::spawn(async move {
        while let Some(payload) = payload_rx.recv().await {
            println!("{payload}");
        }
    });

    // ── Network observation ───────────────────────────────────────────────────
    let (changes_tx, changes_rx) = mpsc::channel(16);
    let observer = NetworkObserver::new(poll_interval, network.clone()).spawn(changes_tx);
    let coordinator = tokio::spawn(NetworkChangeCoordinator::new(Arc::clone(&manager)).run(changes_rx));

    // ── Initial connection ────────────────────────────────────────────────────
    match startup_target(&cli, &manager, default_port, network.as_ref()) {
        Some((record, mode)) => match manager.connect(record, mode).await {
            Ok(status) => debug!(?status, "initial connect"),
            Err(e) => {
                warn!("initial connect failed: {e}");
                manager.consider_auto_reconnect();
            }
        },
        None => info!("no peer to connect to; pass --address or --peer"),
    }

    // ── Input loop ────────────────────────────────────────────────────────────
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            signal = &mut ctrl_c => {
                if let Err(e) = signal {
                    warn!("failed to listen for Ctrl-C: {e}");
                }
                info!("shutdown signal received");
                break;
            }
            line = lines.next_line() => {
                let Some(line) = line.context("reading stdin")? else {
                    info!("stdin closed");
                    break;
                };
                match line.trim() {
                    "" => {}
                    "/status" => info!(snapshot = ?manager.snapshot(), reconnect = ?manager.reconnect_state(), "status"),
                    "/disconnect" => manager.disconnect(),
                    "/reconnect" => {
                        if !manager.request_auto_reconnect() {
                            info!("auto-reconnect not started");
                        }
                    }
                    payload => {
                        if !manager.send(payload) {
                            warn!("not sent: no open transport");
                        }
                    }
                }
            }
        }
    }

    // ── Shutdown ──────────────────────────────────────────────────────────────
    manager.shutdown();
    observer.abort();
    coordinator.abort();
    if let Err(e) = store.flush() {
        warn!("failed to save settings on exit: {e}");
    }
    info!("Pairlink client stopped");
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
