//! Connection manager: owns the single transport to the desktop peer and
//! drives it through the handshake.
//!
//! # Lifecycle of one attempt
//!
//! ```text
//! connect()
//!  ├─ manual?                    → cancel auto-reconnect
//!  ├─ busy?                      → Ok(AlreadyActive), nothing opened
//!  ├─ manual?                    → ManualConnectStarted
//!  ├─ address policy             → Err(AddressNotAllowed), AttemptFailed
//!  └─ begin_attempt (Idle → Connecting, new generation)
//!       └─ attempt task
//!            ├─ dial plan: <name>.local, then literal address
//!            ├─ open           → TransportOpen, arm guard, send client hello
//!            ├─ .local dropped before peer-info → Connecting, dial the address
//!            ├─ read loop      → decrypt, detect peer-info, dispatch
//!            │    └─ peer-info → Authenticated, persist endpoint, status(true)
//!            └─ close/failure  → Idle, status(false), consider auto-reconnect
//! ```
//!
//! `connect` returns once the transport opened (or every dial candidate
//! failed).  Authentication is reported asynchronously on the event bus.
//!
//! # Ordering rules
//!
//! - Every phase change is a compare-and-swap on [`SessionState`] scoped to
//!   the attempt's generation, so a late callback from an old socket is inert.
//! - Handshake completion and handshake timeout both start from
//!   `TransportOpen`; whichever swaps first wins and the other does nothing.
//! - `disconnect()` persists the manual flag and moves the session to `Idle`
//!   *before* closing the socket.  The read loop's own close handling then
//!   finds its attempt already ended and never reaches the auto-reconnect
//!   check.

use std::sync::{Arc, Mutex, PoisonError, Weak};

use async_trait::async_trait;
use pairlink_core::{
    classify_frame, dial_plan, now_ms, AddressError, AddressPolicy, ClientHello, DialKind,
    DialTarget, EndpointRecord, EndpointRegistry, InboundFrame, NetworkIdentity, PeerIdentity,
    PeerInfo, Phase, SessionSnapshot, SessionState, CLOSE_HANDSHAKE_TIMEOUT, CLOSE_NORMAL,
};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use super::events::{ConnectionEvent, EventBus};
use super::handshake_guard::HandshakeGuard;
use super::ports::{LinkConfig, LinkDependencies, TransportChannel, TransportEvent, TransportHandle};
use super::reconnect::{ReconnectDriver, ReconnectScheduler, ReconnectState};

/// Who asked for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectMode {
    /// Direct user action.  Pre-empts automatic recovery.
    Manual,
    /// Auto-reconnect loop or network-change coordinator.
    Automatic,
}

/// Successful outcome of [`ConnectionManager::connect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectStatus {
    /// An attempt was already in flight or a session was up; nothing opened.
    AlreadyActive,
    /// A transport opened; the handshake is now pending.
    TransportOpen,
}

/// Why a connection attempt failed.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("target address not allowed: {0}")]
    AddressNotAllowed(#[from] AddressError),
    #[error("could not open a transport to {peer}: {reason}")]
    TransportFailed { peer: String, reason: String },
    #[error("connection attempt was superseded")]
    Superseded,
}

/// The process-wide connection owner.
///
/// Created once with [`ConnectionManager::new`] and shared as `Arc`.
pub struct ConnectionManager {
    me: Weak<ConnectionManager>,
    config: LinkConfig,
    deps: LinkDependencies,
    session: SessionState,
    registry: EndpointRegistry,
    events: Arc<EventBus>,
    scheduler: ReconnectScheduler,
    guard: HandshakeGuard,
    network: Mutex<Option<NetworkIdentity>>,
    /// Write handle of the open transport, tagged with its attempt generation.
    transport: Mutex<Option<(u64, TransportHandle)>>,
}

impl ConnectionManager {
    /// Builds the manager from persisted settings.
    ///
    /// Loads the manual-disconnect flag, the endpoint registry, and the
    /// last active device as the initial target.
    pub fn new(
        config: LinkConfig,
        deps: LinkDependencies,
        network: Option<NetworkIdentity>,
    ) -> Arc<Self> {
        let settings = deps.settings.snapshot();
        let events = Arc::new(EventBus::default());
        let session = SessionState::new(settings.manually_disconnected);
        session.set_active_peer(settings.last_active_device.clone());

        info!(
            peers = settings.peers.len(),
            manually_disconnected = settings.manually_disconnected,
            network = ?network,
            "connection manager initialised"
        );

        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            scheduler: ReconnectScheduler::new(config.reconnect, Arc::clone(&events)),
            guard: HandshakeGuard::new(config.handshake_timeout),
            registry: EndpointRegistry::from_peers(settings.peers),
            network: Mutex::new(network),
            transport: Mutex::new(None),
            config,
            deps,
            session,
            events,
        })
    }

    // ── Queries ───────────────────────────────────────────────────────────────

    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    pub fn is_connecting(&self) -> bool {
        self.session.is_connecting()
    }

    pub fn is_auto_reconnecting(&self) -> bool {
        self.scheduler.is_active()
    }

    pub fn phase(&self) -> Phase {
        self.session.phase()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.session.snapshot()
    }

    pub fn reconnect_state(&self) -> ReconnectState {
        self.scheduler.state()
    }

    pub fn registry(&self) -> &EndpointRegistry {
        &self.registry
    }

    pub fn active_peer(&self) -> Option<EndpointRecord> {
        self.session.active_peer()
    }

    pub fn current_network(&self) -> Option<NetworkIdentity> {
        self.network
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// `true` when the persisted settings permit automatic recovery.
    pub fn auto_reconnect_allowed(&self) -> bool {
        !self.session.manually_disconnected() && self.deps.settings.snapshot().auto_reconnect_enabled
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    pub fn watch_status(&self) -> watch::Receiver<bool> {
        self.events.watch_status()
    }

    // ── Commands ──────────────────────────────────────────────────────────────

    /// Starts a connection attempt to `target`.
    ///
    /// A call while an attempt is in flight or a session is up opens nothing
    /// and returns [`ConnectStatus::AlreadyActive`].
    ///
    /// # Errors
    ///
    /// - [`ConnectError::AddressNotAllowed`] before any transport is opened.
    /// - [`ConnectError::TransportFailed`] when every dial candidate failed.
    /// - [`ConnectError::Superseded`] when a disconnect ended the attempt
    ///   while it was still dialling.
    pub async fn connect(
        &self,
        target: EndpointRecord,
        mode: ConnectMode,
    ) -> Result<ConnectStatus, ConnectError> {
        if mode == ConnectMode::Manual {
            self.scheduler.cancel();
        }
        if self.session.is_busy() {
            debug!(peer = %target.peer, ?mode, "connect ignored: attempt already active");
            return Ok(ConnectStatus::AlreadyActive);
        }
        if mode == ConnectMode::Manual {
            self.events.publish(ConnectionEvent::ManualConnectStarted {
                peer: target.peer.clone(),
            });
        }

        let policy = AddressPolicy::new(self.deps.settings.snapshot().expanded_networking);
        if let Err(error) = policy.check(&target.address) {
            warn!(peer = %target.peer, address = %target.address, %error, "refusing to dial");
            self.events.publish(ConnectionEvent::AttemptFailed {
                peer: target.peer.clone(),
                reason: error.to_string(),
            });
            self.events.publish_status(false);
            return Err(error.into());
        }

        let Some(generation) = self.session.begin_attempt() else {
            return Ok(ConnectStatus::AlreadyActive);
        };
        let Some(this) = self.me.upgrade() else {
            self.session.end_attempt(generation);
            return Err(ConnectError::Superseded);
        };
        self.session.set_active_peer(Some(target.clone()));
        info!(
            peer = %target.peer,
            address = %target.address,
            port = target.port,
            ?mode,
            generation,
            "connection attempt started"
        );

        let (opened_tx, opened_rx) = oneshot::channel();
        tokio::spawn(this.run_attempt(generation, target, mode, opened_tx));
        opened_rx.await.unwrap_or(Err(ConnectError::Superseded))
    }

    /// User-initiated disconnect.  Suppresses auto-reconnect until a new
    /// manual attempt or [`ConnectionManager::request_auto_reconnect`].
    ///
    /// Idempotent.
    pub fn disconnect(&self) {
        self.session.set_manually_disconnected(true);
        self.deps.settings.set_manually_disconnected(true);
        self.scheduler.cancel();
        if self.teardown("manual disconnect") {
            info!("disconnected by user");
        }
    }

    /// Tears the session down without touching the manual flag.
    ///
    /// Used by the network-change coordinator; does not start auto-reconnect
    /// by itself.
    pub fn force_disconnect(&self, reason: &str) {
        if self.teardown(reason) {
            info!(reason, "session torn down");
        }
    }

    /// Stops every background job and closes the transport.  The persisted
    /// manual flag is left as it is.
    pub fn shutdown(&self) {
        self.scheduler.cancel();
        self.teardown("shutdown");
        info!("connection manager shut down");
    }

    /// Encrypts and queues `payload`.
    ///
    /// Allowed as soon as the transport is open, before the handshake
    /// completes.  Never waits.
    pub fn send(&self, payload: &str) -> bool {
        if !self.session.phase().can_send() {
            return false;
        }
        let Some((_, handle)) = self
            .transport
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
        else {
            return false;
        };
        let key = self.session.active_peer().and_then(|p| p.key);
        match self.deps.cipher.encrypt(payload, key.as_ref()) {
            Ok(ciphertext) => handle.send(ciphertext),
            Err(error) => {
                warn!(%error, "failed to encrypt outbound payload");
                false
            }
        }
    }

    /// Clears the manual flag and starts the reconnect loop if possible.
    pub fn request_auto_reconnect(&self) -> bool {
        self.session.set_manually_disconnected(false);
        self.deps.settings.set_manually_disconnected(false);
        self.consider_auto_reconnect()
    }

    pub fn cancel_auto_reconnect(&self) {
        self.scheduler.cancel();
    }

    /// Persists the auto-reconnect preference; turning it off stops any loop.
    pub fn set_auto_reconnect_enabled(&self, enabled: bool) {
        self.deps.settings.set_auto_reconnect_enabled(enabled);
        if !enabled {
            self.scheduler.cancel();
        }
    }

    /// Records the local-network identity the device is now on.
    pub fn set_network(&self, network: Option<NetworkIdentity>) {
        *self.network.lock().unwrap_or_else(PoisonError::into_inner) = network;
    }

    /// Re-points the target used by the next attempt and by auto-reconnect.
    pub fn set_target(&self, record: EndpointRecord) {
        self.session.set_active_peer(Some(record));
    }

    /// Reloads the endpoint registry from the settings store.
    pub fn reload_registry(&self) {
        self.registry.replace_all(self.deps.settings.snapshot().peers);
    }

    /// Starts the reconnect loop if every entry condition holds.
    ///
    /// Conditions: no loop running, not manually disconnected, the feature
    /// enabled, not already connected, and a resolvable target.
    pub fn consider_auto_reconnect(&self) -> bool {
        if self.scheduler.is_active() {
            return false;
        }
        if self.session.manually_disconnected() {
            debug!("auto-reconnect suppressed by manual disconnect");
            return false;
        }
        if !self.deps.settings.snapshot().auto_reconnect_enabled {
            debug!("auto-reconnect disabled");
            return false;
        }
        if self.session.is_connected() {
            return false;
        }
        if self.resolve_reconnect_target().is_none() {
            debug!("auto-reconnect skipped: no known endpoint");
            return false;
        }
        let driver: Weak<dyn ReconnectDriver> = self.me.clone();
        self.scheduler.start(driver)
    }

    // ── Attempt internals ─────────────────────────────────────────────────────

    /// Endpoint auto-reconnect should dial: the active peer on this network,
    /// else the most recent peer seen on this network, else the last active
    /// device regardless of network.
    fn resolve_reconnect_target(&self) -> Option<EndpointRecord> {
        if let Some(network) = self.current_network() {
            let on_network = self
                .session
                .active_peer()
                .and_then(|active| self.registry.lookup(&active.peer, &network))
                .or_else(|| self.registry.most_recent_across_networks(&network));
            if on_network.is_some() {
                return on_network;
            }
        }
        self.deps.settings.snapshot().last_active_device
    }

    async fn run_attempt(
        self: Arc<Self>,
        generation: u64,
        target: EndpointRecord,
        mode: ConnectMode,
        opened: oneshot::Sender<Result<ConnectStatus, ConnectError>>,
    ) {
        let plan = dial_plan(&target);
        let mut opened = Some(opened);
        let mut next = 0;

        let cause = loop {
            let (index, channel) = match self.open_first_reachable(&plan[next..]).await {
                Ok((offset, channel)) => (next + offset, channel),
                Err(reason) => {
                    warn!(peer = %target.peer, %reason, "every dial candidate failed");
                    self.events.publish(ConnectionEvent::AttemptFailed {
                        peer: target.peer.clone(),
                        reason: reason.clone(),
                    });
                    if let Some(opened) = opened.take() {
                        let _ = opened.send(Err(ConnectError::TransportFailed {
                            peer: target.peer.to_string(),
                            reason,
                        }));
                    }
                    break "transport open failed".to_string();
                }
            };

            let TransportChannel { handle, mut events } = channel;
            if !self.install_transport(generation, &handle) {
                debug!(generation, "attempt ended while dialling; closing fresh transport");
                handle.close(CLOSE_NORMAL, "superseded");
                if let Some(opened) = opened.take() {
                    let _ = opened.send(Err(ConnectError::Superseded));
                }
                return;
            }
            info!(peer = %target.peer, url = %plan[index].url, generation, "transport open; awaiting peer-info");

            let weak = self.me.clone();
            let peer = target.peer.clone();
            self.guard.arm(generation, move || {
                if let Some(manager) = weak.upgrade() {
                    manager.on_handshake_timeout(generation, peer, mode);
                }
            });
            self.send_client_hello(&handle, &target);
            if let Some(opened) = opened.take() {
                let _ = opened.send(Ok(ConnectStatus::TransportOpen));
            }

            let cause = self
                .read_loop(generation, &target, &handle, &mut events)
                .await;

            let named = plan[index].kind == DialKind::Named;
            if named && index + 1 < plan.len() && self.step_back_to_connecting(generation) {
                info!(peer = %target.peer, %cause, "named endpoint dropped before handshake; retrying literal address");
                next = index + 1;
                continue;
            }
            break cause;
        };
        self.finish_attempt(generation, &cause);
    }

    /// Walks `candidates` in order.  Returns the position and channel of the
    /// first one that opens, or the last failure reason.
    async fn open_first_reachable(
        &self,
        candidates: &[DialTarget],
    ) -> Result<(usize, TransportChannel), String> {
        let mut last_error = String::from("empty dial plan");
        for (position, candidate) in candidates.iter().enumerate() {
            match self.deps.transport.open(candidate).await {
                Ok(channel) => {
                    debug!(url = %candidate.url, kind = ?candidate.kind, "dial succeeded");
                    return Ok((position, channel));
                }
                Err(error) => {
                    debug!(url = %candidate.url, kind = ?candidate.kind, %error, "dial failed");
                    last_error = error.to_string();
                }
            }
        }
        Err(last_error)
    }

    /// Returns an attempt whose transport closed before the handshake to
    /// `Connecting` and drops that transport and its guard.
    ///
    /// Fails if the attempt authenticated, timed out, or was torn down.
    fn step_back_to_connecting(&self, generation: u64) -> bool {
        let mut slot = self.transport.lock().unwrap_or_else(PoisonError::into_inner);
        if !self
            .session
            .advance(generation, Phase::TransportOpen, Phase::Connecting)
        {
            return false;
        }
        if slot.as_ref().is_some_and(|(owner, _)| *owner == generation) {
            slot.take();
        }
        drop(slot);
        self.guard.cancel_for(generation);
        true
    }

    /// Moves the attempt to `TransportOpen` and stores its handle.
    ///
    /// Fails if the attempt was ended while dialling.  The phase check and the
    /// store happen under the transport lock so a concurrent teardown either
    /// sees the handle or the attempt never installs it.
    fn install_transport(&self, generation: u64, handle: &TransportHandle) -> bool {
        let mut slot = self.transport.lock().unwrap_or_else(PoisonError::into_inner);
        if !self
            .session
            .advance(generation, Phase::Connecting, Phase::TransportOpen)
        {
            return false;
        }
        *slot = Some((generation, handle.clone()));
        true
    }

    fn take_transport(&self, generation: Option<u64>) -> Option<TransportHandle> {
        let mut slot = self.transport.lock().unwrap_or_else(PoisonError::into_inner);
        match (&*slot, generation) {
            (Some((owner, _)), Some(generation)) if *owner != generation => None,
            _ => slot.take().map(|(_, handle)| handle),
        }
    }

    fn send_client_hello(&self, handle: &TransportHandle, target: &EndpointRecord) {
        let hello = ClientHello {
            name: self.config.device_name.clone(),
            ip_address: self
                .current_network()
                .map(|n| n.to_string())
                .unwrap_or_default(),
            port: target.port,
            version: env!("CARGO_PKG_VERSION").to_string(),
        };
        let frame = match hello.to_frame() {
            Ok(frame) => frame,
            Err(error) => {
                warn!(%error, "failed to build client hello");
                return;
            }
        };
        match self.deps.cipher.encrypt(&frame, target.key.as_ref()) {
            Ok(ciphertext) => {
                if !handle.send(ciphertext) {
                    debug!("client hello not sent: transport writer gone");
                }
            }
            Err(error) => warn!(%error, "failed to encrypt client hello"),
        }
    }

    async fn read_loop(
        &self,
        generation: u64,
        target: &EndpointRecord,
        handle: &TransportHandle,
        events: &mut mpsc::Receiver<TransportEvent>,
    ) -> String {
        loop {
            tokio::select! {
                _ = handle.closed() => return "closed locally".to_string(),
                event = events.recv() => match event {
                    Some(TransportEvent::Message(text)) => self.on_frame(generation, target, text),
                    Some(TransportEvent::Closing { code, reason }) => {
                        info!(code, %reason, "peer closed the transport");
                        return format!("closed by peer ({code})");
                    }
                    Some(TransportEvent::Failure(error)) => {
                        warn!(%error, "transport failure");
                        return error;
                    }
                    None => return "transport ended".to_string(),
                },
            }
        }
    }

    fn on_frame(&self, generation: u64, target: &EndpointRecord, text: String) {
        let plaintext = match self.deps.cipher.decrypt(&text, target.key.as_ref()) {
            Ok(plaintext) => plaintext,
            Err(error) => {
                warn!(%error, "dropping frame that failed to decrypt");
                return;
            }
        };

        if self.session.phase_of(generation) == Some(Phase::TransportOpen) {
            match classify_frame(&plaintext) {
                Ok(InboundFrame::PeerInfo(info)) => self.complete_handshake(generation, target, &info),
                Ok(InboundFrame::Other { kind }) => {
                    debug!(?kind, "frame before handshake is not peer-info");
                }
                Err(error) => debug!(%error, "frame before handshake is not JSON"),
            }
        }

        self.deps.dispatcher.dispatch(plaintext);
    }

    fn complete_handshake(&self, generation: u64, target: &EndpointRecord, info: &PeerInfo) {
        if !self
            .session
            .advance(generation, Phase::TransportOpen, Phase::Authenticated)
        {
            return;
        }
        self.guard.cancel_for(generation);
        self.session.set_manually_disconnected(false);
        self.deps.settings.set_manually_disconnected(false);

        let mut record = target.clone();
        record.attributes = info.attributes();
        record.last_connected_ms = now_ms();
        match self.current_network() {
            Some(network) => {
                self.registry.upsert(&network, &record);
                self.deps.settings.save_peers(&self.registry.snapshot());
            }
            None => debug!("no network identity; endpoint not recorded in registry"),
        }
        self.deps.settings.set_last_active_device(&record);
        self.session.set_active_peer(Some(record));

        info!(
            peer = %target.peer,
            remote_name = %info.name,
            version = info.version.as_deref().unwrap_or("unknown"),
            "handshake complete; session authenticated"
        );
        self.events.publish_status(true);
    }

    fn on_handshake_timeout(&self, generation: u64, peer: PeerIdentity, mode: ConnectMode) {
        if !self
            .session
            .advance(generation, Phase::TransportOpen, Phase::Closing)
        {
            return;
        }
        warn!(%peer, ?mode, "peer never sent peer-info; treating as authentication failure");

        if mode == ConnectMode::Manual {
            self.session.set_manually_disconnected(true);
            self.deps.settings.set_manually_disconnected(true);
        }
        self.events
            .publish(ConnectionEvent::HandshakeTimedOut { peer });
        if let Some(handle) = self.take_transport(Some(generation)) {
            handle.close(CLOSE_HANDSHAKE_TIMEOUT, "handshake timeout");
        }
        self.finish_attempt(generation, "handshake timeout");
    }

    /// Ends attempt `generation` if it is still current.
    fn finish_attempt(&self, generation: u64, cause: &str) {
        let Some(previous) = self.session.end_attempt(generation) else {
            return;
        };
        self.guard.cancel_for(generation);
        self.take_transport(Some(generation));
        info!(generation, ?previous, cause, "connection ended");
        self.events.publish_status(false);

        if self.session.manually_disconnected() {
            debug!("not reconnecting: manually disconnected");
            return;
        }
        self.consider_auto_reconnect();
    }

    /// Ends whatever attempt is current and closes its transport.
    ///
    /// Returns `true` if there was anything to tear down.
    fn teardown(&self, reason: &str) -> bool {
        self.guard.cancel();
        let Some((generation, previous)) = self.session.end_current() else {
            return false;
        };
        if let Some(handle) = self.take_transport(None) {
            handle.close(CLOSE_NORMAL, reason);
        }
        debug!(generation, ?previous, reason, "teardown");
        self.events.publish_status(false);
        true
    }
}

#[async_trait]
impl ReconnectDriver for ConnectionManager {
    fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    fn reconnect_target(&self) -> Option<EndpointRecord> {
        self.resolve_reconnect_target()
    }

    async fn attempt(&self, target: EndpointRecord) {
        if let Err(error) = self.connect(target, ConnectMode::Automatic).await {
            debug!(%error, "automatic attempt failed");
        }
    }

    fn reconnected(&self, target: &EndpointRecord) {
        if self.registry.touch_last_connected(&target.peer, now_ms()) {
            self.deps.settings.save_peers(&self.registry.snapshot());
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
