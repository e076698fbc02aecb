//! SessionState: the authoritative "are we connected right now" record.
//!
//! The connection lifecycle is a single [`Phase`] rather than four loosely
//! coupled booleans.  The legacy flags (`transport_open`, `handshake_complete`,
//! `connecting`, `connected`) are derived from the phase, so contradictory
//! combinations such as "connected but not connecting-cleared" cannot exist.
//!
//! ```text
//! Idle ──begin──▶ Connecting ──open──▶ TransportOpen ──peer-info──▶ Authenticated
//!  ▲                  │                    │   │                        │
//!  │                  │                    │   └─timeout─▶ Closing ──┐  │
//!  └──────────────────┴────────────────────┴────────close/fail───────┴──┘
//! ```
//!
//! One back edge exists: a `.local` transport that closes before peer-info
//! steps its attempt from `TransportOpen` back to `Connecting` so the literal
//! address can be dialled under the same generation.
//!
//! # Attempt generations
//!
//! Every connection attempt gets a generation number when it leaves `Idle`.
//! The phase and the generation are packed into one `AtomicU64` and updated
//! with compare-and-swap, so a stale close callback from an old socket can
//! never move a newer attempt's phase: it holds the wrong generation and its
//! transition simply fails.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use serde::Serialize;

use super::endpoint::EndpointRecord;

/// Connection lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum Phase {
    Idle = 0,
    Connecting = 1,
    TransportOpen = 2,
    Authenticated = 3,
    Closing = 4,
}

impl Phase {
    fn from_bits(bits: u8) -> Self {
        match bits {
            1 => Phase::Connecting,
            2 => Phase::TransportOpen,
            3 => Phase::Authenticated,
            4 => Phase::Closing,
            _ => Phase::Idle,
        }
    }

    /// The transport is open (bytes may be sent), authenticated or not.
    pub fn transport_open(self) -> bool {
        matches!(self, Phase::TransportOpen | Phase::Authenticated)
    }

    /// Alias of [`Phase::transport_open`]: sending never waits for the handshake.
    pub fn can_send(self) -> bool {
        self.transport_open()
    }

    /// The peer-info handshake has completed on the current transport.
    pub fn handshake_complete(self) -> bool {
        self == Phase::Authenticated
    }

    /// An attempt is in flight but not yet authenticated.
    pub fn is_connecting(self) -> bool {
        matches!(self, Phase::Connecting | Phase::TransportOpen)
    }

    /// The session is authenticated.
    pub fn is_connected(self) -> bool {
        self == Phase::Authenticated
    }
}

const PHASE_MASK: u64 = 0xff;

fn pack(generation: u64, phase: Phase) -> u64 {
    (generation << 8) | phase as u64
}

fn unpack(word: u64) -> (u64, Phase) {
    (word >> 8, Phase::from_bits((word & PHASE_MASK) as u8))
}

/// Point-in-time copy of the session, safe to hand to any observer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub phase: Phase,
    pub generation: u64,
    pub transport_open: bool,
    pub handshake_complete: bool,
    pub connecting: bool,
    pub connected: bool,
    pub manually_disconnected: bool,
    #[serde(skip)]
    pub active_peer: Option<EndpointRecord>,
}

/// Process-wide session record.  Mutated only by the connection manager and
/// the reconnect scheduler; read by everyone.
#[derive(Debug)]
pub struct SessionState {
    word: AtomicU64,
    manually_disconnected: AtomicBool,
    active_peer: Mutex<Option<EndpointRecord>>,
}

impl SessionState {
    /// Creates an idle session.  `manually_disconnected` is the persisted value.
    pub fn new(manually_disconnected: bool) -> Self {
        Self {
            word: AtomicU64::new(pack(0, Phase::Idle)),
            manually_disconnected: AtomicBool::new(manually_disconnected),
            active_peer: Mutex::new(None),
        }
    }

    pub fn phase(&self) -> Phase {
        unpack(self.word.load(Ordering::Acquire)).1
    }

    pub fn generation(&self) -> u64 {
        unpack(self.word.load(Ordering::Acquire)).0
    }

    /// Phase of attempt `generation`, or `None` if a newer attempt replaced it.
    pub fn phase_of(&self, generation: u64) -> Option<Phase> {
        let (current, phase) = unpack(self.word.load(Ordering::Acquire));
        (current == generation).then_some(phase)
    }

    pub fn is_connected(&self) -> bool {
        self.phase().is_connected()
    }

    pub fn is_connecting(&self) -> bool {
        self.phase().is_connecting()
    }

    /// `true` while any attempt owns the session (not `Idle`).
    pub fn is_busy(&self) -> bool {
        self.phase() != Phase::Idle
    }

    /// Claims the session for a new attempt: `Idle → Connecting`.
    ///
    /// Returns the new attempt's generation, or `None` when another attempt
    /// already owns the session.
    pub fn begin_attempt(&self) -> Option<u64> {
        self.word
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                let (generation, phase) = unpack(word);
                (phase == Phase::Idle).then(|| pack(generation + 1, Phase::Connecting))
            })
            .ok()
            .map(|previous| unpack(previous).0 + 1)
    }

    /// Moves attempt `generation` from `from` to `to`.
    ///
    /// Fails (returns `false`) if the attempt is stale or not in `from`.
    pub fn advance(&self, generation: u64, from: Phase, to: Phase) -> bool {
        self.word
            .compare_exchange(
                pack(generation, from),
                pack(generation, to),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Ends attempt `generation`, whatever phase it reached.
    ///
    /// Returns the phase it was in, or `None` if it was already ended or
    /// superseded.  Exactly one caller wins for a given attempt.
    pub fn end_attempt(&self, generation: u64) -> Option<Phase> {
        self.word
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                let (current, phase) = unpack(word);
                (current == generation && phase != Phase::Idle)
                    .then(|| pack(current, Phase::Idle))
            })
            .ok()
            .map(|previous| unpack(previous).1)
    }

    /// Ends whichever attempt currently owns the session.
    ///
    /// Returns `(generation, previous phase)`, or `None` if already idle.
    pub fn end_current(&self) -> Option<(u64, Phase)> {
        self.word
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                let (current, phase) = unpack(word);
                (phase != Phase::Idle).then(|| pack(current, Phase::Idle))
            })
            .ok()
            .map(unpack)
    }

    pub fn manually_disconnected(&self) -> bool {
        self.manually_disconnected.load(Ordering::Acquire)
    }

    pub fn set_manually_disconnected(&self, value: bool) {
        self.manually_disconnected.store(value, Ordering::Release);
    }

    pub fn active_peer(&self) -> Option<EndpointRecord> {
        self.active_peer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_active_peer(&self, record: Option<EndpointRecord>) {
        *self.active_peer.lock().unwrap_or_else(PoisonError::into_inner) = record;
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let (generation, phase) = unpack(self.word.load(Ordering::Acquire));
        SessionSnapshot {
            phase,
            generation,
            transport_open: phase.transport_open(),
            handshake_complete: phase.handshake_complete(),
            connecting: phase.is_connecting(),
            connected: phase.is_connected(),
            manually_disconnected: self.manually_disconnected(),
            active_peer: self.active_peer(),
        }
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new(false)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
