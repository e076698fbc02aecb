//! Dial URL scheme.
//!
//! A connection attempt tries the peer's mDNS name first and the literal
//! address second:
//!
//! ```text
//! 1. ws://<label>.local:<port>/socket     (DialKind::Named)
//! 2. ws://<address>:<port>/socket         (DialKind::Direct)
//! ```
//!
//! The plan is a flat list walked in order by the connection manager, so the
//! name-resolution fallback is one extra step and never a recursive retry.

use std::net::IpAddr;

use crate::domain::endpoint::EndpointRecord;

/// Path the peer serves its WebSocket on.
pub const SOCKET_PATH: &str = "/socket";

/// How a [`DialTarget`] reaches the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialKind {
    /// Name-based local resolution (`<label>.local`).
    Named,
    /// Literal IP address.
    Direct,
}

/// One URL to try.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialTarget {
    pub kind: DialKind,
    pub url: String,
}

/// Turns a peer display name into a DNS label.
///
/// Whitespace becomes `-`; anything other than ASCII alphanumerics and `-`
/// is dropped.  Returns `None` if nothing usable is left.
pub fn dns_label(name: &str) -> Option<String> {
    let label: String = name
        .trim()
        .chars()
        .filter_map(|c| match c {
            c if c.is_whitespace() => Some('-'),
            c if c.is_ascii_alphanumeric() || c == '-' => Some(c),
            _ => None,
        })
        .collect();
    let label = label.trim_matches('-').to_string();
    (!label.is_empty()).then_some(label)
}

fn direct_host(address: &str) -> String {
    match address.parse::<IpAddr>() {
        Ok(IpAddr::V6(v6)) => format!("[{v6}]"),
        _ => address.to_string(),
    }
}

/// Builds the ordered list of URLs to try for `record`.
pub fn dial_plan(record: &EndpointRecord) -> Vec<DialTarget> {
    let mut plan = Vec::with_capacity(2);
    if let Some(label) = dns_label(record.peer.as_str()) {
        plan.push(DialTarget {
            kind: DialKind::Named,
            url: format!("ws://{label}.local:{}{SOCKET_PATH}", record.port),
        });
    }
    plan.push(DialTarget {
        kind: DialKind::Direct,
        url: format!(
            "ws://{}:{}{SOCKET_PATH}",
            direct_host(&record.address),
            record.port
        ),
    });
    plan
}

// ── Tests ─────────────────────────────────────────────────────────────────────
