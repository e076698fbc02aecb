//! Local-network address policy.
//!
//! The client only ever talks to a desktop on the same LAN.  Before any
//! transport is opened the target address is checked against the private
//! address classes below; anything else is refused unless the user turned on
//! "expanded networking" (VPN overlays, routed lab networks, and so on).
//!
//! | Family | Allowed ranges                                          |
//! |--------|---------------------------------------------------------|
//! | IPv4   | `10.0.0.0/8`, `172.16.0.0/12`, `192.168.0.0/16`, `169.254.0.0/16` |
//! | IPv6   | `fc00::/7` (unique local), `fe80::/10` (link local)      |
//!
//! Loopback is not on the list: the peer is another machine.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use thiserror::Error;

/// Why an address was refused.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    /// The address is not an IP literal (and expanded networking is off).
    #[error("'{0}' is not an IP address")]
    NotAnIpAddress(String),
    /// The address is a valid IP outside the private ranges.
    #[error("{0} is outside the permitted local-network ranges")]
    NotLocal(IpAddr),
}

/// Decides whether an address may be dialled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AddressPolicy {
    /// When `true`, every address is accepted.
    pub expanded_networking: bool,
}

impl AddressPolicy {
    pub fn new(expanded_networking: bool) -> Self {
        Self { expanded_networking }
    }

    /// Checks `address` against the policy.  Fails closed.
    ///
    /// # Errors
    ///
    /// Returns [`AddressError::NotAnIpAddress`] for non-literal hosts and
    /// [`AddressError::NotLocal`] for public addresses, both only when
    /// expanded networking is off.
    pub fn check(&self, address: &str) -> Result<(), AddressError> {
        if self.expanded_networking {
            return Ok(());
        }
        let ip: IpAddr = address
            .trim()
            .parse()
            .map_err(|_| AddressError::NotAnIpAddress(address.to_string()))?;
        if is_local_address(ip) {
            Ok(())
        } else {
            Err(AddressError::NotLocal(ip))
        }
    }
}

/// Returns `true` for private and link-local addresses.
pub fn is_local_address(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_private_ipv4(v4) || v4.is_link_local(),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => is_private_ipv4(v4) || v4.is_link_local(),
            None => is_unique_local_ipv6(v6) || is_unicast_link_local_ipv6(v6),
        },
    }
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

fn is_unique_local_ipv6(ip: Ipv6Addr) -> bool {
    (ip.segments()[0] & 0xfe00) == 0xfc00
}

fn is_unicast_link_local_ipv6(ip: Ipv6Addr) -> bool {
    (ip.segments()[0] & 0xffc0) == 0xfe80
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_private_ipv4_ranges_are_allowed() {
        // Arrange
        let policy = AddressPolicy::default();

        // Act / Assert
        for addr in ["10.1.2.3", "172.16.0.1", "172.31.255.254", "192.168.0.5", "169.254.10.1"] {
            assert_eq!(policy.check(addr), Ok(()), "{addr} must be allowed");
        }
    }

    #[test]
    fn test_public_ipv4_is_refused() {
        let policy = AddressPolicy::default();
        let result = policy.check("8.8.8.8");
        assert!(matches!(result, Err(AddressError::NotLocal(_))));
    }

    #[test]
    fn test_172_outside_private_block_is_refused() {
        let policy = AddressPolicy::default();
        assert!(policy.check("172.32.0.1").is_err());
        assert!(policy.check("172.15.0.1").is_err());
    }

    #[test]
    fn test_loopback_is_refused() {
        let policy = AddressPolicy::default();
        assert!(policy.check("127.0.0.1").is_err());
        assert!(policy.check("::1").is_err());
    }

    #[test]
    fn test_hostname_is_refused_without_expanded_networking() {
        let policy = AddressPolicy::default();
        assert_eq!(
            policy.check("desktop.example.com"),
            Err(AddressError::NotAnIpAddress("desktop.example.com".to_string()))
        );
    }

    #[test]
    fn test_ipv6_unique_local_and_link_local_are_allowed() {
        let policy = AddressPolicy::default();
        assert_eq!(policy.check("fd12:3456::1"), Ok(()));
        assert_eq!(policy.check("fe80::1c2b:3aff:fe4d:5e6f"), Ok(()));
        assert!(policy.check("2001:db8::1").is_err());
    }

    #[test]
    fn test_ipv4_mapped_private_address_is_allowed() {
        let policy = AddressPolicy::default();
        assert_eq!(policy.check("::ffff:192.168.1.4"), Ok(()));
    }

    #[test]
    fn test_expanded_networking_accepts_anything() {
        // Arrange
        let policy = AddressPolicy::new(true);

        // Assert
        assert_eq!(policy.check("8.8.8.8"), Ok(()));
        assert_eq!(policy.check("desktop.example.com"), Ok(()));
    }
}
