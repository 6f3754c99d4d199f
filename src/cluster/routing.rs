//! Sticky routing key
//!
//! A client's key is the sum of the four octets of its IPv4 address. `::1` and
//! IPv4-mapped IPv6 addresses are folded onto their IPv4 form first; anything
//! that still is not a four-octet address is routed as `127.0.0.1`.
//!
//! The worker is picked by `key % ready_count`. This is plain modulo hashing:
//! when the number of ready workers changes, most clients move.

use std::net::{IpAddr, Ipv4Addr};

/// Address used for clients whose address has no IPv4 form
pub const FALLBACK_ADDR: Ipv4Addr = Ipv4Addr::LOCALHOST;

const MAPPED_PREFIX: &str = "::ffff:";

/// Routing key derived from a client address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoutingKey(u32);

impl RoutingKey {
    /// Derive the key from a socket peer address
    pub fn from_ip(ip: IpAddr) -> Self {
        Self::from_v4(normalize(ip))
    }

    /// Derive the key from a textual address
    pub fn from_addr_str(addr: &str) -> Self {
        Self::from_v4(normalize_str(addr))
    }

    fn from_v4(addr: Ipv4Addr) -> Self {
        Self(addr.octets().iter().map(|o| u32::from(*o)).sum())
    }

    /// Raw key value
    pub fn value(&self) -> u32 {
        self.0
    }

    /// Index into a ready set of `len` workers; `None` when the set is empty
    pub fn select_index(&self, len: usize) -> Option<usize> {
        if len == 0 {
            return None;
        }
        Some(self.0 as usize % len)
    }
}

/// Fold an address onto the IPv4 address used for hashing
pub fn normalize(ip: IpAddr) -> Ipv4Addr {
    match ip {
        IpAddr::V4(v4) => v4,
        IpAddr::V6(v6) if v6.is_loopback() => Ipv4Addr::LOCALHOST,
        IpAddr::V6(v6) => v6.to_ipv4_mapped().unwrap_or(FALLBACK_ADDR),
    }
}

/// Textual counterpart of [`normalize`]
pub fn normalize_str(addr: &str) -> Ipv4Addr {
    let addr = addr.trim();
    if addr == "::1" {
        return Ipv4Addr::LOCALHOST;
    }

    let addr = addr.strip_prefix(MAPPED_PREFIX).unwrap_or(addr);

    let octets: Vec<u8> = addr
        .split('.')
        .map_while(|part| {
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            part.parse::<u8>().ok()
        })
        .collect();

    match (octets.as_slice(), addr.split('.').count()) {
        ([a, b, c, d], 4) => Ipv4Addr::new(*a, *b, *c, *d),
        _ => FALLBACK_ADDR,
    }
}
