//! Access gate: decides whether a client address may reach the terminal
//! at all, and whether a session id may take the single terminal slot.
//!
//! Both checks are pure: the gate holds only its configured network ranges,
//! and [`may_claim`] looks at a snapshot of the session record handed to it.

use crate::session::registry::SessionRecord;
use cyberdeck_core::DeckError;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

/// Private and loopback ranges admitted when no allowlist is configured.
pub const DEFAULT_ALLOWED_NETWORKS: &[&str] = &[
    "192.168.0.0/16",
    "10.0.0.0/8",
    "172.16.0.0/12",
    "127.0.0.0/8",
];

/// An IP network in CIDR form (`10.0.0.0/8`, `fd00::/8`, or a bare address).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkRange {
    base: IpAddr,
    prefix: u8,
}

impl NetworkRange {
    /// Whether `ip` falls inside this range. Address families never mix.
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.base, ip.to_canonical()) {
            (IpAddr::V4(base), IpAddr::V4(ip)) => {
                let mask = prefix_mask_u32(self.prefix);
                u32::from(base) & mask == u32::from(ip) & mask
            }
            (IpAddr::V6(base), IpAddr::V6(ip)) => {
                let mask = prefix_mask_u128(self.prefix);
                u128::from(base) & mask == u128::from(ip) & mask
            }
            _ => false,
        }
    }
}

fn prefix_mask_u32(prefix: u8) -> u32 {
    match prefix {
        0 => 0,
        p => u32::MAX << (32 - u32::from(p)),
    }
}

fn prefix_mask_u128(prefix: u8) -> u128 {
    match prefix {
        0 => 0,
        p => u128::MAX << (128 - u32::from(p)),
    }
}

impl FromStr for NetworkRange {
    type Err = DeckError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |why: &str| DeckError::Config(format!("invalid network range {s:?}: {why}"));

        let (addr, prefix) = match s.trim().split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (s.trim(), None),
        };
        let base: IpAddr = addr.parse().map_err(|_| invalid("bad address"))?;
        let max = if base.is_ipv4() { 32 } else { 128 };
        let prefix = match prefix {
            Some(p) => p.parse::<u8>().map_err(|_| invalid("bad prefix length"))?,
            None => max,
        };
        if prefix > max {
            return Err(invalid("prefix length out of range"));
        }
        Ok(Self {
            base: base.to_canonical(),
            prefix,
        })
    }
}

impl fmt::Display for NetworkRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base, self.prefix)
    }
}

/// Result of running the gate in front of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessDecision {
    Allow(IpAddr),
    Deny { reason: String },
}

/// IP allowlist over a fixed set of network ranges.
#[derive(Debug, Clone)]
pub struct AccessGate {
    ranges: Vec<NetworkRange>,
}

impl Default for AccessGate {
    fn default() -> Self {
        let ranges = DEFAULT_ALLOWED_NETWORKS
            .iter()
            .filter_map(|s| s.parse().ok())
            .collect();
        Self { ranges }
    }
}

impl AccessGate {
    pub fn new(ranges: Vec<NetworkRange>) -> Self {
        Self { ranges }
    }

    /// Whether the textual address `ip` (bare or `ip:port`) is allowed.
    ///
    /// Anything that does not parse as an address is rejected.
    pub fn is_allowed(&self, ip: &str) -> bool {
        parse_client_ip(ip).is_some_and(|ip| self.is_allowed_addr(ip))
    }

    /// Whether an already-parsed address is allowed.
    pub fn is_allowed_addr(&self, ip: IpAddr) -> bool {
        self.ranges.iter().any(|range| range.contains(ip))
    }

    /// Run the gate as an interceptor in front of session logic.
    pub fn admit(&self, ip: &str) -> AccessDecision {
        match parse_client_ip(ip) {
            Some(addr) if self.is_allowed_addr(addr) => AccessDecision::Allow(addr.to_canonical()),
            Some(addr) => AccessDecision::Deny {
                reason: format!("IP {addr} not allowed"),
            },
            None => AccessDecision::Deny {
                reason: format!("malformed client address {ip:?}"),
            },
        }
    }
}

fn parse_client_ip(s: &str) -> Option<IpAddr> {
    let s = s.trim();
    s.parse::<IpAddr>()
        .ok()
        .or_else(|| s.parse::<SocketAddr>().ok().map(|sa| sa.ip()))
}

/// Whether `candidate_id` may take the session slot described by `current`.
///
/// True when the slot is empty, the holder's claim has expired, or the
/// candidate already is the holder.
pub fn may_claim(candidate_id: &str, current: Option<&SessionRecord>, now: u64) -> bool {
    match current {
        None => true,
        Some(record) => record.is_expired(now) || record.id == candidate_id,
    }
}
