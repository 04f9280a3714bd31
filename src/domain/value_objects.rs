//! Value Objects
//!
//! Immutable values describing how a forward rule balances and what it
//! remembers about clients.

use crate::domain::entities::{StickyConfig, StickyKey};
use std::cmp::Ordering;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

/// Backend selection policy of a forward rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BalancePolicy {
    /// Always the first resolved address.
    #[default]
    None,
    /// Uniformly random pick per attempt.
    Random,
    /// Ring walk from a per-connection cursor.
    RoundRobin,
    /// Ring walk over a canonically sorted address list.
    OrderedRoundRobin,
    /// Ring walk over a list shuffled on every resolution.
    RandomRoundRobin,
}

impl BalancePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            BalancePolicy::None => "NONE",
            BalancePolicy::Random => "RAND",
            BalancePolicy::RoundRobin => "RR",
            BalancePolicy::OrderedRoundRobin => "ORDER",
            BalancePolicy::RandomRoundRobin => "RANDRR",
        }
    }

    /// Whether the policy walks the address list as a ring.
    pub fn is_ring(&self) -> bool {
        matches!(
            self,
            BalancePolicy::RoundRobin
                | BalancePolicy::OrderedRoundRobin
                | BalancePolicy::RandomRoundRobin
        )
    }
}

impl FromStr for BalancePolicy {
    type Err = OptionsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "NONE" => Ok(BalancePolicy::None),
            "RAND" => Ok(BalancePolicy::Random),
            "RR" => Ok(BalancePolicy::RoundRobin),
            "ORDER" => Ok(BalancePolicy::OrderedRoundRobin),
            "RANDRR" => Ok(BalancePolicy::RandomRoundRobin),
            other => Err(OptionsError::UnknownPolicy(other.to_string())),
        }
    }
}

/// Errors produced while parsing forward options.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OptionsError {
    #[error("unknown load balance policy: {0}")]
    UnknownPolicy(String),
    #[error("unknown option: {0}")]
    UnknownOption(String),
    #[error("invalid sticky spec '{0}': expected MEM:<bits>:<elements>:<ttl>:<name>[:<cluster>]")]
    InvalidSticky(String),
}

/// Per-forward options: `LB=..`, `FAILOVER`, `PROXY=SEND`, `STICKY=..`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ForwardOptions {
    pub policy: BalancePolicy,
    pub failover: bool,
    pub proxy_send: bool,
    pub sticky: StickyConfig,
}

impl ForwardOptions {
    /// Parse a comma separated option list. Empty input yields defaults.
    pub fn parse(input: &str) -> Result<Self, OptionsError> {
        let mut opts = ForwardOptions::default();

        for token in input.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            let (name, value) = match token.split_once('=') {
                Some((n, v)) => (n.to_ascii_uppercase(), Some(v)),
                None => (token.to_ascii_uppercase(), None),
            };

            match (name.as_str(), value) {
                ("LB", Some(v)) => opts.policy = v.parse()?,
                ("FAILOVER", None) => opts.failover = true,
                ("PROXY", Some(v)) if v.eq_ignore_ascii_case("SEND") => opts.proxy_send = true,
                ("STICKY", Some(v)) => opts.sticky = parse_sticky(v)?,
                _ => return Err(OptionsError::UnknownOption(token.to_string())),
            }
        }

        Ok(opts)
    }
}

/// `MEM:<bits>:<elements>:<ttl>:<sticky-name>[:<cluster-name>]`, or `NULL`.
fn parse_sticky(spec: &str) -> Result<StickyConfig, OptionsError> {
    let invalid = || OptionsError::InvalidSticky(spec.to_string());
    let toks: Vec<&str> = spec.split(':').collect();

    match toks.first().map(|t| t.to_ascii_uppercase()) {
        Some(kind) if kind == "NULL" => return Ok(StickyConfig::disabled()),
        Some(kind) if kind == "MEM" => {}
        _ => return Err(invalid()),
    }
    if toks.len() < 5 || toks.len() > 6 {
        return Err(invalid());
    }

    let mask_bits: u8 = toks[1].parse().map_err(|_| invalid())?;
    let elements: usize = toks[2].parse().map_err(|_| invalid())?;
    let ttl_secs: u64 = toks[3].parse().map_err(|_| invalid())?;
    let sticky_name = toks[4];
    if sticky_name.is_empty() {
        return Err(invalid());
    }
    let cluster_name = toks.get(5).copied().filter(|c| !c.is_empty());

    Ok(StickyConfig::memory(
        mask_bits,
        elements,
        ttl_secs,
        StickyKey::from_names(cluster_name, sticky_name),
    ))
}

/// Zero every bit of `addr` beyond the first `bits`, on the raw address bytes.
///
/// The same width applies to IPv4 (4 bytes) and IPv6 (16 bytes); widths past
/// the address length leave it unchanged.
pub fn mask_addr(addr: IpAddr, bits: u8) -> IpAddr {
    match addr {
        IpAddr::V4(v4) => {
            let mut octets = v4.octets();
            mask_bytes(&mut octets, bits);
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        IpAddr::V6(v6) => {
            let mut octets = v6.octets();
            mask_bytes(&mut octets, bits);
            IpAddr::V6(Ipv6Addr::from(octets))
        }
    }
}

fn mask_bytes(bytes: &mut [u8], bits: u8) {
    let bits = bits as usize;
    for (i, b) in bytes.iter_mut().enumerate() {
        let start = i * 8;
        if bits >= start + 8 {
            continue;
        }
        if bits <= start {
            *b = 0;
        } else {
            let keep = bits - start;
            *b &= 0xFFu8 << (8 - keep);
        }
    }
}

/// Raw address bytes, 4 for IPv4 and 16 for IPv6.
pub fn addr_bytes(addr: &IpAddr) -> Vec<u8> {
    match addr {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    }
}

/// Canonical ordering of backend addresses.
///
/// Unsigned byte-wise comparison of the raw address, shorter address first
/// when one is a prefix of the other, then ascending port.
pub fn compare_socket_addrs(a: &SocketAddr, b: &SocketAddr) -> Ordering {
    let ab = addr_bytes(&a.ip());
    let bb = addr_bytes(&b.ip());
    ab.iter()
        .zip(bb.iter())
        .map(|(x, y)| x.cmp(y))
        .find(|o| *o != Ordering::Equal)
        .unwrap_or_else(|| ab.len().cmp(&bb.len()))
        .then_with(|| a.port().cmp(&b.port()))
}
