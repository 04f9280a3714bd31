//! Domain Entities
//!
//! Core business objects for sticky-session routing and replication.

use md5::{Digest, Md5};
use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// Identifies one sticky store across the cluster.
///
/// Both halves are derived from human-readable names so that two relays
/// configured with the same cluster and sticky names agree on the key
/// without exchanging anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StickyKey {
    pub cluster_id: u64,
    pub sticky_id: u64,
}

impl StickyKey {
    /// Key used by configurations without stickiness.
    pub const DEFAULT: StickyKey = StickyKey {
        cluster_id: 0,
        sticky_id: 0,
    };

    pub fn new(cluster_id: u64, sticky_id: u64) -> Self {
        Self {
            cluster_id,
            sticky_id,
        }
    }

    /// Build a key from names. A missing cluster name yields cluster id 0,
    /// which disables replication for the store.
    pub fn from_names(cluster_name: Option<&str>, sticky_name: &str) -> Self {
        let cluster_id = cluster_name.map(id_from_name).unwrap_or(0);
        let sticky_id = id_from_name(sticky_name);
        if let Some(name) = cluster_name {
            tracing::info!("mapped cluster name={} id={}", name, cluster_id);
        }
        tracing::info!("mapped sticky name={} id={}", sticky_name, sticky_id);
        Self::new(cluster_id, sticky_id)
    }
}

impl fmt::Display for StickyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cluster={} sticky={}", self.cluster_id, self.sticky_id)
    }
}

/// Map a name to a positive 63-bit id.
///
/// MD5 of the UTF-8 bytes, the two big-endian halves XOR-folded, sign bit
/// cleared. Peers built independently must produce the same value.
pub fn id_from_name(name: &str) -> u64 {
    let digest = Md5::digest(name.as_bytes());
    let mut hi = [0u8; 8];
    let mut lo = [0u8; 8];
    hi.copy_from_slice(&digest[0..8]);
    lo.copy_from_slice(&digest[8..16]);
    (u64::from_be_bytes(hi) ^ u64::from_be_bytes(lo)) & (i64::MAX as u64)
}

/// Kind of sticky store backing a forward rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StickyKind {
    /// No stickiness: every lookup misses, every write is dropped.
    Disabled,
    /// In-process LRU cache with TTL.
    Memory,
}

/// Sticky store configuration. Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StickyConfig {
    pub kind: StickyKind,
    /// Prefix width, in bits, kept from the client address.
    pub mask_bits: u8,
    /// Maximum number of entries kept.
    pub elements: usize,
    /// Seconds an entry stays valid after its last write.
    pub ttl_secs: u64,
    pub key: StickyKey,
}

impl StickyConfig {
    pub fn disabled() -> Self {
        Self {
            kind: StickyKind::Disabled,
            mask_bits: 0,
            elements: 0,
            ttl_secs: 0,
            key: StickyKey::DEFAULT,
        }
    }

    pub fn memory(mask_bits: u8, elements: usize, ttl_secs: u64, key: StickyKey) -> Self {
        Self {
            kind: StickyKind::Memory,
            mask_bits,
            elements,
            ttl_secs,
            key,
        }
    }

    /// Whether updates to this store travel over the cluster channel.
    pub fn is_replicated(&self) -> bool {
        self.key.cluster_id > 0 && self.key.sticky_id > 0
    }
}

impl Default for StickyConfig {
    fn default() -> Self {
        Self::disabled()
    }
}

/// A single (masked client, backend) association read out of a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StickyEntry {
    pub client: IpAddr,
    pub backend: SocketAddr,
}

/// Replication unit exchanged between cluster members.
///
/// `backend == None` withdraws any current assignment for `client`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StickyMessage {
    pub sticky_id: u64,
    pub client: IpAddr,
    pub backend: Option<SocketAddr>,
}

impl StickyMessage {
    pub fn new(sticky_id: u64, client: IpAddr, backend: Option<SocketAddr>) -> Self {
        Self {
            sticky_id,
            client,
            backend,
        }
    }

    /// Whether this message removes an association instead of setting one.
    pub fn is_disassociation(&self) -> bool {
        self.backend.is_none()
    }
}
