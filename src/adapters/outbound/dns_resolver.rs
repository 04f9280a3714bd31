//! DNS Address Resolver
//!
//! Implements AddressResolver with the system resolver and a short-lived
//! per-host cache. Failed lookups are cached too, so a dead name is not
//! queried on every resolver pass.

use crate::domain::ports::AddressResolver;
use async_trait::async_trait;
use dashmap::DashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

/// How long a lookup result, positive or negative, is reused.
pub const DNS_CACHE_TTL: Duration = Duration::from_secs(3);

#[derive(Debug, Clone)]
struct CacheEntry {
    addrs: Vec<IpAddr>,
    expires: Instant,
}

impl CacheEntry {
    fn is_stale(&self, now: Instant) -> bool {
        now > self.expires
    }
}

/// Cached system resolver.
pub struct DnsResolver {
    cache: DashMap<String, CacheEntry>,
    ttl: Duration,
}

impl DnsResolver {
    pub fn new() -> Self {
        Self::with_ttl(DNS_CACHE_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            cache: DashMap::new(),
            ttl,
        }
    }

    async fn lookup(host: &str) -> Vec<IpAddr> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return vec![ip];
        }
        match tokio::net::lookup_host((host, 0)).await {
            Ok(iter) => {
                let mut addrs: Vec<IpAddr> = Vec::new();
                for sa in iter {
                    if !addrs.contains(&sa.ip()) {
                        addrs.push(sa.ip());
                    }
                }
                addrs
            }
            Err(e) => {
                tracing::error!("unknown host {}: {}", host, e);
                Vec::new()
            }
        }
    }

    async fn host_addrs(&self, host: &str) -> Vec<IpAddr> {
        let now = Instant::now();
        if let Some(entry) = self.cache.get(host) {
            if !entry.is_stale(now) {
                return entry.addrs.clone();
            }
        }

        let addrs = Self::lookup(host).await;
        self.cache.insert(
            host.to_string(),
            CacheEntry {
                addrs: addrs.clone(),
                expires: Instant::now() + self.ttl,
            },
        );
        addrs
    }
}

impl Default for DnsResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AddressResolver for DnsResolver {
    async fn resolve(&self, host: &str, port: u16) -> Vec<SocketAddr> {
        self.host_addrs(host)
            .await
            .into_iter()
            .map(|ip| SocketAddr::new(ip, port))
            .collect()
    }
}
