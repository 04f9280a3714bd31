//! Endpoint
//!
//! The backend side of a forward rule: configured `host:port` specs, the
//! load balancer holding the resolved address snapshot, and the flags that
//! decide when the background resolver refreshes it.

use crate::domain::ports::AddressResolver;
use crate::domain::services::{LoadBalanceContext, LoadBalancer};
use parking_lot::Mutex;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;

/// A resolved list is considered stale after this long, even if unused.
pub const ADDRESS_EXPIRY: Duration = Duration::from_secs(300);

/// Pause between background resolver passes.
pub const RESOLVE_INTERVAL: Duration = Duration::from_secs(3);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("invalid backend address: {0}")]
    InvalidAddress(String),

    #[error("no address resolved for {0}")]
    Unresolved(String),
}

/// One configured backend `host:port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPort {
    pub host: String,
    pub port: u16,
}

impl FromStr for HostPort {
    type Err = ResolveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ResolveError::InvalidAddress(s.to_string());
        let (host, port) = s.trim().rsplit_once(':').ok_or_else(invalid)?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(invalid());
        }
        let port = port.parse::<u16>().map_err(|_| invalid())?;
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Parse a comma-separated backend list.
pub fn parse_host_ports(list: &str) -> Result<Vec<HostPort>, ResolveError> {
    list.split(',')
        .filter(|s| !s.trim().is_empty())
        .map(str::parse)
        .collect()
}

struct RefreshState {
    used: bool,
    expires: Instant,
}

/// Backend endpoint of a forward rule.
pub struct Endpoint {
    specs: Vec<HostPort>,
    balancer: LoadBalancer,
    resolver: Arc<dyn AddressResolver>,
    state: Mutex<RefreshState>,
}

impl Endpoint {
    pub fn new(
        specs: Vec<HostPort>,
        balancer: LoadBalancer,
        resolver: Arc<dyn AddressResolver>,
    ) -> Self {
        Self {
            specs,
            balancer,
            resolver,
            state: Mutex::new(RefreshState {
                used: false,
                expires: Instant::now(),
            }),
        }
    }

    pub fn specs(&self) -> &[HostPort] {
        &self.specs
    }

    pub fn balancer(&self) -> &LoadBalancer {
        &self.balancer
    }

    /// Resolve every spec and install the combined list.
    ///
    /// When nothing resolves, the previous list stays in place.
    pub async fn resolve(&self) -> Result<usize, ResolveError> {
        let mut addrs: Vec<SocketAddr> = Vec::new();
        for spec in &self.specs {
            addrs.extend(self.resolver.resolve(&spec.host, spec.port).await);
        }
        if addrs.is_empty() {
            return Err(ResolveError::Unresolved(self.describe()));
        }

        let count = addrs.len();
        tracing::info!("resolved endpoint={} as {:?}", self.describe(), addrs);
        {
            let mut state = self.state.lock();
            state.used = false;
            state.expires = Instant::now() + ADDRESS_EXPIRY;
        }
        self.balancer.on_resolve(addrs);
        Ok(count)
    }

    pub fn is_used(&self) -> bool {
        self.state.lock().used
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() > self.state.lock().expires
    }

    /// Whether the background resolver should refresh this endpoint.
    pub fn needs_refresh(&self) -> bool {
        self.is_used() || self.is_expired()
    }

    pub fn create_context(&self, sticky_addr: IpAddr) -> LoadBalanceContext {
        self.balancer.create_context(sticky_addr)
    }

    /// Next backend to try. Marks the endpoint as used.
    pub fn next_backend(&self, ctx: &mut LoadBalanceContext) -> Option<SocketAddr> {
        self.state.lock().used = true;
        self.balancer.next_backend(ctx)
    }

    pub fn can_retry(&self, ctx: &LoadBalanceContext) -> bool {
        self.balancer.can_retry(ctx)
    }

    pub fn on_connect_success(&self, ctx: &LoadBalanceContext) {
        self.balancer.on_connect_success(ctx);
    }

    pub fn on_connect_failure(&self, ctx: &mut LoadBalanceContext) {
        self.balancer.on_connect_failure(ctx);
    }

    fn describe(&self) -> String {
        let parts: Vec<String> = self.specs.iter().map(ToString::to_string).collect();
        parts.join(",")
    }
}

/// Periodically re-resolve endpoints that were used or have expired.
///
/// Runs until `shutdown` flips to true.
pub async fn run_resolver(
    endpoints: Vec<Arc<Endpoint>>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = shutdown.changed() => if changed.is_err() {
                return;
            },
        }
        if *shutdown.borrow() {
            tracing::debug!("resolver stopped");
            return;
        }

        for endpoint in &endpoints {
            if !endpoint.needs_refresh() {
                continue;
            }
            if let Err(e) = endpoint.resolve().await {
                tracing::warn!("{}", e);
            }
        }
    }
}
