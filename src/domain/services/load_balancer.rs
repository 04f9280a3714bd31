//! Load Balancer Service
//!
//! Backend selection for one forward rule. A `LoadBalancer` owns the current
//! resolved address list and a sticky store; each connection attempt chain
//! gets its own `LoadBalanceContext`.
//!
//! Every policy shares the same first step: on the first attempt of a
//! context, a sticky hit that is still part of the resolved list wins.
//! Only when that misses does the policy-specific pick run.

use crate::domain::entities::StickyConfig;
use crate::domain::ports::{StickyPublisher, StickyStore};
use crate::domain::value_objects::{compare_socket_addrs, BalancePolicy};
use arc_swap::ArcSwap;
use rand::seq::SliceRandom;
use rand::Rng;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Ring walk over a fixed-length list starting at a captured cursor.
///
/// Yields every index exactly once, then reports exhaustion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingCursor {
    start: usize,
    offset: usize,
    len: usize,
}

impl RingCursor {
    pub fn new(start: usize, len: usize) -> Self {
        let start = if len == 0 { 0 } else { start % len };
        Self {
            start,
            offset: 0,
            len,
        }
    }

    pub fn has_next(&self) -> bool {
        self.offset < self.len
    }

    pub fn next_index(&mut self) -> Option<usize> {
        if !self.has_next() {
            return None;
        }
        let idx = (self.start + self.offset) % self.len;
        self.offset += 1;
        Some(idx)
    }
}

/// State of one connection's attempt chain.
#[derive(Debug)]
pub struct LoadBalanceContext {
    sticky_addr: IpAddr,
    snapshot: Arc<Vec<SocketAddr>>,
    ring: Option<RingCursor>,
    remote: Option<SocketAddr>,
    attempts: usize,
    random_budget: usize,
}

impl LoadBalanceContext {
    /// Client address used as the sticky lookup key.
    pub fn sticky_addr(&self) -> IpAddr {
        self.sticky_addr
    }

    /// Backend chosen by the latest attempt.
    pub fn remote(&self) -> Option<SocketAddr> {
        self.remote
    }

    /// Number of backends handed out so far.
    pub fn attempts(&self) -> usize {
        self.attempts
    }

    /// Forget the current backend after a failed attempt.
    pub fn clear_remote(&mut self) {
        self.remote = None;
    }
}

/// Load balancer for one forward rule.
pub struct LoadBalancer {
    policy: BalancePolicy,
    failover: bool,
    stickies: Arc<dyn StickyStore>,
    publisher: Option<Arc<dyn StickyPublisher>>,
    addresses: ArcSwap<Vec<SocketAddr>>,
    cursor: AtomicUsize,
}

impl LoadBalancer {
    pub fn new(policy: BalancePolicy, failover: bool, stickies: Arc<dyn StickyStore>) -> Self {
        Self {
            policy,
            failover,
            stickies,
            publisher: None,
            addresses: ArcSwap::from_pointee(Vec::new()),
            cursor: AtomicUsize::new(0),
        }
    }

    /// Attach the sink that receives replicated sticky updates.
    pub fn with_publisher(mut self, publisher: Arc<dyn StickyPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn policy(&self) -> BalancePolicy {
        self.policy
    }

    pub fn sticky_config(&self) -> &StickyConfig {
        self.stickies.config()
    }

    pub fn stickies(&self) -> &Arc<dyn StickyStore> {
        &self.stickies
    }

    /// Current resolved address list.
    pub fn addresses(&self) -> Arc<Vec<SocketAddr>> {
        self.addresses.load_full()
    }

    /// Install a freshly resolved address list.
    ///
    /// The list is reordered off to the side and swapped in whole; contexts
    /// created earlier keep iterating their own snapshot.
    pub fn on_resolve(&self, mut list: Vec<SocketAddr>) {
        match self.policy {
            BalancePolicy::OrderedRoundRobin => list.sort_by(compare_socket_addrs),
            BalancePolicy::RandomRoundRobin => list.shuffle(&mut rand::thread_rng()),
            _ => {}
        }
        self.addresses.store(Arc::new(list));
    }

    /// Start an attempt chain for a client.
    pub fn create_context(&self, sticky_addr: IpAddr) -> LoadBalanceContext {
        let snapshot = self.addresses.load_full();
        let ring = if self.policy.is_ring() {
            let start = self.cursor.fetch_add(1, Ordering::Relaxed);
            Some(RingCursor::new(start, snapshot.len()))
        } else {
            None
        };
        LoadBalanceContext {
            sticky_addr,
            random_budget: snapshot.len(),
            snapshot,
            ring,
            remote: None,
            attempts: 0,
        }
    }

    /// Next backend to try, or `None` when nothing is left.
    pub fn next_backend(&self, ctx: &mut LoadBalanceContext) -> Option<SocketAddr> {
        ctx.attempts += 1;

        // NONE always takes the first address; stickiness is recorded but never read.
        if ctx.attempts == 1 && self.policy != BalancePolicy::None {
            if let Some(addr) = self.find_sticky(ctx) {
                tracing::debug!("sticky hit client={} backend={}", ctx.sticky_addr, addr);
                ctx.remote = Some(addr);
                return ctx.remote;
            }
        }

        let picked = match self.policy {
            BalancePolicy::None => ctx.snapshot.first().copied(),
            BalancePolicy::Random => {
                if ctx.snapshot.is_empty() {
                    None
                } else {
                    ctx.random_budget = ctx.random_budget.saturating_sub(1);
                    let idx = rand::thread_rng().gen_range(0..ctx.snapshot.len());
                    Some(ctx.snapshot[idx])
                }
            }
            BalancePolicy::RoundRobin
            | BalancePolicy::OrderedRoundRobin
            | BalancePolicy::RandomRoundRobin => ctx
                .ring
                .as_mut()
                .and_then(RingCursor::next_index)
                .map(|i| ctx.snapshot[i]),
        };

        ctx.remote = picked;
        picked
    }

    /// Whether a failed attempt may be followed by another one.
    pub fn can_retry(&self, ctx: &LoadBalanceContext) -> bool {
        match self.policy {
            BalancePolicy::None => false,
            BalancePolicy::Random => self.failover && ctx.random_budget > 0,
            BalancePolicy::RoundRobin
            | BalancePolicy::OrderedRoundRobin
            | BalancePolicy::RandomRoundRobin => {
                self.failover && ctx.ring.as_ref().map_or(false, RingCursor::has_next)
            }
        }
    }

    /// Record a successful connect: remember and replicate the assignment.
    pub fn on_connect_success(&self, ctx: &LoadBalanceContext) {
        if let Some(backend) = ctx.remote {
            self.publish(ctx.sticky_addr, Some(backend));
            self.stickies.put(ctx.sticky_addr, backend);
        }
    }

    /// Record a failed connect: withdraw the assignment locally and in the cluster.
    pub fn on_connect_failure(&self, ctx: &mut LoadBalanceContext) {
        ctx.clear_remote();
        self.publish(ctx.sticky_addr, None);
        self.stickies.clear(ctx.sticky_addr);
    }

    fn publish(&self, client: IpAddr, backend: Option<SocketAddr>) {
        let config = self.stickies.config();
        if !config.is_replicated() {
            return;
        }
        if let Some(publisher) = &self.publisher {
            publisher.publish(config.key, client, backend);
        }
    }

    fn find_sticky(&self, ctx: &LoadBalanceContext) -> Option<SocketAddr> {
        let addr = self.stickies.get(ctx.sticky_addr)?;
        ctx.snapshot.contains(&addr).then_some(addr)
    }
}
