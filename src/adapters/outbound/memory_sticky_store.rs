//! Memory Sticky Store
//!
//! Implements StickyStore with an access-ordered LRU cache. Entries expire
//! lazily: an entry older than the TTL reads as a miss but stays in the
//! cache until it is overwritten or evicted by capacity.

use crate::domain::entities::{StickyConfig, StickyEntry};
use crate::domain::ports::StickyStore;
use crate::domain::value_objects::mask_addr;
use lru::LruCache;
use parking_lot::Mutex;
use std::net::{IpAddr, SocketAddr};
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

/// LRU + TTL sticky store.
///
/// A store configured with zero elements keeps nothing.
pub struct MemoryStickyStore {
    config: StickyConfig,
    ttl: Duration,
    entries: Mutex<Option<LruCache<IpAddr, (SocketAddr, Instant)>>>,
}

impl MemoryStickyStore {
    pub fn new(config: StickyConfig) -> Self {
        let cache = NonZeroUsize::new(config.elements).map(LruCache::new);
        Self {
            ttl: Duration::from_secs(config.ttl_secs),
            config,
            entries: Mutex::new(cache),
        }
    }

    fn mask(&self, client: IpAddr) -> IpAddr {
        mask_addr(client, self.config.mask_bits)
    }

    fn put_at(&self, client: IpAddr, backend: SocketAddr, now: Instant) {
        let key = self.mask(client);
        if let Some(cache) = self.entries.lock().as_mut() {
            cache.put(key, (backend, now));
        }
    }

    fn get_at(&self, client: IpAddr, now: Instant) -> Option<SocketAddr> {
        let key = self.mask(client);
        let mut guard = self.entries.lock();
        let (backend, stamp) = *guard.as_mut()?.get(&key)?;
        (now.saturating_duration_since(stamp) <= self.ttl).then_some(backend)
    }
}

impl StickyStore for MemoryStickyStore {
    fn config(&self) -> &StickyConfig {
        &self.config
    }

    fn put(&self, client: IpAddr, backend: SocketAddr) {
        self.put_at(client, backend, Instant::now());
    }

    fn clear(&self, client: IpAddr) {
        let key = self.mask(client);
        if let Some(cache) = self.entries.lock().as_mut() {
            cache.pop(&key);
        }
    }

    fn get(&self, client: IpAddr) -> Option<SocketAddr> {
        self.get_at(client, Instant::now())
    }

    fn entries(&self) -> Vec<StickyEntry> {
        let guard = self.entries.lock();
        match guard.as_ref() {
            // Oldest first, the order they were touched in.
            Some(cache) => cache
                .iter()
                .rev()
                .map(|(client, (backend, _))| StickyEntry {
                    client: *client,
                    backend: *backend,
                })
                .collect(),
            None => Vec::new(),
        }
    }

    fn len(&self) -> usize {
        self.entries.lock().as_ref().map_or(0, LruCache::len)
    }
}

/// Store used when stickiness is disabled. Every call is a no-op.
pub struct NullStickyStore {
    config: StickyConfig,
}

impl NullStickyStore {
    pub fn new(config: StickyConfig) -> Self {
        Self { config }
    }
}

impl StickyStore for NullStickyStore {
    fn config(&self) -> &StickyConfig {
        &self.config
    }

    fn put(&self, _client: IpAddr, _backend: SocketAddr) {}

    fn clear(&self, _client: IpAddr) {}

    fn get(&self, _client: IpAddr) -> Option<SocketAddr> {
        None
    }

    fn entries(&self) -> Vec<StickyEntry> {
        Vec::new()
    }

    fn len(&self) -> usize {
        0
    }
}
