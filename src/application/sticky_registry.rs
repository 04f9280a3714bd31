//! Sticky Store Registry
//!
//! Process-wide table of sticky stores keyed by `StickyKey`. Forward rules
//! that name the same key share one store; the cluster server dumps every
//! store of its cluster and the cluster client applies updates to them.
//!
//! Lifetime follows configuration generations: `release_all` before a
//! reload, `get_or_create` for every rule of the new configuration, then
//! `unregister_released` drops stores nothing re-acquired.

use crate::adapters::outbound::{MemoryStickyStore, NullStickyStore};
use crate::domain::entities::{StickyConfig, StickyKey, StickyKind};
use crate::domain::ports::StickyStore;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

struct Registered {
    store: Arc<dyn StickyStore>,
    holders: usize,
}

/// Reference-counted sticky store factory.
#[derive(Default)]
pub struct StickyRegistry {
    stores: Mutex<HashMap<StickyKey, Registered>>,
}

impl StickyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the store for `config.key`, creating it if needed, and retain it.
    ///
    /// An existing store keeps the configuration it was created with.
    pub fn get_or_create(&self, config: &StickyConfig) -> Arc<dyn StickyStore> {
        let mut stores = self.stores.lock();
        let entry = stores.entry(config.key).or_insert_with(|| {
            tracing::info!(
                "new sticky store kind={:?} key={} bits={} elements={} ttl={}s",
                config.kind,
                config.key,
                config.mask_bits,
                config.elements,
                config.ttl_secs
            );
            let store: Arc<dyn StickyStore> = match config.kind {
                StickyKind::Memory => Arc::new(MemoryStickyStore::new(config.clone())),
                StickyKind::Disabled => Arc::new(NullStickyStore::new(config.clone())),
            };
            Registered { store, holders: 0 }
        });
        entry.holders += 1;
        entry.store.clone()
    }

    /// Registered store for `key`, if any.
    pub fn get(&self, key: &StickyKey) -> Option<Arc<dyn StickyStore>> {
        self.stores.lock().get(key).map(|r| r.store.clone())
    }

    /// Every store whose key belongs to `cluster_id`.
    pub fn stores_for_cluster(&self, cluster_id: u64) -> Vec<Arc<dyn StickyStore>> {
        self.stores
            .lock()
            .iter()
            .filter(|(key, _)| key.cluster_id == cluster_id)
            .map(|(_, r)| r.store.clone())
            .collect()
    }

    /// Drop one hold on `key`.
    pub fn release(&self, key: &StickyKey) {
        if let Some(r) = self.stores.lock().get_mut(key) {
            r.holders = r.holders.saturating_sub(1);
        }
    }

    /// Drop every hold, starting a new configuration generation.
    pub fn release_all(&self) {
        for r in self.stores.lock().values_mut() {
            r.holders = 0;
        }
    }

    /// Remove stores that nobody holds. Returns how many were removed.
    pub fn unregister_released(&self) -> usize {
        let mut stores = self.stores.lock();
        let before = stores.len();
        stores.retain(|key, r| {
            if r.holders == 0 {
                tracing::info!("unregistering sticky store key={}", key);
                false
            } else {
                true
            }
        });
        before - stores.len()
    }

    /// Number of registered stores.
    pub fn len(&self) -> usize {
        self.stores.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
