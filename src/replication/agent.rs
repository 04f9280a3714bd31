//! Replication Agent
//!
//! Ties the cluster channels to the sticky stores: local decisions go out
//! through the cluster server named by the store's key, updates received by
//! cluster clients land in the matching local store.

use super::client::ClusterClient;
use super::config::{ClusterRole, ClusterRule};
use super::server::ClusterServer;
use crate::application::StickyRegistry;
use crate::domain::entities::{StickyKey, StickyMessage};
use crate::domain::ports::StickyPublisher;
use crate::infrastructure::ShutdownController;
use anyhow::Context;
use dashmap::DashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Replication agent shared by every forward and cluster channel.
pub struct ReplicationAgent {
    registry: Arc<StickyRegistry>,
    servers: DashMap<u64, Arc<ClusterServer>>,
}

impl ReplicationAgent {
    pub fn new(registry: Arc<StickyRegistry>) -> Self {
        Self {
            registry,
            servers: DashMap::new(),
        }
    }

    pub fn registry(&self) -> &Arc<StickyRegistry> {
        &self.registry
    }

    /// Make `server` the outlet for its cluster id.
    ///
    /// Returns false and keeps the existing one if the id is already served.
    pub fn register_server(&self, server: Arc<ClusterServer>) -> bool {
        let cluster_id = server.cluster_id();
        match self.servers.entry(cluster_id) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                tracing::warn!("cluster={} already has a server, ignoring", cluster_id);
                false
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(server);
                true
            }
        }
    }

    pub fn server(&self, cluster_id: u64) -> Option<Arc<ClusterServer>> {
        self.servers.get(&cluster_id).map(|s| s.value().clone())
    }

    /// Apply an update received on cluster `cluster_id`.
    ///
    /// Returns false when no local store matches the update's key.
    pub fn apply_remote(&self, cluster_id: u64, msg: &StickyMessage) -> bool {
        let key = StickyKey::new(cluster_id, msg.sticky_id);
        let Some(store) = self.registry.get(&key) else {
            tracing::debug!("no sticky store for {}, update dropped", key);
            return false;
        };
        match msg.backend {
            Some(backend) => store.put(msg.client, backend),
            None => store.clear(msg.client),
        }
        true
    }

    /// Bind every server rule and spawn every channel task.
    ///
    /// Bind failures abort startup; client connect failures are retried by
    /// the client itself.
    pub async fn start(
        self: &Arc<Self>,
        rules: &[ClusterRule],
        shutdown: &ShutdownController,
    ) -> anyhow::Result<Vec<JoinHandle<()>>> {
        let mut tasks = Vec::with_capacity(rules.len());

        for rule in rules.iter().filter(|r| r.role == ClusterRole::Server) {
            let server = ClusterServer::bind(rule.cluster_id, &rule.address, self.registry.clone())
                .await
                .with_context(|| format!("failed to bind cluster server `{}`", rule))?;
            let server = Arc::new(server);
            if self.register_server(server.clone()) {
                tasks.push(tokio::spawn(server.run(shutdown.subscribe())));
            }
        }

        for rule in rules.iter().filter(|r| r.role == ClusterRole::Client) {
            let client = ClusterClient::new(rule.cluster_id, rule.address.clone(), self.clone());
            tasks.push(tokio::spawn(client.run(shutdown.subscribe())));
        }

        tracing::info!(
            "replication started: {} server(s), {} channel task(s)",
            self.servers.len(),
            tasks.len()
        );
        Ok(tasks)
    }
}

impl StickyPublisher for ReplicationAgent {
    fn publish(&self, key: StickyKey, client: IpAddr, backend: Option<SocketAddr>) {
        if let Some(server) = self.server(key.cluster_id) {
            server.send(StickyMessage::new(key.sticky_id, client, backend));
        }
    }
}
