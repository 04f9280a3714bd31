//! Cluster Server
//!
//! Accepts peers on a cluster channel. Each peer first receives every entry
//! of every sticky store belonging to the cluster, then the stream of local
//! updates as they happen. Peers never send anything back; a dead peer is
//! noticed when a write fails.

use super::config::KEEPALIVE_INTERVAL;
use super::protocol::{encode_frame, Frame};
use crate::application::StickyRegistry;
use crate::domain::entities::StickyMessage;
use bytes::BytesMut;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch};

/// Updates buffered per peer before a slow peer starts losing them.
const UPDATE_BACKLOG: usize = 4096;

/// Server side of one cluster channel.
pub struct ClusterServer {
    cluster_id: u64,
    listener: TcpListener,
    registry: Arc<StickyRegistry>,
    updates: broadcast::Sender<StickyMessage>,
}

impl ClusterServer {
    pub async fn bind(
        cluster_id: u64,
        address: &str,
        registry: Arc<StickyRegistry>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(address).await?;
        let (updates, _) = broadcast::channel(UPDATE_BACKLOG);
        tracing::info!(
            "cluster={} accepting peers on {}",
            cluster_id,
            listener.local_addr()?
        );
        Ok(Self {
            cluster_id,
            listener,
            registry,
            updates,
        })
    }

    pub fn cluster_id(&self) -> u64 {
        self.cluster_id
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Number of peers currently streaming.
    pub fn peers(&self) -> usize {
        self.updates.receiver_count()
    }

    /// Forward a local update to every connected peer.
    pub fn send(&self, msg: StickyMessage) {
        // No receivers just means no peers.
        let _ = self.updates.send(msg);
    }

    /// Accept peers until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        // Subscribe before the dump so nothing falls in between.
                        let updates = self.updates.subscribe();
                        let server = self.clone();
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            server.serve_peer(stream, peer, updates, shutdown).await;
                        });
                    }
                    Err(e) => {
                        tracing::error!("cluster={} accept failed: {}", self.cluster_id, e);
                        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                    }
                },
                changed = shutdown.changed() => if changed.is_err() {
                    return;
                },
            }
            if *shutdown.borrow() {
                tracing::info!("cluster={} server stopped", self.cluster_id);
                return;
            }
        }
    }

    fn dump(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        for store in self.registry.stores_for_cluster(self.cluster_id) {
            let sticky_id = store.config().key.sticky_id;
            for entry in store.entries() {
                let msg = StickyMessage::new(sticky_id, entry.client, Some(entry.backend));
                encode_frame(&Frame::New(msg), &mut buf);
            }
        }
        buf
    }

    async fn serve_peer(
        &self,
        mut stream: TcpStream,
        peer: SocketAddr,
        mut updates: broadcast::Receiver<StickyMessage>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        tracing::info!("cluster={} new peer {}", self.cluster_id, peer);
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("cluster={} set_nodelay for {} failed: {}", self.cluster_id, peer, e);
        }

        let result: io::Result<()> = async {
            let snapshot = self.dump();
            if !snapshot.is_empty() {
                stream.write_all(&snapshot).await?;
            }

            let mut buf = BytesMut::with_capacity(64);
            loop {
                buf.clear();
                tokio::select! {
                    next = tokio::time::timeout(KEEPALIVE_INTERVAL, updates.recv()) => match next {
                        Ok(Ok(msg)) => encode_frame(&Frame::New(msg), &mut buf),
                        Ok(Err(broadcast::error::RecvError::Lagged(n))) => {
                            tracing::warn!("cluster={} peer {} lagged, {} updates lost", self.cluster_id, peer, n);
                            continue;
                        }
                        Ok(Err(broadcast::error::RecvError::Closed)) => return Ok(()),
                        Err(_) => encode_frame(&Frame::Nop, &mut buf),
                    },
                    _ = shutdown.changed() => return Ok(()),
                }
                stream.write_all(&buf).await?;
            }
        }
        .await;

        match result {
            Ok(()) => tracing::info!("cluster={} peer {} closed", self.cluster_id, peer),
            Err(e) => tracing::warn!("cluster={} peer {} dropped: {}", self.cluster_id, peer, e),
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::domain::entities::{StickyConfig, StickyKey};
    use crate::replication::protocol::read_frame;
    use std::time::Duration;

    async fn server_with_entry() -> (Arc<ClusterServer>, StickyKey) {
        let registry = Arc::new(StickyRegistry::new());
        let key = StickyKey::from_names(Some("prod"), "web");
        let store = registry.get_or_create(&StickyConfig::memory(32, 16, 60, key));
        store.put("10.0.0.1".parse().unwrap(), "192.168.0.1:80".parse().unwrap());

        let other = StickyKey::from_names(Some("other"), "web");
        registry
            .get_or_create(&StickyConfig::memory(32, 16, 60, other))
            .put("10.0.0.2".parse().unwrap(), "192.168.0.2:80".parse().unwrap());

        let server = ClusterServer::bind(key.cluster_id, "127.0.0.1:0", registry)
            .await
            .unwrap();
        (Arc::new(server), key)
    }

    #[tokio::test]
    async fn test_peer_gets_dump_then_updates() {
        let (server, key) = server_with_entry().await;
        let addr = server.local_addr().unwrap();
        let (_tx, rx) = watch::channel(false);
        tokio::spawn(server.clone().run(rx));

        let mut peer = TcpStream::connect(addr).await.unwrap();
        let mut buf = BytesMut::new();

        let first = read_frame(&mut peer, &mut buf).await.unwrap().unwrap();
        assert_eq!(
            first,
            Frame::New(StickyMessage::new(
                key.sticky_id,
                "10.0.0.1".parse().unwrap(),
                Some("192.168.0.1:80".parse().unwrap())
            ))
        );

        // Wait for the peer task to be subscribed.
        while server.peers() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let update = StickyMessage::new(key.sticky_id, "10.0.0.9".parse().unwrap(), None);
        server.send(update.clone());

        loop {
            match read_frame(&mut peer, &mut buf).await.unwrap().unwrap() {
                Frame::Nop => continue,
                Frame::New(msg) => {
                    assert_eq!(msg, update);
                    break;
                }
            }
        }
    }

    #[tokio::test]
    async fn test_idle_peer_gets_keepalive() {
        let (server, _) = server_with_entry().await;
        let addr = server.local_addr().unwrap();
        let (_tx, rx) = watch::channel(false);
        tokio::spawn(server.run(rx));

        let mut peer = TcpStream::connect(addr).await.unwrap();
        let mut buf = BytesMut::new();
        assert!(matches!(
            read_frame(&mut peer, &mut buf).await.unwrap(),
            Some(Frame::New(_))
        ));

        let next = tokio::time::timeout(
            KEEPALIVE_INTERVAL * 3,
            read_frame(&mut peer, &mut buf),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(next, Some(Frame::Nop));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (server, _) = server_with_entry().await;
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(server.run(rx));

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
