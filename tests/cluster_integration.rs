//! Sticky replication between two relays over a real cluster channel.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use sticky_relay::replication::{ClusterClient, ClusterServer};
use sticky_relay::{
    BalancePolicy, LoadBalancer, ReplicationAgent, StickyConfig, StickyKey, StickyRegistry,
    StickyStore,
};
use tokio::sync::watch;

fn sticky_config() -> StickyConfig {
    StickyConfig::memory(32, 128, 300, StickyKey::from_names(Some("edge"), "web"))
}

struct Node {
    agent: Arc<ReplicationAgent>,
    store: Arc<dyn StickyStore>,
}

fn node() -> Node {
    let registry = Arc::new(StickyRegistry::new());
    let store = registry.get_or_create(&sticky_config());
    Node {
        agent: Arc::new(ReplicationAgent::new(registry)),
        store,
    }
}

async fn wait_for<F: Fn() -> bool>(cond: F) {
    for _ in 0..300 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("replica did not converge");
}

/// `a` serves the cluster, `b` follows it.
async fn link(a: &Node, b: &Node, shutdown: &watch::Receiver<bool>) {
    let key = sticky_config().key;
    let server = ClusterServer::bind(key.cluster_id, "127.0.0.1:0", a.agent.registry().clone())
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    let server = Arc::new(server);
    assert!(a.agent.register_server(server.clone()));
    tokio::spawn(server.run(shutdown.clone()));

    let client = ClusterClient::new(key.cluster_id, addr.to_string(), b.agent.clone());
    tokio::spawn(client.run(shutdown.clone()));
}

#[tokio::test]
async fn test_existing_entries_dumped_to_new_peer() {
    let (tx, rx) = watch::channel(false);
    let a = node();
    let b = node();

    let client: IpAddr = "198.51.100.7".parse().unwrap();
    let backend: SocketAddr = "10.0.0.1:8080".parse().unwrap();
    a.store.put(client, backend);

    link(&a, &b, &rx).await;
    wait_for(|| b.store.get(client) == Some(backend)).await;
    tx.send(true).unwrap();
}

#[tokio::test]
async fn test_balancer_decisions_replicate() {
    let (tx, rx) = watch::channel(false);
    let a = node();
    let b = node();
    link(&a, &b, &rx).await;

    let b1: SocketAddr = "10.0.0.1:80".parse().unwrap();
    let b2: SocketAddr = "10.0.0.2:80".parse().unwrap();
    let balancer = LoadBalancer::new(BalancePolicy::RoundRobin, true, a.store.clone())
        .with_publisher(a.agent.clone());
    balancer.on_resolve(vec![b1, b2]);

    // Wait until b is streaming before producing updates.
    let server = a.agent.server(sticky_config().key.cluster_id).unwrap();
    wait_for(|| server.peers() == 1).await;

    let client: IpAddr = "203.0.113.9".parse().unwrap();
    let mut ctx = balancer.create_context(client);
    assert_eq!(balancer.next_backend(&mut ctx), Some(b1));
    balancer.on_connect_success(&ctx);
    wait_for(|| b.store.get(client) == Some(b1)).await;

    // A failed attempt withdraws the assignment everywhere.
    let mut ctx = balancer.create_context(client);
    assert_eq!(balancer.next_backend(&mut ctx), Some(b1));
    balancer.on_connect_failure(&mut ctx);
    assert_eq!(a.store.get(client), None);
    wait_for(|| b.store.get(client).is_none()).await;

    tx.send(true).unwrap();
}

#[tokio::test]
async fn test_unreplicated_store_stays_local() {
    let (tx, rx) = watch::channel(false);
    let a = node();
    let b = node();
    link(&a, &b, &rx).await;

    let server = a.agent.server(sticky_config().key.cluster_id).unwrap();
    wait_for(|| server.peers() == 1).await;

    // Same sticky name, no cluster name: never published.
    let local = Arc::new(StickyRegistry::new())
        .get_or_create(&StickyConfig::memory(32, 16, 60, StickyKey::from_names(None, "web")));
    let backend: SocketAddr = "10.0.0.3:80".parse().unwrap();
    let balancer = LoadBalancer::new(BalancePolicy::None, false, local)
        .with_publisher(a.agent.clone());
    balancer.on_resolve(vec![backend]);

    let client: IpAddr = "192.0.2.1".parse().unwrap();
    let mut ctx = balancer.create_context(client);
    assert_eq!(balancer.next_backend(&mut ctx), Some(backend));
    balancer.on_connect_success(&ctx);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(b.store.get(client), None);
    tx.send(true).unwrap();
}
