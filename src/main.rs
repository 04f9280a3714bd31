//! sticky-relay - TCP relay with sticky sessions and cluster replication
//!
//! This is the composition root that wires together all the components.

use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use sticky_relay::application::endpoint::RESOLVE_INTERVAL;
use sticky_relay::application::run_resolver;
use sticky_relay::domain::ports::{AddressResolver, StickyPublisher};
use sticky_relay::infrastructure::shutdown_signal;
use sticky_relay::{
    load_config, BufferPool, DnsResolver, Endpoint, Forward, LoadBalancer, ReplicationAgent,
    ShutdownController, StickyRegistry, TcpServer,
};

/// How long live bridges may keep running after a shutdown request.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration from environment
    let cfg = load_config()?;

    // Setup logging
    let log_level = if cfg.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt().with_max_level(log_level).init();

    tracing::info!(
        "starting sticky-relay forwards={} clusters={} workers={}",
        cfg.forwards.len(),
        cfg.clusters.len(),
        cfg.workers
    );
    if cfg.forwards.is_empty() {
        tracing::warn!("no forward rules configured (RELAY_FORWARDS)");
    }

    // ===== COMPOSITION ROOT =====

    let shutdown = ShutdownController::new();
    let registry = Arc::new(StickyRegistry::new());
    let resolver: Arc<dyn AddressResolver> = Arc::new(DnsResolver::new());

    // 1. Replication: cluster servers must be bound before forwards publish
    let agent = Arc::new(ReplicationAgent::new(registry.clone()));
    agent.start(&cfg.clusters, &shutdown).await?;
    let publisher: Arc<dyn StickyPublisher> = agent.clone();

    // 2. One endpoint and listener per forward rule
    let mut endpoints = Vec::with_capacity(cfg.forwards.len());
    let mut servers = Vec::with_capacity(cfg.forwards.len());
    for rule in &cfg.forwards {
        let listen: SocketAddr = rule
            .listen
            .parse()
            .with_context(|| format!("invalid listen address `{}`", rule.listen))?;

        let stickies = registry.get_or_create(&rule.options.sticky);
        let balancer = LoadBalancer::new(rule.options.policy, rule.options.failover, stickies)
            .with_publisher(publisher.clone());
        let endpoint = Arc::new(Endpoint::new(
            rule.backends.clone(),
            balancer,
            resolver.clone(),
        ));
        if let Err(e) = endpoint.resolve().await {
            tracing::warn!("{} (listen={}), will retry", e, listen);
        }

        let forward = Forward {
            listen,
            endpoint: endpoint.clone(),
            pool: Arc::new(BufferPool::new(
                cfg.buffer_size,
                cfg.buffer_pool,
                cfg.paranoid_buffers,
            )),
            proxy_send: rule.options.proxy_send,
            connect_timeout: Duration::from_millis(cfg.connect_timeout_ms),
        };
        servers.push(TcpServer::bind(forward, cfg.workers).await?);
        endpoints.push(endpoint);
    }

    // 3. Background tasks
    tokio::spawn(run_resolver(endpoints, RESOLVE_INTERVAL, shutdown.subscribe()));

    let mut listeners = Vec::with_capacity(servers.len());
    for server in servers {
        listeners.push(tokio::spawn(server.run(shutdown.clone())));
    }

    // 4. Run until signalled, then drain
    shutdown_signal(shutdown.clone()).await;

    for listener in listeners {
        match listener.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!("listener failed: {:#}", e),
            Err(e) => tracing::error!("listener task failed: {}", e),
        }
    }

    if shutdown.wait_for_drain(DRAIN_TIMEOUT).await {
        tracing::info!("all bridges closed");
    }
    tracing::info!("sticky-relay stopped");
    Ok(())
}
