//! TCP Server Adapter
//!
//! Accepts client connections on a forward's listen address and hands them
//! round-robin to a fixed set of event loops.

use crate::bridge::{AcceptSender, EventLoop, Forward};
use crate::infrastructure::ShutdownController;
use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

/// TCP Server - inbound adapter for one forward rule.
///
/// This adapter:
/// 1. Binds the listen address up front, so a bad address fails startup
/// 2. Spawns `workers` event loops
/// 3. Distributes accepted sockets across them until shutdown
pub struct TcpServer {
    listener: TcpListener,
    forward: Arc<Forward>,
    workers: usize,
}

impl TcpServer {
    /// Bind `forward.listen`.
    ///
    /// The forward's listen address is updated to the bound one, which
    /// matters when binding port 0.
    pub async fn bind(mut forward: Forward, workers: usize) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(forward.listen)
            .await
            .with_context(|| format!("failed to bind {}", forward.listen))?;
        forward.listen = listener.local_addr()?;
        tracing::info!(
            "listening on {} policy={} workers={}",
            forward.listen,
            forward.endpoint.balancer().policy().as_str(),
            workers
        );
        Ok(Self {
            listener,
            forward: Arc::new(forward),
            workers: workers.max(1),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.forward.listen
    }

    pub fn forward(&self) -> &Arc<Forward> {
        &self.forward
    }

    /// Accept until shutdown.
    ///
    /// Returning closes the loop queues; loops finish once their bridges end.
    #[cfg_attr(coverage_nightly, coverage(off))]
    pub async fn run(self, shutdown: ShutdownController) -> anyhow::Result<()> {
        let mut senders: Vec<AcceptSender> = Vec::with_capacity(self.workers);
        for _ in 0..self.workers {
            let (event_loop, tx) = EventLoop::new(self.forward.clone(), shutdown.clone());
            tokio::spawn(event_loop.run());
            senders.push(tx);
        }

        let mut stop = shutdown.subscribe();
        let mut next = 0usize;
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        tracing::debug!("accepted {} on {}", peer, self.forward.listen);
                        let idx = next % senders.len();
                        next = next.wrapping_add(1);
                        if senders[idx].send((stream, peer)).await.is_err() {
                            tracing::error!("event loop {} is gone, dropping {}", idx, peer);
                        }
                    }
                    Err(e) => {
                        tracing::error!("accept on {} failed: {}", self.forward.listen, e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                },
                changed = stop.changed() => if changed.is_err() {
                    break;
                },
            }
            if *stop.borrow() {
                break;
            }
        }

        tracing::info!("stopped listening on {}", self.forward.listen);
        Ok(())
    }
}
