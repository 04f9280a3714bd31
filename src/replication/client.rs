//! Cluster Client
//!
//! Follows one peer's cluster server and applies every update it streams to
//! the local sticky stores. Any I/O or framing error drops the connection;
//! the client reconnects after a fixed delay until shutdown.

use super::agent::ReplicationAgent;
use super::config::{CONNECT_TIMEOUT, READ_TIMEOUT, RECONNECT_DELAY};
use super::protocol::{read_frame, Frame, ProtocolError};
use bytes::BytesMut;
use std::io;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::watch;

/// Client side of one cluster channel.
pub struct ClusterClient {
    cluster_id: u64,
    peer: String,
    agent: Arc<ReplicationAgent>,
}

enum Session {
    /// Shutdown was requested.
    Stopped,
    /// The peer closed the stream cleanly.
    Closed,
}

impl ClusterClient {
    pub fn new(cluster_id: u64, peer: impl Into<String>, agent: Arc<ReplicationAgent>) -> Self {
        Self {
            cluster_id,
            peer: peer.into(),
            agent,
        }
    }

    pub fn cluster_id(&self) -> u64 {
        self.cluster_id
    }

    /// Connect, follow and reconnect until shutdown.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        while !*shutdown.borrow() {
            tracing::info!("cluster={} connecting to {}", self.cluster_id, self.peer);
            match self.connect().await {
                Ok(stream) => {
                    tracing::info!("cluster={} connected to {}", self.cluster_id, self.peer);
                    match self.follow(stream, &mut shutdown).await {
                        Ok(Session::Stopped) => break,
                        Ok(Session::Closed) => {
                            tracing::info!("cluster={} peer {} closed", self.cluster_id, self.peer)
                        }
                        Err(e) => tracing::error!(
                            "cluster={} peer {} read failed: {}",
                            self.cluster_id,
                            self.peer,
                            e
                        ),
                    }
                }
                Err(e) => {
                    tracing::error!("cluster={} connect {} failed: {}", self.cluster_id, self.peer, e)
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                changed = shutdown.changed() => if changed.is_err() {
                    break;
                },
            }
        }
        tracing::info!("cluster={} client for {} stopped", self.cluster_id, self.peer);
    }

    async fn connect(&self) -> io::Result<TcpStream> {
        match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(self.peer.as_str())).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out")),
        }
    }

    async fn follow(
        &self,
        mut stream: TcpStream,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Session, ProtocolError> {
        let mut buf = BytesMut::with_capacity(256);
        loop {
            let next = tokio::select! {
                next = tokio::time::timeout(READ_TIMEOUT, read_frame(&mut stream, &mut buf)) => next,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Ok(Session::Stopped);
                    }
                    continue;
                }
            };

            match next {
                // Idle link; partial input stays buffered.
                Err(_) => continue,
                Ok(Ok(None)) => return Ok(Session::Closed),
                Ok(Ok(Some(Frame::Nop))) => {}
                Ok(Ok(Some(Frame::New(msg)))) => {
                    tracing::debug!(
                        "cluster={} received sticky={} client={} backend={:?}",
                        self.cluster_id,
                        msg.sticky_id,
                        msg.client,
                        msg.backend
                    );
                    self.agent.apply_remote(self.cluster_id, &msg);
                }
                Ok(Err(e)) => return Err(e),
            }
        }
    }
}
