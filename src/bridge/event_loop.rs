//! Event Loop
//!
//! A worker owning a set of bridges. The listener hands accepted sockets to
//! loops round-robin through a small bounded queue; each loop registers them
//! as bridges and reaps finished ones. A failing or panicking bridge is
//! logged and dropped without affecting the loop.

use super::context::BridgeError;
use super::driver::{run_bridge, Forward};
use crate::infrastructure::ShutdownController;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

/// Capacity of a loop's accepted-socket queue.
pub const ACCEPT_QUEUE_CAPACITY: usize = 8;

static NEXT_LOOP_ID: AtomicU64 = AtomicU64::new(1);

/// Sending side of a loop's accepted-socket queue.
pub type AcceptSender = mpsc::Sender<(TcpStream, SocketAddr)>;

/// One bridge-driving worker.
pub struct EventLoop {
    id: u64,
    forward: Arc<Forward>,
    shutdown: ShutdownController,
    queue: mpsc::Receiver<(TcpStream, SocketAddr)>,
}

impl EventLoop {
    /// Create a loop and the sender the listener uses to feed it.
    pub fn new(forward: Arc<Forward>, shutdown: ShutdownController) -> (Self, AcceptSender) {
        let (tx, rx) = mpsc::channel(ACCEPT_QUEUE_CAPACITY);
        let id = NEXT_LOOP_ID.fetch_add(1, Ordering::Relaxed);
        (
            Self {
                id,
                forward,
                shutdown,
                queue: rx,
            },
            tx,
        )
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Run until the queue is closed and every bridge has finished.
    pub async fn run(mut self) {
        let mut bridges: JoinSet<Result<(), BridgeError>> = JoinSet::new();
        let mut accepting = true;
        tracing::debug!("event loop {} started for {}", self.id, self.forward.listen);

        while accepting || !bridges.is_empty() {
            tokio::select! {
                next = self.queue.recv(), if accepting => match next {
                    Some((stream, peer)) => self.register(&mut bridges, stream, peer),
                    None => accepting = false,
                },
                Some(done) = bridges.join_next(), if !bridges.is_empty() => {
                    self.reap(done);
                }
            }
        }

        tracing::debug!("event loop {} ended for {}", self.id, self.forward.listen);
    }

    fn register(
        &self,
        bridges: &mut JoinSet<Result<(), BridgeError>>,
        stream: TcpStream,
        peer: SocketAddr,
    ) {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("set_nodelay for client {} failed: {}", peer, e);
        }
        let forward = self.forward.clone();
        let guard = self.shutdown.bridge_guard();
        bridges.spawn(async move {
            let _guard = guard;
            run_bridge(forward, stream, peer).await
        });
    }

    fn reap(&self, done: Result<Result<(), BridgeError>, tokio::task::JoinError>) {
        match done {
            Ok(Ok(())) => {}
            Ok(Err(BridgeError::ConnectExhausted { addr, source })) => {
                tracing::error!(
                    "loop={} backend unreachable, last tried {}: {}",
                    self.id,
                    addr,
                    source
                );
            }
            Ok(Err(e)) => tracing::warn!("loop={} bridge failed: {}", self.id, e),
            Err(e) if e.is_panic() => tracing::error!("loop={} bridge panicked: {}", self.id, e),
            Err(e) => tracing::debug!("loop={} bridge cancelled: {}", self.id, e),
        }
    }
}
