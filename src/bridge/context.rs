//! Bridge Context
//!
//! The two halves of one relayed TCP session and the buffer handoff between
//! them. Everything here is synchronous bookkeeping: the driver performs the
//! socket I/O and reports its outcome through `on_read`, `on_written` and
//! `on_connected`.
//!
//! Each half holds at most one buffer per direction. A filled inbound buffer
//! moves to the peer as its outbound buffer; once written out it moves back
//! as the owner's fresh inbound buffer. A half may only read while the peer
//! has nothing left to write, which is the relay's only backpressure.

use crate::infrastructure::{Buffer, BufferPool, PoolError};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpStream;

static NEXT_BRIDGE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("no backend address available")]
    NoBackend,

    #[error("backend connect failed, last tried {addr}: {source}")]
    ConnectExhausted { addr: SocketAddr, source: io::Error },

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("connection closed by {0}")]
    PeerClosed(Side),

    #[error("PROXY header of {len} bytes exceeds {capacity}-byte buffer")]
    HeaderTooLarge { len: usize, capacity: usize },
}

/// Which half of a bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    /// Accepted client socket.
    Client,
    /// Outgoing backend socket.
    Backend,
}

impl Side {
    pub fn other(self) -> Side {
        match self {
            Side::Client => Side::Backend,
            Side::Backend => Side::Client,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Client => f.write_str("client"),
            Side::Backend => f.write_str("backend"),
        }
    }
}

/// Names one half of one bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerToken {
    pub bridge_id: u64,
    pub side: Side,
}

/// Readiness a half is waiting for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Want {
    pub connect: bool,
    pub read: bool,
    pub write: bool,
}

/// One socket of a bridge plus the buffers it currently holds.
#[derive(Debug)]
pub struct ConnectionHandler {
    token: HandlerToken,
    pub(crate) stream: Option<TcpStream>,
    remote: Option<SocketAddr>,
    pub(crate) inbound: Option<Buffer>,
    pub(crate) outbound: Option<Buffer>,
    want: Want,
}

impl ConnectionHandler {
    fn new(token: HandlerToken, inbound: Buffer) -> Self {
        Self {
            token,
            stream: None,
            remote: None,
            inbound: Some(inbound),
            outbound: None,
            want: Want::default(),
        }
    }

    pub fn token(&self) -> HandlerToken {
        self.token
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote
    }

    pub fn want(&self) -> Want {
        self.want
    }

    pub fn has_inbound(&self) -> bool {
        self.inbound.is_some()
    }

    pub fn has_outbound(&self) -> bool {
        self.outbound.is_some()
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    fn take_buffers(&mut self) -> impl Iterator<Item = Buffer> {
        self.inbound.take().into_iter().chain(self.outbound.take())
    }
}

/// Owner of both halves of a relayed session.
pub struct BridgeContext {
    id: u64,
    client: ConnectionHandler,
    backend: ConnectionHandler,
    pool: Arc<BufferPool>,
}

impl BridgeContext {
    /// Create a bridge for an accepted client, checking out one buffer per half.
    pub fn new(pool: Arc<BufferPool>) -> Result<Self, BridgeError> {
        let id = NEXT_BRIDGE_ID.fetch_add(1, Ordering::Relaxed);
        let client_buf = pool.checkout()?;
        let backend_buf = match pool.checkout() {
            Ok(b) => b,
            Err(e) => {
                pool.release(client_buf);
                return Err(e.into());
            }
        };
        Ok(Self {
            id,
            client: ConnectionHandler::new(
                HandlerToken {
                    bridge_id: id,
                    side: Side::Client,
                },
                client_buf,
            ),
            backend: ConnectionHandler::new(
                HandlerToken {
                    bridge_id: id,
                    side: Side::Backend,
                },
                backend_buf,
            ),
            pool,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Short printable name used in log lines.
    pub fn name(&self) -> String {
        format!("{:08x}", self.id)
    }

    pub fn handler(&self, side: Side) -> &ConnectionHandler {
        match side {
            Side::Client => &self.client,
            Side::Backend => &self.backend,
        }
    }

    pub(crate) fn handler_mut(&mut self, side: Side) -> &mut ConnectionHandler {
        match side {
            Side::Client => &mut self.client,
            Side::Backend => &mut self.backend,
        }
    }

    /// Peer of the half named by `token`.
    ///
    /// # Panics
    ///
    /// If `token` belongs to another bridge.
    pub fn peer(&self, token: HandlerToken) -> &ConnectionHandler {
        assert_eq!(
            token.bridge_id,
            self.id,
            "handler {:?} is not part of bridge {}",
            token,
            self.name()
        );
        self.handler(token.side.other())
    }

    /// Attach the accepted client socket.
    pub fn attach_client(&mut self, stream: TcpStream, remote: SocketAddr) {
        self.client.stream = Some(stream);
        self.client.remote = Some(remote);
    }

    /// Start a backend attempt against `addr`.
    pub fn begin_connect(&mut self, addr: SocketAddr) {
        self.backend.stream = None;
        self.backend.remote = Some(addr);
        self.backend.want.connect = true;
    }

    /// Backend connected: enable reads on both halves.
    ///
    /// A PROXY header, when given, is queued to the backend ahead of any
    /// client byte. A header that does not fit the buffer whole fails the
    /// bridge.
    pub fn on_connected(
        &mut self,
        stream: TcpStream,
        proxy_header: Option<&[u8]>,
    ) -> Result<(), BridgeError> {
        self.backend.stream = Some(stream);
        self.mark_connected(proxy_header)
    }

    pub(crate) fn mark_connected(&mut self, proxy_header: Option<&[u8]>) -> Result<(), BridgeError> {
        self.backend.want.connect = false;
        self.backend.want.read = true;
        self.client.want.read = true;

        if let Some(header) = proxy_header {
            if let Some(buf) = self.client.inbound.as_mut() {
                let written = buf.put_slice(header);
                if written < header.len() {
                    let capacity = buf.capacity();
                    buf.clear();
                    return Err(BridgeError::HeaderTooLarge {
                        len: header.len(),
                        capacity,
                    });
                }
                self.pass_inbound_to_peer(Side::Client);
            }
        }
        Ok(())
    }

    /// Whether `side` may read now.
    pub fn can_read(&self, side: Side) -> bool {
        let me = self.handler(side);
        me.inbound.is_some() && self.peer(me.token).outbound.is_none()
    }

    /// Whether `side` has bytes waiting to be written to its socket.
    pub fn can_write(&self, side: Side) -> bool {
        self.handler(side).outbound.is_some()
    }

    /// Record a read of `n` bytes into `side`'s inbound buffer.
    ///
    /// Zero means end of stream and tears the bridge down.
    pub fn on_read(&mut self, side: Side, n: usize) -> Result<(), BridgeError> {
        if n == 0 {
            return Err(BridgeError::PeerClosed(side));
        }
        if let Some(buf) = self.handler_mut(side).inbound.as_mut() {
            buf.advance_filled(n);
        }
        tracing::trace!("bridge={} {} read {} bytes", self.name(), side, n);
        self.pass_inbound_to_peer(side);
        Ok(())
    }

    /// Record a write of `n` bytes from `side`'s outbound buffer.
    pub fn on_written(&mut self, side: Side, n: usize) {
        let drained = match self.handler_mut(side).outbound.as_mut() {
            Some(buf) => {
                buf.consume(n);
                !buf.has_remaining()
            }
            None => false,
        };
        if drained {
            self.pass_outbound_to_peer(side);
        }
    }

    fn pass_inbound_to_peer(&mut self, side: Side) {
        let me = self.handler_mut(side);
        me.want.read = false;
        let Some(buf) = me.inbound.take() else {
            return;
        };
        let peer = self.handler_mut(side.other());
        debug_assert!(peer.outbound.is_none());
        peer.outbound = Some(buf);
        peer.want.write = true;
    }

    fn pass_outbound_to_peer(&mut self, side: Side) {
        let me = self.handler_mut(side);
        me.want.write = false;
        let Some(mut buf) = me.outbound.take() else {
            return;
        };
        self.pool.recycle(&mut buf);
        let peer = self.handler_mut(side.other());
        peer.inbound = Some(buf);
        peer.want.read = true;
    }

    /// Close both sockets and return every held buffer to the pool.
    pub fn close(&mut self) {
        for side in [Side::Client, Side::Backend] {
            let handler = self.handler_mut(side);
            handler.stream = None;
            handler.want = Want::default();
            let buffers: Vec<Buffer> = handler.take_buffers().collect();
            for buf in buffers {
                self.pool.release(buf);
            }
        }
    }
}

impl Drop for BridgeContext {
    fn drop(&mut self) {
        self.close();
    }
}
