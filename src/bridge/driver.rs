//! Bridge Driver
//!
//! Runs one bridge to completion: picks and connects a backend through the
//! endpoint's load balancer, then waits on socket readiness for whatever
//! each half currently wants and feeds the results back into the
//! `BridgeContext` state machine.

use super::context::{BridgeContext, BridgeError, Side};
use crate::application::Endpoint;
use crate::infrastructure::{format_v1, BufferPool};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{Interest, Ready};
use tokio::net::TcpStream;

/// Default bound on one backend connect attempt.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything a bridge needs from its forward rule.
pub struct Forward {
    pub listen: SocketAddr,
    pub endpoint: Arc<Endpoint>,
    pub pool: Arc<BufferPool>,
    pub proxy_send: bool,
    pub connect_timeout: Duration,
}

/// Relay one accepted client until either side closes.
pub async fn run_bridge(
    forward: Arc<Forward>,
    client: TcpStream,
    client_addr: SocketAddr,
) -> Result<(), BridgeError> {
    let mut bc = BridgeContext::new(forward.pool.clone())?;
    let local = client.local_addr().ok();
    bc.attach_client(client, client_addr);
    tracing::info!(
        "bridge={} new connection {} > {}",
        bc.name(),
        client_addr,
        forward.listen
    );

    let result = connect_and_pump(&forward, &mut bc, client_addr, local).await;

    let remote = bc.handler(Side::Backend).remote_addr();
    bc.close();
    match result {
        Err(BridgeError::PeerClosed(side)) => {
            tracing::info!(
                "bridge={} end connection {} closed, backend={:?}",
                bc.name(),
                side,
                remote
            );
            Ok(())
        }
        other => other,
    }
}

async fn connect_and_pump(
    forward: &Forward,
    bc: &mut BridgeContext,
    client_addr: SocketAddr,
    local: Option<SocketAddr>,
) -> Result<(), BridgeError> {
    let backend = connect_backend(forward, bc, client_addr).await?;
    let header = forward
        .proxy_send
        .then(|| format_v1(Some(client_addr), local));
    bc.on_connected(backend, header.as_deref().map(str::as_bytes))?;
    pump(bc).await
}

async fn connect_backend(
    forward: &Forward,
    bc: &mut BridgeContext,
    client_addr: SocketAddr,
) -> Result<TcpStream, BridgeError> {
    let endpoint = &forward.endpoint;
    let mut lb = endpoint.create_context(client_addr.ip());

    loop {
        let addr = endpoint.next_backend(&mut lb).ok_or(BridgeError::NoBackend)?;
        bc.begin_connect(addr);

        let attempt = tokio::time::timeout(forward.connect_timeout, TcpStream::connect(addr)).await;
        let err = match attempt {
            Ok(Ok(stream)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    tracing::debug!("bridge={} set_nodelay on {} failed: {}", bc.name(), addr, e);
                }
                endpoint.on_connect_success(&lb);
                tracing::info!("bridge={} connected to {}", bc.name(), addr);
                return Ok(stream);
            }
            Ok(Err(e)) => e,
            Err(_) => io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
        };

        tracing::warn!("bridge={} unable to connect {}: {}", bc.name(), addr, err);
        endpoint.on_connect_failure(&mut lb);
        if !endpoint.can_retry(&lb) {
            return Err(BridgeError::ConnectExhausted { addr, source: err });
        }
    }
}

/// Interest for `side` given the state machine, if any.
fn interest(bc: &BridgeContext, side: Side) -> Option<Interest> {
    let h = bc.handler(side);
    if !h.is_open() {
        return None;
    }
    let want = h.want();
    let read = want.read && bc.can_read(side);
    let write = want.write && bc.can_write(side);
    match (read, write) {
        (true, true) => Some(Interest::READABLE.add(Interest::WRITABLE)),
        (true, false) => Some(Interest::READABLE),
        (false, true) => Some(Interest::WRITABLE),
        (false, false) => None,
    }
}

async fn readiness(stream: Option<&TcpStream>, interest: Option<Interest>) -> io::Result<Ready> {
    match (stream, interest) {
        (Some(s), Some(i)) => s.ready(i).await,
        _ => std::future::pending().await,
    }
}

async fn pump(bc: &mut BridgeContext) -> Result<(), BridgeError> {
    loop {
        let client_interest = interest(bc, Side::Client);
        let backend_interest = interest(bc, Side::Backend);
        if client_interest.is_none() && backend_interest.is_none() {
            return Err(BridgeError::PeerClosed(Side::Client));
        }

        let (side, ready) = {
            let client = bc.handler(Side::Client).stream.as_ref();
            let backend = bc.handler(Side::Backend).stream.as_ref();
            tokio::select! {
                r = readiness(client, client_interest) => (Side::Client, r?),
                r = readiness(backend, backend_interest) => (Side::Backend, r?),
            }
        };

        if ready.is_readable() || ready.is_read_closed() {
            on_readable(bc, side)?;
        }
        if ready.is_writable() || ready.is_write_closed() {
            on_writable(bc, side)?;
        }
    }
}

fn on_readable(bc: &mut BridgeContext, side: Side) -> Result<(), BridgeError> {
    if !bc.can_read(side) {
        return Ok(());
    }
    let handler = bc.handler_mut(side);
    let (Some(stream), Some(buf)) = (handler.stream.as_ref(), handler.inbound.as_mut()) else {
        return Ok(());
    };
    let read = stream.try_read(buf.spare_mut());
    match read {
        Ok(n) => bc.on_read(side, n),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn on_writable(bc: &mut BridgeContext, side: Side) -> Result<(), BridgeError> {
    if !bc.can_write(side) {
        return Ok(());
    }
    let handler = bc.handler_mut(side);
    let (Some(stream), Some(buf)) = (handler.stream.as_ref(), handler.outbound.as_ref()) else {
        return Ok(());
    };
    let written = if buf.has_remaining() {
        let res = stream.try_write(buf.pending());
        match res {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(e) => return Err(e.into()),
        }
    } else {
        0
    };
    tracing::trace!("bridge={} {} wrote {} bytes", bc.name(), side, written);
    bc.on_written(side, written);
    Ok(())
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::adapters::outbound::NullStickyStore;
    use crate::domain::entities::StickyConfig;
    use crate::domain::ports::AddressResolver;
    use crate::domain::services::LoadBalancer;
    use crate::domain::value_objects::BalancePolicy;
    use crate::application::parse_host_ports;
    use async_trait::async_trait;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    struct Literal;

    #[async_trait]
    impl AddressResolver for Literal {
        async fn resolve(&self, host: &str, port: u16) -> Vec<SocketAddr> {
            host.parse()
                .map(|ip| vec![SocketAddr::new(ip, port)])
                .unwrap_or_default()
        }
    }

    async fn forward_to(backends: &str, policy: BalancePolicy, proxy_send: bool) -> Arc<Forward> {
        let lb = LoadBalancer::new(
            policy,
            true,
            Arc::new(NullStickyStore::new(StickyConfig::disabled())),
        );
        let endpoint = Endpoint::new(parse_host_ports(backends).unwrap(), lb, Arc::new(Literal));
        endpoint.resolve().await.unwrap();
        Arc::new(Forward {
            listen: "127.0.0.1:0".parse().unwrap(),
            endpoint: Arc::new(endpoint),
            pool: Arc::new(BufferPool::new(64, 16, false)),
            proxy_send,
            connect_timeout: Duration::from_secs(2),
        })
    }

    /// Accept one client and run a bridge for it.
    async fn relay_once(forward: Arc<Forward>) -> (SocketAddr, tokio::task::JoinHandle<Result<(), BridgeError>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            run_bridge(forward, stream, peer).await
        });
        (addr, handle)
    }

    async fn echo_backend() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut s, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = s.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_relays_both_directions() {
        let backend = echo_backend().await;
        let forward = forward_to(&backend.to_string(), BalancePolicy::None, false).await;
        let (listen, handle) = relay_once(forward.clone()).await;

        let mut client = TcpStream::connect(listen).await.unwrap();
        let payload: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        client.write_all(&payload).await.unwrap();

        let mut echoed = vec![0u8; payload.len()];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(echoed, payload);

        drop(client);
        handle.await.unwrap().unwrap();
        assert_eq!(forward.pool.in_use(), 0);
    }

    #[tokio::test]
    async fn test_proxy_header_precedes_data() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend = listener.local_addr().unwrap();
        let forward = forward_to(&backend.to_string(), BalancePolicy::None, true).await;
        let (listen, _handle) = relay_once(forward).await;

        let mut client = TcpStream::connect(listen).await.unwrap();
        let client_local = client.local_addr().unwrap();
        let (mut upstream, _) = listener.accept().await.unwrap();
        client.write_all(b"ping").await.unwrap();

        let expected = format!(
            "PROXY TCP4 127.0.0.1 127.0.0.1 {} {}\r\nping",
            client_local.port(),
            listen.port()
        );
        let mut got = vec![0u8; expected.len()];
        upstream.read_exact(&mut got).await.unwrap();
        assert_eq!(String::from_utf8(got).unwrap(), expected);
    }

    #[tokio::test]
    async fn test_connect_failure_closes_client() {
        // Bind then drop to get a port nobody listens on.
        let dead = TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap();
        let forward = forward_to(&dead.to_string(), BalancePolicy::None, false).await;
        let (listen, handle) = relay_once(forward.clone()).await;

        let mut client = TcpStream::connect(listen).await.unwrap();
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(BridgeError::ConnectExhausted { .. })));

        let mut buf = [0u8; 1];
        let n = client.read(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0);
        assert_eq!(forward.pool.in_use(), 0);
    }

    #[tokio::test]
    async fn test_failover_to_next_backend() {
        let dead = TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap();
        let live = echo_backend().await;
        let forward = forward_to(
            &format!("{},{}", dead, live),
            BalancePolicy::RoundRobin,
            false,
        )
        .await;
        let (listen, _handle) = relay_once(forward).await;

        let mut client = TcpStream::connect(listen).await.unwrap();
        client.write_all(b"retry").await.unwrap();
        let mut got = [0u8; 5];
        client.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"retry");
    }

    #[tokio::test]
    async fn test_backend_close_ends_bridge() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend = listener.local_addr().unwrap();
        let forward = forward_to(&backend.to_string(), BalancePolicy::None, false).await;
        let (listen, handle) = relay_once(forward).await;

        let mut client = TcpStream::connect(listen).await.unwrap();
        let (mut upstream, _) = listener.accept().await.unwrap();
        upstream.write_all(b"bye").await.unwrap();
        drop(upstream);

        let mut got = Vec::new();
        client.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"bye");
        handle.await.unwrap().unwrap();
    }
}
