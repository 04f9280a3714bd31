//! Address Resolver Port
//!
//! Turns a configured `host:port` into concrete socket addresses.

use async_trait::async_trait;
use std::net::SocketAddr;

/// Resolver for backend host names.
///
/// An empty result means the host is currently unusable; callers keep the
/// previously resolved list.
#[async_trait]
pub trait AddressResolver: Send + Sync {
    async fn resolve(&self, host: &str, port: u16) -> Vec<SocketAddr>;
}
