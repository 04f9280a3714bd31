//! Sticky Store Port
//!
//! Defines the interface for remembering which backend served a client.
//! Keys are client addresses; implementations mask them to a prefix so a
//! whole subnet shares one assignment.

use crate::domain::entities::{StickyConfig, StickyEntry};
use std::net::{IpAddr, SocketAddr};

/// Store of client-to-backend assignments.
///
/// Implementations are internally synchronized: one writer at a time per
/// store, callable from any event loop.
pub trait StickyStore: Send + Sync {
    /// Configuration the store was built from.
    fn config(&self) -> &StickyConfig;

    /// Record `backend` for the prefix of `client`, refreshing its timestamp.
    fn put(&self, client: IpAddr, backend: SocketAddr);

    /// Drop any assignment for the prefix of `client`.
    fn clear(&self, client: IpAddr);

    /// Backend for the prefix of `client`, if present and not older than the TTL.
    fn get(&self, client: IpAddr) -> Option<SocketAddr>;

    /// Snapshot of every stored (masked client, backend) pair.
    fn entries(&self) -> Vec<StickyEntry>;

    /// Number of stored entries, expired ones included.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
