//! Sticky Publisher Port
//!
//! Outbound notification of locally made sticky decisions, consumed by the
//! cluster replication layer.

use crate::domain::entities::StickyKey;
use std::net::{IpAddr, SocketAddr};

/// Sink for sticky updates produced by this relay.
pub trait StickyPublisher: Send + Sync {
    /// `backend == None` announces that `client` lost its assignment.
    fn publish(&self, key: StickyKey, client: IpAddr, backend: Option<SocketAddr>);
}
