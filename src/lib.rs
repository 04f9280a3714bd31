//! sticky-relay Library
//!
//! This module exposes the relay components for use in integration tests
//! and as a library.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub mod adapters;
pub mod application;
pub mod bridge;
pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod replication;

// Re-export commonly used types
pub use adapters::inbound::TcpServer;
pub use adapters::outbound::{DnsResolver, MemoryStickyStore, NullStickyStore};
pub use application::{Endpoint, StickyRegistry};
pub use bridge::{EventLoop, Forward};
pub use config::{load_config, Config, ForwardRule};
pub use domain::entities::{StickyConfig, StickyKey, StickyMessage};
pub use domain::ports::{AddressResolver, StickyPublisher, StickyStore};
pub use domain::services::LoadBalancer;
pub use domain::value_objects::{BalancePolicy, ForwardOptions};
pub use infrastructure::{BufferPool, ShutdownController};
pub use replication::{ClusterRule, ReplicationAgent};
