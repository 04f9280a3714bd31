//! Application Layer
//!
//! Wires domain services to ports: endpoints that own a load balancer and
//! resolve their backends, and the shared sticky store registry.

pub mod endpoint;
pub mod sticky_registry;

pub use endpoint::{parse_host_ports, run_resolver, Endpoint, HostPort, ResolveError};
pub use sticky_registry::StickyRegistry;
