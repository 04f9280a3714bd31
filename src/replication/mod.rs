//! Sticky Session Replication
//!
//! Relays sharing a cluster name keep their sticky stores in step over plain
//! TCP channels.
//!
//! ## Architecture
//!
//! - **Server (`in` rule)**: accepts peers, sends a full dump of the cluster's
//!   stores, then streams every local sticky decision; NOP keepalives fill
//!   idle seconds
//! - **Client (`out` rule)**: follows one peer and applies what it receives,
//!   reconnecting on any failure
//! - **Protocol**: opcode-prefixed binary frames (see [`protocol`])
//! - **Agent**: routes local decisions to the right server and remote updates
//!   to the right store
//!
//! Replication is one-way per channel; two relays replicating each other
//! configure both an `in` and an `out` rule.

pub mod agent;
pub mod client;
pub mod config;
pub mod protocol;
pub mod server;

pub use agent::ReplicationAgent;
pub use client::ClusterClient;
pub use config::{ClusterRole, ClusterRule, ClusterRuleError};
pub use protocol::{decode_frame, encode_frame, read_frame, Frame, ProtocolError};
pub use server::ClusterServer;
