//! Replication Configuration
//!
//! Cluster rules: which cluster channels this relay serves and which peers
//! it follows.

use crate::domain::entities::id_from_name;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Idle time after which a server sends NOP to a peer.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(1);

/// Bound on a client's connect to its peer.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Read wait after which a client re-checks for shutdown.
pub const READ_TIMEOUT: Duration = Duration::from_secs(2);

/// Pause before a client reconnects.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ClusterRuleError {
    #[error("cluster rule needs `in|out <name> <address>`: {0}")]
    Malformed(String),

    #[error("unknown cluster role `{0}`, expected `in` or `out`")]
    UnknownRole(String),
}

/// Direction of a cluster channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterRole {
    /// Accept peers and stream local sticky updates to them.
    Server,
    /// Connect to a peer and apply the updates it streams.
    Client,
}

/// One configured cluster channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterRule {
    pub role: ClusterRole,
    pub name: String,
    pub cluster_id: u64,
    /// Bind address for a server, peer address for a client.
    pub address: String,
}

impl ClusterRule {
    pub fn new(role: ClusterRole, name: &str, address: &str) -> Self {
        Self {
            role,
            name: name.to_string(),
            cluster_id: id_from_name(name),
            address: address.to_string(),
        }
    }
}

impl FromStr for ClusterRule {
    type Err = ClusterRuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split_whitespace().collect();
        let [role, name, address] = parts.as_slice() else {
            return Err(ClusterRuleError::Malformed(s.trim().to_string()));
        };
        let role = match role.to_ascii_lowercase().as_str() {
            "in" => ClusterRole::Server,
            "out" => ClusterRole::Client,
            _ => return Err(ClusterRuleError::UnknownRole(role.to_string())),
        };
        Ok(Self::new(role, name, address))
    }
}

impl fmt::Display for ClusterRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let role = match self.role {
            ClusterRole::Server => "in",
            ClusterRole::Client => "out",
        };
        write!(f, "{} {} {}", role, self.name, self.address)
    }
}
