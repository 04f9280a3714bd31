use crate::application::{parse_host_ports, HostPort};
use crate::domain::value_objects::ForwardOptions;
use crate::infrastructure::buffer_pool::{DEFAULT_BUFFER_SIZE, DEFAULT_POOL_SIZE};
use crate::infrastructure::proxy_protocol::MAX_HEADER_LEN;
use crate::replication::ClusterRule;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("forward rule needs `<listen> <host:port>[,...] [options]`: {0}")]
    MalformedForward(String),

    #[error("invalid backend in forward `{rule}`: {reason}")]
    InvalidBackend { rule: String, reason: String },

    #[error("invalid options in forward `{rule}`: {reason}")]
    InvalidOptions { rule: String, reason: String },

    #[error("invalid cluster rule: {0}")]
    InvalidCluster(String),
}

/// One listen address relayed to a backend pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardRule {
    pub listen: String,
    pub backends: Vec<HostPort>,
    pub options: ForwardOptions,
}

impl FromStr for ForwardRule {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rule = s.trim();
        let parts: Vec<&str> = rule.split_whitespace().collect();
        let (listen, backends, options) = match parts.as_slice() {
            [listen, backends] => (*listen, *backends, ""),
            [listen, backends, options] => (*listen, *backends, *options),
            _ => return Err(ConfigError::MalformedForward(rule.to_string())),
        };

        let backends = parse_host_ports(backends).map_err(|e| ConfigError::InvalidBackend {
            rule: rule.to_string(),
            reason: e.to_string(),
        })?;
        if backends.is_empty() {
            return Err(ConfigError::MalformedForward(rule.to_string()));
        }
        let options = ForwardOptions::parse(options).map_err(|e| ConfigError::InvalidOptions {
            rule: rule.to_string(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            listen: listen.to_string(),
            backends,
            options,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub forwards: Vec<ForwardRule>,
    pub clusters: Vec<ClusterRule>,

    // Engine settings
    pub workers: usize,
    pub buffer_size: usize,
    pub buffer_pool: usize,
    pub connect_timeout_ms: u64,
    pub paranoid_buffers: bool,
    pub debug: bool,
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            forwards: Vec::new(),
            clusters: Vec::new(),
            workers: default_workers(),
            buffer_size: DEFAULT_BUFFER_SIZE,
            buffer_pool: DEFAULT_POOL_SIZE,
            connect_timeout_ms: 10_000,
            paranoid_buffers: false,
            debug: false,
        }
    }
}

fn parse_list<T>(value: Option<String>, parse: impl Fn(&str) -> Result<T, ConfigError>) -> Result<Vec<T>, ConfigError> {
    value
        .as_deref()
        .unwrap_or("")
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(parse)
        .collect()
}

fn parse_flag(value: Option<String>) -> bool {
    value
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(false)
}

fn parse_or<T: FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

/// Build a config from a variable lookup.
///
/// Unparseable numbers fall back to their defaults; malformed rules are errors.
/// The buffer size never drops below the longest PROXY v1 header.
pub fn config_from<F>(var: F) -> Result<Config, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let defaults = Config::default();

    let forwards = parse_list(var("RELAY_FORWARDS"), str::parse::<ForwardRule>)?;
    let clusters = parse_list(var("RELAY_CLUSTERS"), |s| {
        s.parse::<ClusterRule>()
            .map_err(|e| ConfigError::InvalidCluster(e.to_string()))
    })?;

    let workers = parse_or(var("RELAY_WORKERS"), defaults.workers).max(1);
    // A PROXY header must fit one buffer whole.
    let buffer_size = parse_or(var("RELAY_BUFFER_SIZE"), defaults.buffer_size).max(MAX_HEADER_LEN);
    let buffer_pool = parse_or(var("RELAY_BUFFER_POOL"), defaults.buffer_pool);
    let connect_timeout_ms = parse_or(var("RELAY_CONNECT_TIMEOUT_MS"), defaults.connect_timeout_ms);
    let paranoid_buffers = parse_flag(var("RELAY_PARANOID_BUFFERS"));

    let debug = var("DEBUG").is_some();

    Ok(Config {
        forwards,
        clusters,
        workers,
        buffer_size,
        buffer_pool,
        connect_timeout_ms,
        paranoid_buffers,
        debug,
    })
}

pub fn load_config() -> anyhow::Result<Config> {
    Ok(config_from(|name| std::env::var(name).ok())?)
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::domain::value_objects::BalancePolicy;
    use crate::replication::ClusterRole;
    use std::collections::HashMap;

    fn config_with(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        config_from(|name| map.get(name).cloned())
    }

    // ===== Defaults Tests =====

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert!(cfg.forwards.is_empty());
        assert!(cfg.clusters.is_empty());
        assert!(cfg.workers >= 1);
        assert_eq!(cfg.buffer_size, 2048);
        assert_eq!(cfg.buffer_pool, 8192);
        assert_eq!(cfg.connect_timeout_ms, 10_000);
        assert!(!cfg.paranoid_buffers);
    }

    #[test]
    fn test_config_from_empty_env() {
        let cfg = config_with(&[]).unwrap();
        assert!(cfg.forwards.is_empty());
        assert!(!cfg.debug);
        assert_eq!(cfg.buffer_size, DEFAULT_BUFFER_SIZE);
    }

    // ===== Forward Rule Tests =====

    #[test]
    fn test_parse_forward_rule() {
        let rule: ForwardRule = "0.0.0.0:8080 a.local:80,b.local:81 LB=RR,FAILOVER"
            .parse()
            .unwrap();
        assert_eq!(rule.listen, "0.0.0.0:8080");
        assert_eq!(rule.backends.len(), 2);
        assert_eq!(rule.backends[1].port, 81);
        assert_eq!(rule.options.policy, BalancePolicy::RoundRobin);
        assert!(rule.options.failover);
    }

    #[test]
    fn test_parse_forward_rule_without_options() {
        let rule: ForwardRule = "127.0.0.1:9000 10.0.0.1:9000".parse().unwrap();
        assert_eq!(rule.options, ForwardOptions::default());
    }

    #[test]
    fn test_parse_forward_rule_errors() {
        assert!(matches!(
            "127.0.0.1:9000".parse::<ForwardRule>(),
            Err(ConfigError::MalformedForward(_))
        ));
        assert!(matches!(
            "127.0.0.1:9000 nohost".parse::<ForwardRule>(),
            Err(ConfigError::InvalidBackend { .. })
        ));
        assert!(matches!(
            "127.0.0.1:9000 a:1 LB=WEIGHTED".parse::<ForwardRule>(),
            Err(ConfigError::InvalidOptions { .. })
        ));
    }

    // ===== Environment Tests =====

    #[test]
    fn test_config_with_forwards_and_clusters() {
        let cfg = config_with(&[
            (
                "RELAY_FORWARDS",
                "0.0.0.0:80 web:80 LB=RR,STICKY=MEM:24:1000:300:web:prod; 0.0.0.0:81 db:5432",
            ),
            ("RELAY_CLUSTERS", "in prod 0.0.0.0:7000;out prod peer:7000"),
        ])
        .unwrap();

        assert_eq!(cfg.forwards.len(), 2);
        assert!(cfg.forwards[0].options.sticky.is_replicated());
        assert_eq!(cfg.clusters.len(), 2);
        assert_eq!(cfg.clusters[0].role, ClusterRole::Server);
        assert_eq!(cfg.clusters[1].role, ClusterRole::Client);
        assert_eq!(
            cfg.clusters[0].cluster_id,
            cfg.forwards[0].options.sticky.key.cluster_id
        );
    }

    #[test]
    fn test_config_bad_cluster_rule() {
        let err = config_with(&[("RELAY_CLUSTERS", "sideways prod 1.2.3.4:1")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidCluster(_)));
    }

    #[test]
    fn test_config_engine_settings() {
        let cfg = config_with(&[
            ("RELAY_WORKERS", "3"),
            ("RELAY_BUFFER_SIZE", "4096"),
            ("RELAY_BUFFER_POOL", "16"),
            ("RELAY_CONNECT_TIMEOUT_MS", "250"),
            ("RELAY_PARANOID_BUFFERS", "TRUE"),
            ("DEBUG", "1"),
        ])
        .unwrap();
        assert_eq!(cfg.workers, 3);
        assert_eq!(cfg.buffer_size, 4096);
        assert_eq!(cfg.buffer_pool, 16);
        assert_eq!(cfg.connect_timeout_ms, 250);
        assert!(cfg.paranoid_buffers);
        assert!(cfg.debug);
    }

    #[test]
    fn test_config_parse_error_uses_default() {
        let cfg = config_with(&[("RELAY_BUFFER_SIZE", "not_a_number"), ("RELAY_WORKERS", "0")]).unwrap();
        assert_eq!(cfg.buffer_size, 2048);
        assert_eq!(cfg.workers, 1);
    }

    #[test]
    fn test_config_buffer_size_fits_proxy_header() {
        let cfg = config_with(&[("RELAY_BUFFER_SIZE", "16")]).unwrap();
        assert_eq!(cfg.buffer_size, MAX_HEADER_LEN);

        let cfg = config_with(&[("RELAY_BUFFER_SIZE", "0")]).unwrap();
        assert_eq!(cfg.buffer_size, 107);
    }
}
