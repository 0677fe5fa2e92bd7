//! Configuration for Streamgate
//!
//! Configuration is loaded with the following priority (highest to lowest):
//! 1. Command-line arguments
//! 2. Configuration file (TOML)
//! 3. Default values
//!
//! ## Example Configuration
//!
//! ```toml
//! # streamgate.toml
//!
//! [proxy]
//! max_frame_bytes = 104857600
//! max_in_flight = 10
//!
//! [[virtual_clusters]]
//! name = "demo"
//! upstream_bootstrap = "kafka-0.internal:9092"
//! log_frames = false
//!
//! [virtual_clusters.listener]
//! bind_addr = "0.0.0.0:9092"
//!
//! [[filters]]
//! type = "recordEncryption"
//! [filters.config]
//! kek_template = "KEK_${topicName}"
//! ```

mod args;
pub mod tls;

pub use args::ProxyArgs;
pub use tls::{DownstreamTlsConfig, UpstreamTlsConfig};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::error::{GateError, Result};

/// Default maximum frame size accepted from either side (100 MB)
pub const DEFAULT_MAX_FRAME_BYTES: u64 = 100 * 1024 * 1024;

/// Hard cap on the frame size regardless of configuration, to bound
/// allocations driven by a hostile length prefix.
pub const HARD_MAX_FRAME_BYTES: u64 = 256 * 1024 * 1024;

/// Default number of in-flight requests per connection
pub const DEFAULT_MAX_IN_FLIGHT: usize = 10;

/// A `host:port` pair used for upstream targets and advertised addresses
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct HostPort {
    pub host: String,
    pub port: u16,
}

impl HostPort {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for HostPort {
    type Err = GateError;

    fn from_str(s: &str) -> Result<Self> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| GateError::Config(format!("invalid host:port '{s}'")))?;
        if host.is_empty() {
            return Err(GateError::Config(format!("empty host in '{s}'")));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| GateError::Config(format!("invalid port in '{s}'")))?;
        Ok(HostPort::new(host, port))
    }
}

impl TryFrom<String> for HostPort {
    type Error = GateError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<HostPort> for String {
    fn from(hp: HostPort) -> String {
        hp.to_string()
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Proxy-wide tunables
    pub proxy: ProxySection,

    /// Admin HTTP endpoint (health + metrics)
    pub admin: AdminSection,

    /// Virtual clusters presented to clients
    pub virtual_clusters: Vec<VirtualClusterConfig>,

    /// Filters applied to every connection, in order
    pub filters: Vec<FilterDefinition>,
}

/// Proxy-wide tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxySection {
    /// Maximum frame size accepted from either side
    pub max_frame_bytes: u64,

    /// Maximum in-flight requests per connection. The downstream read loop
    /// pauses when this many requests have unsent responses.
    pub max_in_flight: usize,

    /// Idle timeout while relaying; 0 disables the timeout
    pub idle_timeout_ms: u64,

    /// Upstream TCP connect timeout
    pub connect_timeout_ms: u64,
}

impl Default for ProxySection {
    fn default() -> Self {
        Self {
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            idle_timeout_ms: 0,
            connect_timeout_ms: 10_000,
        }
    }
}

/// Admin HTTP endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminSection {
    pub enabled: bool,
    pub bind_addr: String,
}

impl Default for AdminSection {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_addr: "0.0.0.0:9190".to_string(),
        }
    }
}

/// A virtual cluster: one logical upstream Kafka cluster presented to
/// clients through the proxy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualClusterConfig {
    /// Unique name, used in logs and metrics labels
    pub name: String,

    /// Upstream bootstrap target
    pub upstream_bootstrap: HostPort,

    /// Downstream listener for this cluster
    pub listener: ListenerConfig,

    /// TLS material presented to downstream clients
    #[serde(default)]
    pub downstream_tls: Option<DownstreamTlsConfig>,

    /// TLS used towards the upstream cluster
    #[serde(default)]
    pub upstream_tls: Option<UpstreamTlsConfig>,

    /// Log connection open/close events at info level
    #[serde(default)]
    pub log_network: bool,

    /// Log every relayed frame at debug level (expensive)
    #[serde(default)]
    pub log_frames: bool,

    /// How broker addresses are advertised to clients
    #[serde(default)]
    pub broker_addresses: BrokerAddressRules,

    /// Proxy-terminated SASL gate
    #[serde(default)]
    pub sasl: Option<SaslConfig>,
}

/// Downstream listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    /// Address to bind, e.g. `0.0.0.0:9092`
    pub bind_addr: String,

    /// SNI host name clients must present to reach this cluster.
    /// Requires `downstream_tls`. When unset the cluster owns the whole port.
    #[serde(default)]
    pub sni_hostname: Option<String>,

    /// Host name advertised to clients for this listener. Defaults to the
    /// SNI host name, or the bind address when no SNI is configured.
    #[serde(default)]
    pub advertised_host: Option<String>,
}

/// How broker addresses in Metadata/FindCoordinator responses are rewritten
/// so clients reconnect through the proxy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum BrokerAddressRules {
    /// Advertise one address for every broker. Suitable for single-broker
    /// upstreams or when all traffic may go through the bootstrap route.
    Single,

    /// Advertise per-broker SNI host names derived from a pattern containing
    /// `$(nodeId)`, all on the listener port. Requires a TLS listener with a
    /// certificate covering the generated names.
    SniPattern { pattern: String },
}

impl Default for BrokerAddressRules {
    fn default() -> Self {
        BrokerAddressRules::Single
    }
}

/// Proxy-terminated SASL PLAIN configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaslConfig {
    pub users: Vec<UserCredential>,
}

/// A single SASL PLAIN credential
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserCredential {
    pub username: String,
    pub password: String,
}

/// A filter to instantiate from the registry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterDefinition {
    /// Registered short name, e.g. `recordEncryption`
    #[serde(rename = "type")]
    pub filter_type: String,

    /// Filter-specific configuration, validated by the factory at startup
    #[serde(default = "empty_filter_config")]
    pub config: toml::Value,
}

fn empty_filter_config() -> toml::Value {
    toml::Value::Table(Default::default())
}

impl ProxyConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            GateError::Config(format!("cannot read config file {}: {e}", path.display()))
        })?;
        let config: ProxyConfig = toml::from_str(&raw)
            .map_err(|e| GateError::Config(format!("invalid config file: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Apply CLI overrides on top of the file configuration
    pub fn merge_args(mut self, arg_overrides: &ProxyArgs) -> Self {
        if let Some(max_in_flight) = arg_overrides.max_in_flight {
            self.proxy.max_in_flight = max_in_flight;
        }
        if arg_overrides.admin {
            self.admin.enabled = true;
        }
        self
    }

    /// Validate invariants that cannot be expressed in the type system.
    /// Violations are fatal at startup.
    pub fn validate(&self) -> Result<()> {
        if self.virtual_clusters.is_empty() {
            return Err(GateError::Config(
                "at least one virtual cluster must be configured".to_string(),
            ));
        }
        let mut names = std::collections::HashSet::new();
        for vc in &self.virtual_clusters {
            if !names.insert(vc.name.as_str()) {
                return Err(GateError::Config(format!(
                    "duplicate virtual cluster name '{}'",
                    vc.name
                )));
            }
            if vc.listener.sni_hostname.is_some() && vc.downstream_tls.is_none() {
                return Err(GateError::Config(format!(
                    "virtual cluster '{}' uses SNI routing but has no downstream_tls",
                    vc.name
                )));
            }
            if let BrokerAddressRules::SniPattern { pattern } = &vc.broker_addresses {
                if !pattern.contains("$(nodeId)") {
                    return Err(GateError::Config(format!(
                        "virtual cluster '{}' broker address pattern must contain $(nodeId)",
                        vc.name
                    )));
                }
                if vc.downstream_tls.is_none() {
                    return Err(GateError::Config(format!(
                        "virtual cluster '{}' uses SNI broker addressing but has no downstream_tls",
                        vc.name
                    )));
                }
            }
        }
        // Two clusters may share a bind address only when both are routed by SNI
        for (i, a) in self.virtual_clusters.iter().enumerate() {
            for b in self.virtual_clusters.iter().skip(i + 1) {
                if a.listener.bind_addr == b.listener.bind_addr
                    && (a.listener.sni_hostname.is_none() || b.listener.sni_hostname.is_none())
                {
                    return Err(GateError::Config(format!(
                        "virtual clusters '{}' and '{}' share listener {} without SNI routing",
                        a.name, b.name, a.listener.bind_addr
                    )));
                }
            }
        }
        if self.proxy.max_in_flight == 0 {
            return Err(GateError::Config("max_in_flight must be > 0".to_string()));
        }
        Ok(())
    }

    /// The effective frame size cap, clamped to the hard maximum
    pub fn effective_max_frame_bytes(&self) -> u64 {
        self.proxy.max_frame_bytes.min(HARD_MAX_FRAME_BYTES).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_config(extra: &str) -> String {
        format!(
            r#"
[[virtual_clusters]]
name = "demo"
upstream_bootstrap = "kafka.internal:9092"

[virtual_clusters.listener]
bind_addr = "0.0.0.0:19092"
{extra}
"#
        )
    }

    #[test]
    fn test_minimal_config_parses() {
        let config: ProxyConfig = toml::from_str(&minimal_config("")).unwrap();
        config.validate().unwrap();
        assert_eq!(config.virtual_clusters.len(), 1);
        assert_eq!(config.virtual_clusters[0].name, "demo");
        assert_eq!(
            config.virtual_clusters[0].upstream_bootstrap,
            HostPort::new("kafka.internal", 9092)
        );
        assert_eq!(config.proxy.max_in_flight, DEFAULT_MAX_IN_FLIGHT);
    }

    #[test]
    fn test_no_virtual_clusters_is_fatal() {
        let config: ProxyConfig = toml::from_str("").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_sni_without_tls_is_fatal() {
        let config: ProxyConfig =
            toml::from_str(&minimal_config(r#"sni_hostname = "demo.example.com""#)).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_names_are_fatal() {
        let raw = format!("{}{}", minimal_config(""), minimal_config(""));
        let config: ProxyConfig = toml::from_str(&raw).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_shared_listener_without_sni_is_fatal() {
        let raw = r#"
[[virtual_clusters]]
name = "a"
upstream_bootstrap = "a.internal:9092"
[virtual_clusters.listener]
bind_addr = "0.0.0.0:19092"

[[virtual_clusters]]
name = "b"
upstream_bootstrap = "b.internal:9092"
[virtual_clusters.listener]
bind_addr = "0.0.0.0:19092"
"#;
        let config: ProxyConfig = toml::from_str(raw).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(minimal_config("").as_bytes()).unwrap();
        file.flush().unwrap();
        let config = ProxyConfig::from_file(file.path()).unwrap();
        assert_eq!(config.virtual_clusters[0].name, "demo");
    }

    #[test]
    fn test_from_file_missing_is_fatal() {
        let err = ProxyConfig::from_file(Path::new("/nonexistent/streamgate.toml")).unwrap_err();
        assert!(matches!(err, GateError::Config(_)));
    }

    #[test]
    fn test_from_file_rejects_garbage() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"not [valid toml").unwrap();
        file.flush().unwrap();
        assert!(ProxyConfig::from_file(file.path()).is_err());
    }

    #[test]
    fn test_host_port_parsing() {
        let hp: HostPort = "broker-0.example.com:9092".parse().unwrap();
        assert_eq!(hp.host, "broker-0.example.com");
        assert_eq!(hp.port, 9092);
        assert!("no-port".parse::<HostPort>().is_err());
        assert!(":9092".parse::<HostPort>().is_err());
        assert!("host:notaport".parse::<HostPort>().is_err());
    }

    #[test]
    fn test_filter_definition_parses() {
        let raw = format!(
            "{}\n{}",
            minimal_config(""),
            r#"
[[filters]]
type = "recordEncryption"
[filters.config]
kek_template = "KEK_${topicName}"
"#
        );
        let config: ProxyConfig = toml::from_str(&raw).unwrap();
        assert_eq!(config.filters.len(), 1);
        assert_eq!(config.filters[0].filter_type, "recordEncryption");
    }

    #[test]
    fn test_broker_address_pattern_requires_node_id() {
        let raw = r#"
[[virtual_clusters]]
name = "demo"
upstream_bootstrap = "kafka.internal:9092"
[virtual_clusters.listener]
bind_addr = "0.0.0.0:19092"
[virtual_clusters.broker_addresses]
mode = "sni_pattern"
pattern = "broker.example.com"
"#;
        let config: ProxyConfig = toml::from_str(raw).unwrap();
        assert!(config.validate().is_err());
    }
}
