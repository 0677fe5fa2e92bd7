//! Virtual cluster model and endpoint resolution
//!
//! A virtual cluster is one logical upstream Kafka cluster presented to
//! clients through the proxy. The resolver maps `(endpoint, SNI)` pairs to
//! bindings; bindings carry the upstream target a connection should relay
//! to.

mod resolver;

pub use resolver::{BindingResolver, VirtualClusterBinding};

use std::sync::Arc;

use crate::config::{
    BrokerAddressRules, HostPort, SaslConfig, VirtualClusterConfig,
};
use crate::error::{GateError, Result};

/// A local listening endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub port: u16,
    pub tls: bool,
}

/// Runtime form of a configured virtual cluster, TLS material loaded
pub struct VirtualCluster {
    pub name: String,
    pub upstream_bootstrap: HostPort,
    pub downstream_tls: Option<Arc<rustls::ServerConfig>>,
    pub upstream_tls: Option<Arc<rustls::ClientConfig>>,
    pub log_network: bool,
    pub log_frames: bool,
    pub broker_addresses: BrokerAddressRules,
    pub sasl: Option<SaslConfig>,
    pub listener_port: u16,
    pub sni_hostname: Option<String>,
    pub advertised_host: String,
}

impl VirtualCluster {
    /// Build the runtime form from configuration, loading TLS material.
    /// Failures are fatal at startup.
    pub fn from_config(config: &VirtualClusterConfig) -> Result<Arc<Self>> {
        let listener_addr: std::net::SocketAddr =
            config.listener.bind_addr.parse().map_err(|e| {
                GateError::Config(format!(
                    "virtual cluster '{}' has invalid bind_addr '{}': {e}",
                    config.name, config.listener.bind_addr
                ))
            })?;

        let downstream_tls = config
            .downstream_tls
            .as_ref()
            .map(|tls| tls.build_server_config())
            .transpose()?;
        let upstream_tls = config
            .upstream_tls
            .as_ref()
            .map(|tls| tls.build_client_config())
            .transpose()?;

        let advertised_host = config
            .listener
            .advertised_host
            .clone()
            .or_else(|| config.listener.sni_hostname.clone())
            .unwrap_or_else(|| listener_addr.ip().to_string());

        Ok(Arc::new(Self {
            name: config.name.clone(),
            upstream_bootstrap: config.upstream_bootstrap.clone(),
            downstream_tls,
            upstream_tls,
            log_network: config.log_network,
            log_frames: config.log_frames,
            broker_addresses: config.broker_addresses.clone(),
            sasl: config.sasl.clone(),
            listener_port: listener_addr.port(),
            sni_hostname: config.listener.sni_hostname.clone(),
            advertised_host,
        }))
    }

    /// The address a client should use to reach the given broker through
    /// the proxy.
    pub fn advertised_broker_address(&self, node_id: i32) -> HostPort {
        match &self.broker_addresses {
            BrokerAddressRules::Single => {
                HostPort::new(self.advertised_host.clone(), self.listener_port)
            }
            BrokerAddressRules::SniPattern { pattern } => HostPort::new(
                pattern.replace("$(nodeId)", &node_id.to_string()),
                self.listener_port,
            ),
        }
    }

    /// Whether downstream connections for this cluster are TLS
    pub fn downstream_is_tls(&self) -> bool {
        self.downstream_tls.is_some()
    }
}

impl std::fmt::Debug for VirtualCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualCluster")
            .field("name", &self.name)
            .field("upstream_bootstrap", &self.upstream_bootstrap)
            .field("listener_port", &self.listener_port)
            .field("sni_hostname", &self.sni_hostname)
            .field("tls", &self.downstream_is_tls())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ListenerConfig;

    fn base_config() -> VirtualClusterConfig {
        VirtualClusterConfig {
            name: "demo".to_string(),
            upstream_bootstrap: HostPort::new("kafka.internal", 9092),
            listener: ListenerConfig {
                bind_addr: "127.0.0.1:19092".to_string(),
                sni_hostname: None,
                advertised_host: None,
            },
            downstream_tls: None,
            upstream_tls: None,
            log_network: false,
            log_frames: false,
            broker_addresses: BrokerAddressRules::Single,
            sasl: None,
        }
    }

    #[test]
    fn test_from_config_defaults() {
        let vc = VirtualCluster::from_config(&base_config()).unwrap();
        assert_eq!(vc.listener_port, 19092);
        assert_eq!(vc.advertised_host, "127.0.0.1");
        assert!(!vc.downstream_is_tls());
    }

    #[test]
    fn test_invalid_bind_addr_is_fatal() {
        let mut config = base_config();
        config.listener.bind_addr = "not-an-addr".to_string();
        assert!(VirtualCluster::from_config(&config).is_err());
    }

    #[test]
    fn test_single_mode_advertises_one_address() {
        let mut config = base_config();
        config.listener.advertised_host = Some("proxy.example.com".to_string());
        let vc = VirtualCluster::from_config(&config).unwrap();
        assert_eq!(
            vc.advertised_broker_address(0),
            HostPort::new("proxy.example.com", 19092)
        );
        assert_eq!(
            vc.advertised_broker_address(5),
            HostPort::new("proxy.example.com", 19092)
        );
    }

    #[test]
    fn test_sni_pattern_substitutes_node_id() {
        let mut config = base_config();
        config.broker_addresses = BrokerAddressRules::SniPattern {
            pattern: "broker-$(nodeId).demo.example.com".to_string(),
        };
        let vc = VirtualCluster::from_config(&config).unwrap();
        assert_eq!(
            vc.advertised_broker_address(2),
            HostPort::new("broker-2.demo.example.com", 19092)
        );
    }
}
