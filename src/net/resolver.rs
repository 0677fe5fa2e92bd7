//! `(endpoint, SNI) -> virtual cluster` resolution
//!
//! The table is read on every connection accept and rebuilt on
//! reconfiguration under the exclusive writer; broker bindings are
//! registered as Metadata responses flow through the broker-address
//! filter.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use super::{Endpoint, VirtualCluster};
use crate::config::{BrokerAddressRules, HostPort};
use crate::error::{GateError, Result};

/// The resolution of one downstream connection. Immutable per lookup.
#[derive(Debug, Clone)]
pub struct VirtualClusterBinding {
    pub virtual_cluster: Arc<VirtualCluster>,
    pub upstream_target: HostPort,
    /// True when the client connected to a bootstrap address of an
    /// SNI-routed cluster and is expected to rediscover brokers through
    /// Metadata before producing or fetching.
    pub restrict_upstream_to_metadata_discovery: bool,
}

#[derive(Default)]
struct BindingTable {
    /// Clusters owning a whole port
    plain: HashMap<u16, Arc<VirtualCluster>>,
    /// Clusters reached through their bootstrap SNI name
    sni: HashMap<(u16, String), Arc<VirtualCluster>>,
    /// Per-broker SNI names learned from Metadata responses
    brokers: HashMap<(u16, String), (Arc<VirtualCluster>, HostPort)>,
}

/// Maps `(endpoint, SNI)` to a binding
pub struct BindingResolver {
    table: RwLock<BindingTable>,
}

impl BindingResolver {
    pub fn empty() -> Self {
        Self {
            table: RwLock::new(BindingTable::default()),
        }
    }

    pub fn from_clusters(clusters: &[Arc<VirtualCluster>]) -> Self {
        let resolver = Self::empty();
        resolver.rebuild(clusters);
        resolver
    }

    /// Rebuild the static part of the table from configuration. Learned
    /// broker bindings for clusters that no longer exist are discarded.
    pub fn rebuild(&self, clusters: &[Arc<VirtualCluster>]) {
        let mut table = self.table.write();
        table.plain.clear();
        table.sni.clear();
        for vc in clusters {
            match &vc.sni_hostname {
                Some(host) => {
                    table
                        .sni
                        .insert((vc.listener_port, host.clone()), vc.clone());
                }
                None => {
                    table.plain.insert(vc.listener_port, vc.clone());
                }
            }
        }
        let names: std::collections::HashSet<&str> =
            clusters.iter().map(|vc| vc.name.as_str()).collect();
        table
            .brokers
            .retain(|_, (vc, _)| names.contains(vc.name.as_str()));
    }

    /// Resolve a downstream connection to a binding.
    pub fn resolve(&self, endpoint: Endpoint, sni: Option<&str>) -> Result<VirtualClusterBinding> {
        let table = self.table.read();

        if let Some(host) = sni {
            if let Some((vc, target)) = table.brokers.get(&(endpoint.port, host.to_string())) {
                return Ok(VirtualClusterBinding {
                    virtual_cluster: vc.clone(),
                    upstream_target: target.clone(),
                    restrict_upstream_to_metadata_discovery: false,
                });
            }
            if let Some(vc) = table.sni.get(&(endpoint.port, host.to_string())) {
                return Ok(bootstrap_binding(vc));
            }
        }

        if let Some(vc) = table.plain.get(&endpoint.port) {
            return Ok(bootstrap_binding(vc));
        }

        Err(GateError::NoBinding(format!(
            "no virtual cluster for port {} (sni: {})",
            endpoint.port,
            sni.unwrap_or("<none>")
        )))
    }

    /// Record the upstream address of a broker so clients reconnecting to
    /// its advertised SNI name are routed to it directly.
    pub fn register_broker(&self, vc: &Arc<VirtualCluster>, node_id: i32, upstream: HostPort) {
        if !matches!(vc.broker_addresses, BrokerAddressRules::SniPattern { .. }) {
            return;
        }
        let advertised = vc.advertised_broker_address(node_id);
        let mut table = self.table.write();
        table.brokers.insert(
            (vc.listener_port, advertised.host),
            (vc.clone(), upstream),
        );
    }
}

fn bootstrap_binding(vc: &Arc<VirtualCluster>) -> VirtualClusterBinding {
    VirtualClusterBinding {
        virtual_cluster: vc.clone(),
        upstream_target: vc.upstream_bootstrap.clone(),
        restrict_upstream_to_metadata_discovery: matches!(
            vc.broker_addresses,
            BrokerAddressRules::SniPattern { .. }
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ListenerConfig, VirtualClusterConfig};

    fn cluster(name: &str, port: u16, sni: Option<&str>) -> Arc<VirtualCluster> {
        let config = VirtualClusterConfig {
            name: name.to_string(),
            upstream_bootstrap: HostPort::new(format!("{name}.internal"), 9092),
            listener: ListenerConfig {
                bind_addr: format!("0.0.0.0:{port}"),
                sni_hostname: sni.map(|s| s.to_string()),
                advertised_host: None,
            },
            downstream_tls: None,
            upstream_tls: None,
            log_network: false,
            log_frames: false,
            broker_addresses: BrokerAddressRules::Single,
            sasl: None,
        };
        VirtualCluster::from_config(&config).unwrap()
    }

    fn sni_cluster(name: &str, port: u16, host: &str) -> Arc<VirtualCluster> {
        let mut vc =
            Arc::try_unwrap(cluster(name, port, Some(host))).expect("unshared test cluster");
        vc.broker_addresses = BrokerAddressRules::SniPattern {
            pattern: format!("broker-$(nodeId).{host}"),
        };
        Arc::new(vc)
    }

    #[test]
    fn test_plain_port_resolution() {
        let vc = cluster("demo", 19092, None);
        let resolver = BindingResolver::from_clusters(&[vc.clone()]);
        let binding = resolver
            .resolve(
                Endpoint {
                    port: 19092,
                    tls: false,
                },
                None,
            )
            .unwrap();
        assert_eq!(binding.virtual_cluster.name, "demo");
        assert_eq!(binding.upstream_target, vc.upstream_bootstrap);
        assert!(!binding.restrict_upstream_to_metadata_discovery);
    }

    #[test]
    fn test_unknown_endpoint_is_rejected() {
        let resolver = BindingResolver::from_clusters(&[cluster("demo", 19092, None)]);
        let err = resolver
            .resolve(
                Endpoint {
                    port: 29092,
                    tls: false,
                },
                None,
            )
            .unwrap_err();
        assert!(matches!(err, GateError::NoBinding(_)));
    }

    #[test]
    fn test_sni_resolution_by_hostname() {
        let a = cluster("a", 19092, Some("a.example.com"));
        let b = cluster("b", 19092, Some("b.example.com"));
        let resolver = BindingResolver::from_clusters(&[a, b]);
        let endpoint = Endpoint {
            port: 19092,
            tls: true,
        };
        let binding = resolver.resolve(endpoint, Some("b.example.com")).unwrap();
        assert_eq!(binding.virtual_cluster.name, "b");
        assert!(resolver.resolve(endpoint, Some("unknown.example")).is_err());
        assert!(resolver.resolve(endpoint, None).is_err());
    }

    #[test]
    fn test_broker_binding_registration() {
        let vc = sni_cluster("demo", 19092, "demo.example.com");
        let resolver = BindingResolver::from_clusters(&[vc.clone()]);
        let endpoint = Endpoint {
            port: 19092,
            tls: true,
        };

        // Bootstrap binding restricts to metadata discovery in SNI mode
        let bootstrap = resolver.resolve(endpoint, Some("demo.example.com")).unwrap();
        assert!(bootstrap.restrict_upstream_to_metadata_discovery);

        resolver.register_broker(&vc, 1, HostPort::new("kafka-1.internal", 9092));
        let broker = resolver
            .resolve(endpoint, Some("broker-1.demo.example.com"))
            .unwrap();
        assert_eq!(
            broker.upstream_target,
            HostPort::new("kafka-1.internal", 9092)
        );
        assert!(!broker.restrict_upstream_to_metadata_discovery);
    }

    #[test]
    fn test_rebuild_discards_stale_broker_bindings() {
        let vc = sni_cluster("demo", 19092, "demo.example.com");
        let resolver = BindingResolver::from_clusters(&[vc.clone()]);
        resolver.register_broker(&vc, 1, HostPort::new("kafka-1.internal", 9092));

        let replacement = sni_cluster("other", 19092, "other.example.com");
        resolver.rebuild(&[replacement]);
        let endpoint = Endpoint {
            port: 19092,
            tls: true,
        };
        assert!(resolver
            .resolve(endpoint, Some("broker-1.demo.example.com"))
            .is_err());
    }
}
