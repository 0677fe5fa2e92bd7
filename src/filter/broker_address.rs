//! Broker address rewriting
//!
//! Kafka clients learn broker addresses from Metadata and FindCoordinator
//! responses and connect to them directly, which would bypass the proxy.
//! This filter rewrites every advertised address to the virtual cluster's
//! rules and registers the learned upstream addresses with the resolver so
//! reconnecting clients are routed to the right broker.

use async_trait::async_trait;
use kafka_protocol::protocol::StrBytes;
use tracing::debug;

use super::{FilterContext, FilterDecl, ResponseFilter, ResponseOutcome, SpecificBinding};
use crate::codec::{DecodedResponse, ResponseFrame};
use crate::config::HostPort;
use crate::error::Result;

/// Rewrites advertised broker addresses in Metadata and FindCoordinator
/// responses.
pub struct BrokerAddressFilter;

impl BrokerAddressFilter {
    /// The declaration to install this filter into a chain
    pub fn decl() -> FilterDecl {
        use kafka_protocol::messages::ApiKey;
        FilterDecl::specific(
            "brokerAddress",
            vec![SpecificBinding {
                request_keys: vec![],
                response_keys: vec![ApiKey::MetadataKey, ApiKey::FindCoordinatorKey],
                request: None,
                response: Some(Box::new(BrokerAddressFilter)),
            }],
        )
    }
}

#[async_trait]
impl ResponseFilter for BrokerAddressFilter {
    async fn on_response(
        &mut self,
        ctx: &FilterContext,
        mut frame: ResponseFrame,
    ) -> Result<ResponseOutcome> {
        match frame.decoded_mut() {
            Some(DecodedResponse::Metadata(response)) => {
                for broker in response.brokers.iter_mut() {
                    let node_id = broker.node_id.0;
                    let upstream = HostPort::new(broker.host.to_string(), broker.port as u16);
                    ctx.resolver
                        .register_broker(&ctx.virtual_cluster, node_id, upstream.clone());
                    let advertised = ctx.virtual_cluster.advertised_broker_address(node_id);
                    debug!(
                        cluster = %ctx.virtual_cluster.name,
                        node_id,
                        %upstream,
                        %advertised,
                        "rewriting advertised broker address"
                    );
                    broker.host = StrBytes::from_string(advertised.host);
                    broker.port = advertised.port as i32;
                }
            }
            Some(DecodedResponse::FindCoordinator(response)) => {
                // v0-v3 carry a single coordinator in top-level fields
                if response.node_id.0 >= 0 && !response.host.is_empty() {
                    let node_id = response.node_id.0;
                    let upstream = HostPort::new(response.host.to_string(), response.port as u16);
                    ctx.resolver
                        .register_broker(&ctx.virtual_cluster, node_id, upstream);
                    let advertised = ctx.virtual_cluster.advertised_broker_address(node_id);
                    response.host = StrBytes::from_string(advertised.host);
                    response.port = advertised.port as i32;
                }
                // v4+ carry a coordinators array
                for coordinator in response.coordinators.iter_mut() {
                    let node_id = coordinator.node_id.0;
                    if node_id < 0 {
                        continue;
                    }
                    let upstream =
                        HostPort::new(coordinator.host.to_string(), coordinator.port as u16);
                    ctx.resolver
                        .register_broker(&ctx.virtual_cluster, node_id, upstream);
                    let advertised = ctx.virtual_cluster.advertised_broker_address(node_id);
                    coordinator.host = StrBytes::from_string(advertised.host);
                    coordinator.port = advertised.port as i32;
                }
            }
            _ => {}
        }
        Ok(ResponseOutcome::Forward(frame))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BrokerAddressRules, ListenerConfig, VirtualClusterConfig};
    use crate::net::{BindingResolver, Endpoint, VirtualCluster};
    use kafka_protocol::messages::metadata_response::MetadataResponseBroker;
    use kafka_protocol::messages::{ApiKey, BrokerId, MetadataResponse};
    use std::sync::Arc;

    fn sni_context() -> FilterContext {
        let config = VirtualClusterConfig {
            name: "demo".to_string(),
            upstream_bootstrap: HostPort::new("kafka.internal", 9092),
            listener: ListenerConfig {
                bind_addr: "0.0.0.0:19092".to_string(),
                sni_hostname: Some("demo.example.com".to_string()),
                advertised_host: None,
            },
            downstream_tls: None,
            upstream_tls: None,
            log_network: false,
            log_frames: false,
            broker_addresses: BrokerAddressRules::SniPattern {
                pattern: "broker-$(nodeId).demo.example.com".to_string(),
            },
            sasl: None,
        };
        let vc = VirtualCluster::from_config(&config).unwrap();
        let resolver = Arc::new(BindingResolver::from_clusters(&[vc.clone()]));
        FilterContext {
            virtual_cluster: vc,
            resolver,
            endpoint: Endpoint {
                port: 19092,
                tls: true,
            },
            peer_addr: None,
        }
    }

    fn metadata_frame(brokers: Vec<(i32, &str, i32)>) -> ResponseFrame {
        let brokers = brokers
            .into_iter()
            .map(|(node_id, host, port)| {
                MetadataResponseBroker::default()
                    .with_node_id(BrokerId(node_id))
                    .with_host(StrBytes::from_string(host.to_string()))
                    .with_port(port)
            })
            .collect();
        let response = MetadataResponse::default().with_brokers(brokers);
        ResponseFrame::decoded(
            ApiKey::MetadataKey as i16,
            9,
            1,
            DecodedResponse::Metadata(response),
        )
    }

    #[tokio::test]
    async fn test_metadata_brokers_are_rewritten_and_registered() {
        let ctx = sni_context();
        let mut filter = BrokerAddressFilter;
        let frame = metadata_frame(vec![(0, "kafka-0.internal", 9092), (1, "kafka-1.internal", 9092)]);

        let outcome = filter.on_response(&ctx, frame).await.unwrap();
        let ResponseOutcome::Forward(frame) = outcome else {
            panic!("expected forward");
        };
        let Some(DecodedResponse::Metadata(response)) = frame.decoded_ref() else {
            panic!("expected metadata body");
        };
        assert_eq!(
            response.brokers[0].host.to_string(),
            "broker-0.demo.example.com"
        );
        assert_eq!(response.brokers[0].port, 19092);
        assert_eq!(
            response.brokers[1].host.to_string(),
            "broker-1.demo.example.com"
        );

        // The learned upstream addresses are now resolvable
        let binding = ctx
            .resolver
            .resolve(ctx.endpoint, Some("broker-1.demo.example.com"))
            .unwrap();
        assert_eq!(
            binding.upstream_target,
            HostPort::new("kafka-1.internal", 9092)
        );
    }
}
