//! The proxy server: listeners, connection acceptance and dispatch
//!
//! Each configured bind address gets one TCP listener. Plaintext listeners
//! resolve their virtual cluster from the port alone on accept; TLS
//! listeners resolve inside the handshake from the SNI host name, so a
//! single port can front many virtual clusters.

mod backend;
mod frontend;
mod orderer;
mod sasl;

pub use backend::UpstreamSession;
pub use frontend::{run_connection, FrontendParams};
pub use orderer::{PendingResponse, ResponseOrderer};
pub use sasl::SaslGate;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::LazyConfigAcceptor;
use tracing::{debug, error, info, warn};

use crate::config::ProxyConfig;
use crate::error::{GateError, Result};
use crate::filter::{
    ApiVersionsFilter, BrokerAddressFilter, FilterChain, FilterDecl, FilterInstanceFactory,
    FilterRegistry,
};
use crate::net::{BindingResolver, Endpoint, VirtualCluster, VirtualClusterBinding};

/// The proxy server
pub struct ProxyServer {
    config: ProxyConfig,
    clusters: Vec<Arc<VirtualCluster>>,
    shared: Arc<Shared>,
}

/// State shared by every listener and connection
struct Shared {
    resolver: Arc<BindingResolver>,
    instance_factories: Vec<Arc<dyn FilterInstanceFactory>>,
    params: FrontendParams,
}

impl Shared {
    /// Assemble the per-connection filter chain: the ApiVersions filter
    /// first, configured filters in order, the broker-address filter last.
    fn build_chain(&self) -> Result<FilterChain> {
        let mut decls: Vec<FilterDecl> = vec![ApiVersionsFilter::decl()];
        decls.extend(self.instance_factories.iter().map(|f| f.create()));
        decls.push(BrokerAddressFilter::decl());
        FilterChain::build(decls)
    }
}

impl ProxyServer {
    /// Build the server from configuration. All process-fatal validation
    /// happens here: config invariants, TLS material, filter
    /// configurations and the filter capability shapes.
    pub fn new(config: ProxyConfig, registry: &FilterRegistry) -> Result<Self> {
        config.validate()?;

        let clusters = config
            .virtual_clusters
            .iter()
            .map(VirtualCluster::from_config)
            .collect::<Result<Vec<_>>>()?;
        let resolver = Arc::new(BindingResolver::from_clusters(&clusters));
        let instance_factories = registry.build_instance_factories(&config.filters)?;

        let params = FrontendParams {
            max_frame_bytes: config.effective_max_frame_bytes(),
            max_in_flight: config.proxy.max_in_flight,
            idle_timeout: match config.proxy.idle_timeout_ms {
                0 => None,
                ms => Some(Duration::from_millis(ms)),
            },
            connect_timeout: Duration::from_millis(config.proxy.connect_timeout_ms),
        };

        let shared = Arc::new(Shared {
            resolver,
            instance_factories,
            params,
        });

        // Compile one chain now so an invalid filter capability mix aborts
        // startup rather than the first connection.
        shared.build_chain()?;

        Ok(Self {
            config,
            clusters,
            shared,
        })
    }

    /// The binding resolver, exposed for reconfiguration
    pub fn resolver(&self) -> Arc<BindingResolver> {
        self.shared.resolver.clone()
    }

    /// Bind all listeners and serve until interrupted.
    pub async fn run(self) -> Result<()> {
        // Group virtual clusters by bind address; config validation has
        // already ensured shared addresses are SNI-routed.
        let mut by_addr: HashMap<String, Vec<Arc<VirtualCluster>>> = HashMap::new();
        for (vc_config, vc) in self.config.virtual_clusters.iter().zip(&self.clusters) {
            by_addr
                .entry(vc_config.listener.bind_addr.clone())
                .or_default()
                .push(vc.clone());
        }

        let mut listener_handles = Vec::new();
        for (bind_addr, clusters) in by_addr {
            let tls = clusters.iter().any(|vc| vc.downstream_is_tls());
            let listener = TcpListener::bind(&bind_addr).await.map_err(|e| {
                if e.kind() == std::io::ErrorKind::AddrInUse {
                    GateError::Config(format!(
                        "listener address {bind_addr} is already in use; \
                         another proxy or broker may be running"
                    ))
                } else {
                    GateError::Io(e)
                }
            })?;
            let port = listener.local_addr()?.port();
            info!(
                addr = %bind_addr,
                tls,
                clusters = ?clusters.iter().map(|vc| vc.name.as_str()).collect::<Vec<_>>(),
                "listener started"
            );
            let shared = self.shared.clone();
            listener_handles.push(tokio::spawn(run_listener(listener, port, tls, shared)));
        }

        tokio::signal::ctrl_c()
            .await
            .map_err(|e| GateError::Io(e))?;
        info!("shutdown signal received, stopping listeners");
        for handle in &listener_handles {
            handle.abort();
        }
        Ok(())
    }
}

async fn run_listener(listener: TcpListener, port: u16, tls: bool, shared: Arc<Shared>) {
    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(port, error = %e, "accept failed");
                continue;
            }
        };
        stream.set_nodelay(true).ok();
        let shared = shared.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_accepted(stream, peer_addr, port, tls, shared).await {
                debug!(peer = %peer_addr, error = %e, "connection ended with error");
            }
        });
    }
}

async fn handle_accepted(
    stream: TcpStream,
    peer_addr: std::net::SocketAddr,
    port: u16,
    tls: bool,
    shared: Arc<Shared>,
) -> Result<()> {
    let endpoint = Endpoint { port, tls };

    if !tls {
        let binding = match shared.resolver.resolve(endpoint, None) {
            Ok(binding) => binding,
            Err(e) => {
                warn!(peer = %peer_addr, port, error = %e, "no binding, closing");
                return Ok(());
            }
        };
        return serve(stream, peer_addr, endpoint, binding, shared).await;
    }

    // TLS: the SNI host name picks the virtual cluster, and with it the
    // certificate presented. Resolution failure closes the connection
    // during the handshake with no application bytes written.
    let acceptor = LazyConfigAcceptor::new(rustls::server::Acceptor::default(), stream);
    let start = acceptor
        .await
        .map_err(|e| GateError::Tls(format!("TLS accept failed: {e}")))?;
    let sni = start
        .client_hello()
        .server_name()
        .map(|name| name.to_string());

    let binding = match shared.resolver.resolve(endpoint, sni.as_deref()) {
        Ok(binding) => binding,
        Err(e) => {
            warn!(
                peer = %peer_addr,
                port,
                sni = sni.as_deref().unwrap_or("<none>"),
                error = %e,
                "no binding, rejecting handshake"
            );
            return Ok(());
        }
    };
    let Some(tls_config) = binding.virtual_cluster.downstream_tls.clone() else {
        error!(
            cluster = %binding.virtual_cluster.name,
            "virtual cluster on a TLS listener provides no TLS material, closing"
        );
        return Ok(());
    };

    let tls_stream = start
        .into_stream(tls_config)
        .await
        .map_err(|e| GateError::Tls(format!("TLS handshake failed: {e}")))?;
    serve(tls_stream, peer_addr, endpoint, binding, shared).await
}

async fn serve<S>(
    stream: S,
    peer_addr: std::net::SocketAddr,
    endpoint: Endpoint,
    binding: VirtualClusterBinding,
    shared: Arc<Shared>,
) -> Result<()>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + 'static,
{
    let chain = shared.build_chain()?;
    run_connection(
        stream,
        Some(peer_addr),
        binding,
        shared.resolver.clone(),
        endpoint,
        chain,
        shared.params.clone(),
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ListenerConfig, VirtualClusterConfig};

    fn minimal_proxy_config() -> ProxyConfig {
        ProxyConfig {
            virtual_clusters: vec![VirtualClusterConfig {
                name: "demo".to_string(),
                upstream_bootstrap: crate::config::HostPort::new("127.0.0.1", 9092),
                listener: ListenerConfig {
                    bind_addr: "127.0.0.1:0".to_string(),
                    sni_hostname: None,
                    advertised_host: None,
                },
                downstream_tls: None,
                upstream_tls: None,
                log_network: false,
                log_frames: false,
                broker_addresses: crate::config::BrokerAddressRules::Single,
                sasl: None,
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_server_builds_from_minimal_config() {
        let registry = FilterRegistry::new();
        let server = ProxyServer::new(minimal_proxy_config(), &registry).unwrap();
        assert_eq!(server.clusters.len(), 1);
    }

    #[test]
    fn test_unknown_filter_fails_startup() {
        let mut config = minimal_proxy_config();
        config.filters.push(crate::config::FilterDefinition {
            filter_type: "missing".to_string(),
            config: toml::Value::Table(Default::default()),
        });
        let registry = FilterRegistry::new();
        assert!(ProxyServer::new(config, &registry).is_err());
    }

    #[test]
    fn test_built_in_chain_compiles() {
        let registry = FilterRegistry::new();
        let server = ProxyServer::new(minimal_proxy_config(), &registry).unwrap();
        let chain = server.shared.build_chain().unwrap();
        // ApiVersions (request+response) and broker address (response)
        assert_eq!(chain.len(), 2);
        assert!(chain.wants_request_decode(18));
        assert!(chain.wants_response_decode(3));
    }
}
