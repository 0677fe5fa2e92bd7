//! Upstream connection handling
//!
//! The backend owns the socket towards the upstream broker. Correlation
//! ids are rewritten on the way up: the proxy issues its own monotone ids
//! so filters may inject requests later without colliding with
//! client-chosen ids, and maps responses back to the downstream id and
//! arrival sequence.

use bytes::Bytes;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use super::orderer::InFlightPermit;
use crate::codec::{self, RequestFrame};
use crate::error::{GateError, Result};
use crate::metrics;
use crate::net::VirtualClusterBinding;

/// Bookkeeping for one request awaiting its upstream response
pub struct InFlightContext {
    pub downstream_correlation_id: i32,
    pub seq: u64,
    pub api_key: i16,
    pub api_version: i16,
    pub arrived: Instant,
    /// Held until the response is submitted so the in-flight window stays
    /// accurate
    pub permit: InFlightPermit,
}

/// The write half of the upstream connection plus the correlation map
pub struct UpstreamSession {
    writer: Box<dyn AsyncWrite + Send + Sync + Unpin>,
    in_flight: HashMap<i32, InFlightContext>,
    next_correlation_id: i32,
    reader_handle: tokio::task::JoinHandle<()>,
}

impl UpstreamSession {
    /// Connect to the binding's upstream target, wrapping in TLS when the
    /// virtual cluster configures it. Returns the session and the channel
    /// upstream response frames arrive on; the channel closing means the
    /// upstream hung up.
    pub async fn connect(
        binding: &VirtualClusterBinding,
        connect_timeout: Duration,
        max_frame_bytes: u64,
        response_buffer: usize,
    ) -> Result<(Self, mpsc::Receiver<Bytes>)> {
        let target = &binding.upstream_target;
        let stream = tokio::time::timeout(
            connect_timeout,
            TcpStream::connect((target.host.as_str(), target.port)),
        )
        .await
        .map_err(|_| GateError::Upstream(format!("connect to {target} timed out")))?
        .map_err(|e| GateError::Upstream(format!("connect to {target} failed: {e}")))?;
        stream.set_nodelay(true).ok();
        metrics::record_upstream_connect();

        let vc = &binding.virtual_cluster;
        debug!(
            cluster = %vc.name,
            %target,
            tls = vc.upstream_tls.is_some(),
            restrict_to_metadata_discovery = binding.restrict_upstream_to_metadata_discovery,
            "connected upstream"
        );

        let (session, response_rx) = match &vc.upstream_tls {
            Some(tls_config) => {
                let server_name = rustls::pki_types::ServerName::try_from(target.host.clone())
                    .map_err(|e| {
                        GateError::Tls(format!("invalid upstream server name {}: {e}", target.host))
                    })?;
                let tls_stream = TlsConnector::from(tls_config.clone())
                    .connect(server_name, stream)
                    .await
                    .map_err(|e| GateError::Tls(format!("upstream TLS handshake failed: {e}")))?;
                Self::from_stream(tls_stream, max_frame_bytes, response_buffer)
            }
            None => Self::from_stream(stream, max_frame_bytes, response_buffer),
        };
        Ok((session, response_rx))
    }

    fn from_stream<S>(
        stream: S,
        max_frame_bytes: u64,
        response_buffer: usize,
    ) -> (Self, mpsc::Receiver<Bytes>)
    where
        S: tokio::io::AsyncRead + AsyncWrite + Send + Sync + Unpin + 'static,
    {
        let (mut reader, writer) = tokio::io::split(stream);
        // Bounded: when the connection's driver falls behind, upstream
        // reads pause instead of buffering without limit.
        let (tx, rx) = mpsc::channel(response_buffer.max(1));
        let reader_handle = tokio::spawn(async move {
            loop {
                match codec::read_frame(&mut reader, max_frame_bytes).await {
                    Ok(Some(frame)) => {
                        if tx.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "upstream read failed");
                        break;
                    }
                }
            }
        });
        (
            Self {
                writer: Box::new(writer),
                in_flight: HashMap::new(),
                next_correlation_id: 0,
                reader_handle,
            },
            rx,
        )
    }

    /// Send a request upstream under a proxy-issued correlation id.
    pub async fn send(&mut self, frame: &RequestFrame, context: InFlightContext) -> Result<()> {
        let upstream_correlation_id = self.next_correlation_id;
        self.next_correlation_id = self.next_correlation_id.wrapping_add(1);

        let wire = frame.to_wire(upstream_correlation_id)?;
        self.in_flight.insert(upstream_correlation_id, context);

        self.writer
            .write_all(&(wire.len() as u32).to_be_bytes())
            .await?;
        self.writer.write_all(&wire).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Claim the in-flight context for an upstream response
    pub fn take_in_flight(&mut self, upstream_correlation_id: i32) -> Option<InFlightContext> {
        self.in_flight.remove(&upstream_correlation_id)
    }

    /// Number of requests currently awaiting an upstream response
    pub fn pending(&self) -> usize {
        self.in_flight.len()
    }
}

impl Drop for UpstreamSession {
    fn drop(&mut self) {
        // Orphan the reader; pending in-flight contexts drop with the map,
        // releasing their permits.
        self.reader_handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::RequestPayload;
    use crate::proxy::orderer::ResponseOrderer;
    use kafka_protocol::messages::RequestHeader;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn opaque_frame(correlation_id: i32) -> RequestFrame {
        let mut body = vec![0u8, 3, 0, 9]; // Metadata v9
        body.extend_from_slice(&correlation_id.to_be_bytes());
        body.extend_from_slice(&[0, 0]); // empty client id, no tag section
        RequestFrame {
            api_key: 3,
            api_version: 9,
            header: RequestHeader::default()
                .with_request_api_key(3)
                .with_request_api_version(9)
                .with_correlation_id(correlation_id),
            payload: RequestPayload::Opaque(Bytes::from(body)),
        }
    }

    async fn test_binding(port: u16) -> VirtualClusterBinding {
        use crate::config::{HostPort, ListenerConfig, VirtualClusterConfig};
        use crate::net::VirtualCluster;
        let config = VirtualClusterConfig {
            name: "test".to_string(),
            upstream_bootstrap: HostPort::new("127.0.0.1", port),
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
        };
        VirtualClusterBinding {
            virtual_cluster: VirtualCluster::from_config(&config).unwrap(),
            upstream_target: HostPort::new("127.0.0.1", port),
            restrict_upstream_to_metadata_discovery: false,
        }
    }

    #[tokio::test]
    async fn test_send_rewrites_correlation_ids_monotonically() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accept = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            for _ in 0..2 {
                let mut len_buf = [0u8; 4];
                socket.read_exact(&mut len_buf).await.unwrap();
                let mut frame = vec![0u8; u32::from_be_bytes(len_buf) as usize];
                socket.read_exact(&mut frame).await.unwrap();
                received.push(i32::from_be_bytes([frame[4], frame[5], frame[6], frame[7]]));
            }
            received
        });

        let binding = test_binding(port).await;
        let (mut session, _rx) =
            UpstreamSession::connect(&binding, Duration::from_secs(1), 1024 * 1024, 4)
                .await
                .unwrap();

        let (orderer, _responses) = ResponseOrderer::new(4);
        for (seq, downstream_corr) in [(0u64, 900), (1u64, 17)] {
            let (permit, _) = orderer.acquire().await.unwrap();
            session
                .send(
                    &opaque_frame(downstream_corr),
                    InFlightContext {
                        downstream_correlation_id: downstream_corr,
                        seq,
                        api_key: 3,
                        api_version: 9,
                        arrived: Instant::now(),
                        permit,
                    },
                )
                .await
                .unwrap();
        }

        // Upstream sees proxy-issued ids 0, 1 regardless of client ids
        assert_eq!(accept.await.unwrap(), vec![0, 1]);
        assert_eq!(session.pending(), 2);
        let ctx = session.take_in_flight(0).unwrap();
        assert_eq!(ctx.downstream_correlation_id, 900);
        assert!(session.take_in_flight(0).is_none());
    }

    #[tokio::test]
    async fn test_connect_failure_is_upstream_error() {
        // Port 1 is essentially never listening
        let binding = test_binding(1).await;
        let result =
            UpstreamSession::connect(&binding, Duration::from_millis(500), 1024, 4).await;
        assert!(matches!(result, Err(GateError::Upstream(_))));
    }
}
