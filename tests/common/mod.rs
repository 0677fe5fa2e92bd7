//! Shared helpers for integration tests: a fake upstream broker speaking
//! just enough Kafka framing, a proxy harness, and raw-frame client IO.

#![allow(dead_code)]

use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use streamgate::config::{
    BrokerAddressRules, HostPort, ListenerConfig, SaslConfig, VirtualClusterConfig,
};
use streamgate::filter::{FilterChain, FilterDecl};
use streamgate::net::{BindingResolver, Endpoint, VirtualCluster, VirtualClusterBinding};
use streamgate::proxy::{run_connection, FrontendParams};

pub const MAX_FRAME: u64 = 16 * 1024 * 1024;

/// Read one length-prefixed frame; None on EOF.
pub async fn read_frame(stream: &mut TcpStream) -> Option<Bytes> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await.ok()?;
    let mut frame = vec![0u8; u32::from_be_bytes(len_buf) as usize];
    stream.read_exact(&mut frame).await.ok()?;
    Some(Bytes::from(frame))
}

/// Write one length-prefixed frame.
pub async fn write_frame(stream: &mut TcpStream, frame: &[u8]) {
    stream
        .write_all(&(frame.len() as u32).to_be_bytes())
        .await
        .unwrap();
    stream.write_all(frame).await.unwrap();
    stream.flush().await.unwrap();
}

/// A request frame for an API the proxy relays opaquely (Heartbeat v0),
/// with an arbitrary payload after the header.
pub fn opaque_request(correlation_id: i32, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::new();
    frame.extend_from_slice(&12i16.to_be_bytes()); // Heartbeat
    frame.extend_from_slice(&0i16.to_be_bytes()); // v0
    frame.extend_from_slice(&correlation_id.to_be_bytes());
    frame.extend_from_slice(&(-1i16).to_be_bytes()); // null client id
    frame.extend_from_slice(payload);
    frame
}

/// The correlation id of a raw request frame.
pub fn request_correlation_id(frame: &[u8]) -> i32 {
    i32::from_be_bytes([frame[4], frame[5], frame[6], frame[7]])
}

/// The correlation id of a raw response frame.
pub fn response_correlation_id(frame: &[u8]) -> i32 {
    i32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]])
}

/// Start a proxy for one plaintext virtual cluster targeting `upstream`,
/// with the given filter declarations per connection. Returns the proxy's
/// listen port.
pub async fn spawn_proxy<F>(upstream: HostPort, sasl: Option<SaslConfig>, decls: F) -> u16
where
    F: Fn() -> Vec<FilterDecl> + Send + Sync + 'static,
{
    let config = VirtualClusterConfig {
        name: "test".to_string(),
        upstream_bootstrap: upstream.clone(),
        listener: ListenerConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            sni_hostname: None,
            advertised_host: Some("proxy.test".to_string()),
        },
        downstream_tls: None,
        upstream_tls: None,
        log_network: false,
        log_frames: false,
        broker_addresses: BrokerAddressRules::Single,
        sasl,
    };
    let vc = VirtualCluster::from_config(&config).unwrap();
    let resolver = Arc::new(BindingResolver::from_clusters(&[vc.clone()]));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let params = FrontendParams {
        max_frame_bytes: MAX_FRAME,
        max_in_flight: 10,
        idle_timeout: None,
        connect_timeout: Duration::from_secs(2),
    };

    tokio::spawn(async move {
        loop {
            let Ok((stream, peer_addr)) = listener.accept().await else {
                break;
            };
            let binding = VirtualClusterBinding {
                virtual_cluster: vc.clone(),
                upstream_target: upstream.clone(),
                restrict_upstream_to_metadata_discovery: false,
            };
            let chain = FilterChain::build(decls()).unwrap();
            let resolver = resolver.clone();
            let params = params.clone();
            tokio::spawn(async move {
                let _ = run_connection(
                    stream,
                    Some(peer_addr),
                    binding,
                    resolver,
                    Endpoint { port, tls: false },
                    chain,
                    params,
                )
                .await;
            });
        }
    });
    port
}

/// Encode a response frame body (header already included in `body`).
pub fn response_frame(correlation_id: i32, body: &[u8]) -> Vec<u8> {
    let mut frame = Vec::new();
    frame.extend_from_slice(&correlation_id.to_be_bytes());
    frame.extend_from_slice(body);
    frame
}

/// Build a v2 record batch with the given (offset, value) records.
pub fn record_batch(records: &[(i64, &[u8])]) -> Bytes {
    use kafka_protocol::records::{
        Compression, Record, RecordBatchEncoder, RecordEncodeOptions, TimestampType,
    };

    let records: Vec<Record> = records
        .iter()
        .map(|(offset, value)| Record {
            transactional: false,
            control: false,
            partition_leader_epoch: 0,
            producer_id: -1,
            producer_epoch: -1,
            timestamp_type: TimestampType::Creation,
            offset: *offset,
            sequence: -1,
            timestamp: 1_700_000_000_000,
            key: None,
            value: Some(Bytes::copy_from_slice(value)),
            headers: Default::default(),
        })
        .collect();

    let mut buf = BytesMut::new();
    let options = RecordEncodeOptions {
        version: 2,
        compression: Compression::None,
    };
    RecordBatchEncoder::encode::<
        _,
        _,
        fn(&mut BytesMut, &mut BytesMut, Compression) -> anyhow::Result<()>,
    >(&mut buf, records.iter(), &options, None)
    .unwrap();
    buf.freeze()
}

/// Decode every record of a record batch.
pub fn decode_record_batch(batch: &Bytes) -> Vec<kafka_protocol::records::Record> {
    use kafka_protocol::records::{Compression, RecordBatchDecoder};
    type DecompressFn = fn(&mut Bytes, Compression) -> anyhow::Result<Bytes>;
    let mut buf = batch.clone();
    RecordBatchDecoder::decode::<Bytes, DecompressFn>(&mut buf, None)
        .unwrap()
}
