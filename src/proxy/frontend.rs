//! Downstream connection state machine
//!
//! One task drives each downstream connection: it reads client frames,
//! runs the request filter chain, connects upstream on the first forwarded
//! request and feeds upstream responses back through the chain in reverse.
//! A separate writer task drains the response orderer so slow clients
//! exert back-pressure through the bounded in-flight window rather than
//! unbounded buffering.
//!
//! States per connection:
//!
//! ```text
//! AwaitingFirstFrame -> (AuthGating) -> Ready -> ConnectingUpstream
//!     -> Relaying -> Closing
//! ```

use bytes::Bytes;
use kafka_protocol::messages::ApiKey;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::backend::{InFlightContext, UpstreamSession};
use super::orderer::{InFlightPermit, PendingResponse, ResponseOrderer};
use super::sasl::SaslGate;
use crate::codec::{
    self, api_key_name, supported_version_range, DecodedRequest, DecodedResponse, ResponseFrame,
};
use crate::error::{GateError, Result};
use crate::filter::{FilterChain, FilterContext, FilterOutcome, ResponseOutcome};
use crate::metrics;
use crate::net::{BindingResolver, Endpoint, VirtualClusterBinding};

/// Connection-level tunables, resolved from configuration once
#[derive(Debug, Clone)]
pub struct FrontendParams {
    pub max_frame_bytes: u64,
    pub max_in_flight: usize,
    pub idle_timeout: Option<Duration>,
    pub connect_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionState {
    AwaitingFirstFrame,
    AuthGating,
    Ready,
    ConnectingUpstream,
    Relaying,
    Closing,
}

enum Flow {
    Continue,
    Close,
}

enum Event {
    Downstream(Option<Bytes>),
    Upstream(Option<Bytes>),
    IdleTimeout,
}

/// Run one downstream connection to completion.
pub async fn run_connection<S>(
    stream: S,
    peer_addr: Option<SocketAddr>,
    binding: VirtualClusterBinding,
    resolver: Arc<BindingResolver>,
    endpoint: Endpoint,
    chain: FilterChain,
    params: FrontendParams,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let vc = binding.virtual_cluster.clone();
    metrics::record_connection_active(1);
    if vc.log_network {
        info!(
            target: "streamgate::network",
            cluster = %vc.name,
            peer = ?peer_addr,
            "connection opened"
        );
    }

    let result = drive(stream, peer_addr, binding, resolver, endpoint, chain, params).await;

    metrics::record_connection_active(-1);
    if vc.log_network {
        info!(
            target: "streamgate::network",
            cluster = %vc.name,
            peer = ?peer_addr,
            error = result.as_ref().err().map(|e| e.to_string()),
            "connection closed"
        );
    }
    result
}

async fn drive<S>(
    stream: S,
    peer_addr: Option<SocketAddr>,
    binding: VirtualClusterBinding,
    resolver: Arc<BindingResolver>,
    endpoint: Endpoint,
    chain: FilterChain,
    params: FrontendParams,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, writer) = tokio::io::split(stream);
    let (orderer, response_rx) = ResponseOrderer::new(params.max_in_flight);
    let log_frames = binding.virtual_cluster.log_frames;
    let writer_handle = tokio::spawn(writer_task(writer, response_rx, peer_addr, log_frames));

    // Frames are read by their own task and handed over a small channel:
    // channel receives are cancellation-safe in the select loop below,
    // where a bare socket read would lose bytes when another event wins.
    let (downstream_tx, mut downstream_rx) = mpsc::channel::<Result<Bytes>>(4);
    let max_frame_bytes = params.max_frame_bytes;
    let reader_handle = tokio::spawn(async move {
        loop {
            match codec::read_frame(&mut reader, max_frame_bytes).await {
                Ok(Some(frame)) => {
                    if downstream_tx.send(Ok(frame)).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    let _ = downstream_tx.send(Err(e)).await;
                    break;
                }
            }
        }
    });

    let sasl = binding.virtual_cluster.sasl.as_ref().map(SaslGate::new);
    let filter_ctx = FilterContext {
        virtual_cluster: binding.virtual_cluster.clone(),
        resolver,
        endpoint,
        peer_addr,
    };
    let mut conn = Conn {
        binding,
        chain,
        filter_ctx,
        orderer: Arc::new(orderer),
        upstream: None,
        sasl,
        state: ConnectionState::AwaitingFirstFrame,
        params: params.clone(),
        peer_addr,
    };
    let mut upstream_rx: Option<mpsc::Receiver<Bytes>> = None;

    let result = loop {
        let idle_armed = conn.state == ConnectionState::Relaying && params.idle_timeout.is_some();
        let idle = params.idle_timeout.unwrap_or(Duration::from_secs(3600));

        let event = tokio::select! {
            frame = downstream_rx.recv() => match frame {
                Some(Ok(raw)) => Event::Downstream(Some(raw)),
                Some(Err(e)) => break Err(e),
                None => Event::Downstream(None),
            },
            frame = recv_or_pending(&mut upstream_rx) => Event::Upstream(frame),
            _ = tokio::time::sleep(idle), if idle_armed => Event::IdleTimeout,
        };

        match event {
            Event::Downstream(None) => {
                debug!(peer = ?conn.peer_addr, "client disconnected");
                break Ok(());
            }
            Event::Downstream(Some(raw)) => {
                match conn.handle_downstream_frame(raw, &mut upstream_rx).await {
                    Ok(Flow::Continue) => {}
                    Ok(Flow::Close) => break Ok(()),
                    Err(e) => break Err(e),
                }
            }
            Event::Upstream(None) => {
                break if conn.state == ConnectionState::Closing {
                    Ok(())
                } else {
                    Err(GateError::Upstream("upstream closed the connection".into()))
                };
            }
            Event::Upstream(Some(raw)) => match conn.handle_upstream_frame(raw).await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Close) => break Ok(()),
                Err(e) => break Err(e),
            },
            Event::IdleTimeout => {
                debug!(peer = ?conn.peer_addr, "idle timeout, closing");
                break Err(GateError::IdleTimeout);
            }
        }
    };

    // Dropping the connection drops the orderer's sender; the writer task
    // drains buffered responses, flushes and sends FIN.
    reader_handle.abort();
    drop(conn);
    drop(upstream_rx);
    let _ = writer_handle.await;
    result
}

async fn recv_or_pending(rx: &mut Option<mpsc::Receiver<Bytes>>) -> Option<Bytes> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Writer task: drains ordered responses to the socket.
async fn writer_task<W>(
    mut writer: W,
    mut response_rx: mpsc::Receiver<PendingResponse>,
    peer_addr: Option<SocketAddr>,
    log_frames: bool,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(response) = response_rx.recv().await {
        if log_frames {
            debug!(
                target: "streamgate::frames",
                peer = ?peer_addr,
                correlation_id = response.correlation_id,
                len = response.data.len(),
                "response frame"
            );
        }
        if let Err(e) = writer
            .write_all(&(response.data.len() as u32).to_be_bytes())
            .await
        {
            debug!(peer = ?peer_addr, error = %e, "failed to write response size");
            return;
        }
        if let Err(e) = writer.write_all(&response.data).await {
            debug!(peer = ?peer_addr, error = %e, "failed to write response body");
            return;
        }
        if let Err(e) = writer.flush().await {
            debug!(peer = ?peer_addr, error = %e, "failed to flush response");
            return;
        }
    }
    // Graceful close: everything buffered has been flushed
    let _ = writer.shutdown().await;
}

struct Conn {
    binding: VirtualClusterBinding,
    chain: FilterChain,
    filter_ctx: FilterContext,
    orderer: Arc<ResponseOrderer>,
    upstream: Option<UpstreamSession>,
    sasl: Option<SaslGate>,
    state: ConnectionState,
    params: FrontendParams,
    peer_addr: Option<SocketAddr>,
}

impl Conn {
    fn transition(&mut self, next: ConnectionState) {
        if self.state != next {
            debug!(peer = ?self.peer_addr, from = ?self.state, to = ?next, "connection state");
            self.state = next;
        }
    }

    fn needs_auth(&self) -> bool {
        matches!(&self.sasl, Some(gate) if !gate.is_authenticated())
    }

    /// Wait for an in-flight slot while continuing to drain upstream
    /// responses, which is what frees slots. Without this, a full window
    /// plus queued upstream responses would stall the connection.
    /// Returns `None` when a response filter asked to close.
    async fn acquire_slot(
        &mut self,
        upstream_rx: &mut Option<mpsc::Receiver<Bytes>>,
    ) -> Result<Option<(InFlightPermit, u64)>> {
        loop {
            let orderer = self.orderer.clone();
            tokio::select! {
                slot = orderer.acquire() => return slot.map(Some),
                frame = recv_or_pending(upstream_rx) => match frame {
                    Some(raw) => {
                        if let Flow::Close = self.handle_upstream_frame(raw).await? {
                            return Ok(None);
                        }
                    }
                    None => {
                        return Err(GateError::Upstream(
                            "upstream closed the connection".into(),
                        ))
                    }
                },
            }
        }
    }

    async fn handle_downstream_frame(
        &mut self,
        raw: Bytes,
        upstream_rx: &mut Option<mpsc::Receiver<Bytes>>,
    ) -> Result<Flow> {
        if raw.len() < 8 {
            return Err(GateError::protocol_msg("request frame too short"));
        }
        let api_key = i16::from_be_bytes([raw[0], raw[1]]);
        let api_version = i16::from_be_bytes([raw[2], raw[3]]);

        if self.binding.virtual_cluster.log_frames {
            debug!(
                target: "streamgate::frames",
                peer = ?self.peer_addr,
                api = api_key_name(api_key),
                api_version,
                len = raw.len(),
                "request frame"
            );
        }

        if self.state == ConnectionState::AwaitingFirstFrame {
            let next = if self.needs_auth() {
                ConnectionState::AuthGating
            } else {
                ConnectionState::Ready
            };
            self.transition(next);
        }

        // ApiVersions at a version the codec cannot decode: answer with a
        // v0-encoded UNSUPPORTED_VERSION response instead of tearing the
        // connection down.
        if api_key == ApiKey::ApiVersionsKey as i16 {
            let unsupported = supported_version_range(api_key)
                .map(|(min, max)| api_version < min || api_version > max)
                .unwrap_or(true);
            if unsupported {
                let correlation_id = codec::peek_request_correlation_id(&raw)
                    .ok_or_else(|| GateError::protocol_msg("request frame too short"))?;
                let Some((permit, seq)) = self.acquire_slot(upstream_rx).await? else {
                    return Ok(Flow::Close);
                };
                let response =
                    crate::filter::ApiVersionsFilter::unsupported_version_response(correlation_id);
                self.submit_response(seq, &response).await?;
                drop(permit);
                return Ok(Flow::Continue);
            }
        }

        if self.state == ConnectionState::AuthGating {
            return self.handle_gating_frame(raw, api_key).await;
        }

        let decode = self.chain.wants_request_decode(api_key);
        let correlation_id = codec::peek_request_correlation_id(&raw);
        let frame = codec::decode_request(raw, decode).map_err(|e| {
            warn!(
                peer = ?self.peer_addr,
                api_key,
                correlation_id,
                "malformed request frame, closing connection"
            );
            e
        })?;
        metrics::record_frame("request", decode);

        // Acquiring the in-flight slot is the back-pressure point: when the
        // window is full this await pauses the downstream read loop.
        let Some((permit, seq)) = self.acquire_slot(upstream_rx).await? else {
            return Ok(Flow::Close);
        };

        let outcome = self.chain.on_request(&self.filter_ctx, frame).await?;
        match outcome {
            FilterOutcome::ShortCircuit(response) => {
                metrics::record_short_circuit();
                self.submit_response(seq, &response).await?;
                drop(permit);
                Ok(Flow::Continue)
            }
            FilterOutcome::Drop { close_connection } => {
                self.orderer.submit_skip(seq).await;
                drop(permit);
                if close_connection {
                    self.transition(ConnectionState::Closing);
                    Ok(Flow::Close)
                } else {
                    Ok(Flow::Continue)
                }
            }
            FilterOutcome::Forward(frame) => {
                if self.upstream.is_none() {
                    self.transition(ConnectionState::ConnectingUpstream);
                    let (session, rx) = UpstreamSession::connect(
                        &self.binding,
                        self.params.connect_timeout,
                        self.params.max_frame_bytes,
                        self.params.max_in_flight * 2,
                    )
                    .await?;
                    self.upstream = Some(session);
                    *upstream_rx = Some(rx);
                }
                self.transition(ConnectionState::Relaying);

                let context = InFlightContext {
                    downstream_correlation_id: frame.correlation_id(),
                    seq,
                    api_key: frame.api_key,
                    api_version: frame.api_version,
                    arrived: Instant::now(),
                    permit,
                };
                let Some(upstream) = self.upstream.as_mut() else {
                    return Err(GateError::Upstream("upstream session missing".into()));
                };
                upstream.send(&frame, context).await?;
                Ok(Flow::Continue)
            }
        }
    }

    /// SASL gating: only ApiVersions, SaslHandshake and SaslAuthenticate
    /// may cross before authentication succeeds.
    async fn handle_gating_frame(&mut self, raw: Bytes, api_key: i16) -> Result<Flow> {
        let allowed = matches!(
            ApiKey::try_from(api_key),
            Ok(ApiKey::ApiVersionsKey | ApiKey::SaslHandshakeKey | ApiKey::SaslAuthenticateKey)
        );
        if !allowed {
            warn!(
                peer = ?self.peer_addr,
                api = api_key_name(api_key),
                "request before SASL authentication, closing"
            );
            return Err(GateError::AuthenticationFailed(
                "request before SASL authentication".to_string(),
            ));
        }

        let frame = codec::decode_request(raw, true)?;
        let (permit, seq) = self.orderer.acquire().await?;
        let correlation_id = frame.correlation_id();

        let Some(gate) = self.sasl.as_mut() else {
            return Err(GateError::protocol_msg("gating state without a SASL gate"));
        };
        let (response, flow) = match frame.decoded() {
            Some(DecodedRequest::ApiVersions(_)) => (
                ResponseFrame::decoded(
                    frame.api_key,
                    frame.api_version,
                    correlation_id,
                    DecodedResponse::ApiVersions(
                        crate::filter::ApiVersionsFilter::supported_versions_response(),
                    ),
                ),
                Flow::Continue,
            ),
            Some(DecodedRequest::SaslHandshake(request)) => (
                ResponseFrame::decoded(
                    frame.api_key,
                    frame.api_version,
                    correlation_id,
                    DecodedResponse::SaslHandshake(gate.handle_handshake(request)),
                ),
                Flow::Continue,
            ),
            Some(DecodedRequest::SaslAuthenticate(request)) => {
                let (response, authenticated) = gate.handle_authenticate(request);
                let flow = if authenticated {
                    Flow::Continue
                } else {
                    Flow::Close
                };
                (
                    ResponseFrame::decoded(
                        frame.api_key,
                        frame.api_version,
                        correlation_id,
                        DecodedResponse::SaslAuthenticate(response),
                    ),
                    flow,
                )
            }
            _ => {
                return Err(GateError::protocol_msg(
                    "undecoded frame in SASL gating state",
                ))
            }
        };

        if gate.is_authenticated() {
            self.transition(ConnectionState::Ready);
        }
        self.submit_response(seq, &response).await?;
        drop(permit);
        if matches!(flow, Flow::Close) {
            self.transition(ConnectionState::Closing);
        }
        Ok(flow)
    }

    async fn handle_upstream_frame(&mut self, raw: Bytes) -> Result<Flow> {
        let upstream_correlation_id = codec::peek_response_correlation_id(&raw)
            .ok_or_else(|| GateError::protocol_msg("response frame too short"))?;
        let context = self
            .upstream
            .as_mut()
            .and_then(|u| u.take_in_flight(upstream_correlation_id))
            .ok_or_else(|| {
                GateError::protocol_msg(format!(
                    "unsolicited upstream response, correlation {upstream_correlation_id}"
                ))
            })?;

        let decode = self.chain.wants_response_decode(context.api_key);
        let frame = codec::decode_response(raw, context.api_key, context.api_version, decode)?;
        metrics::record_frame("response", decode);

        let outcome = self.chain.on_response(&self.filter_ctx, frame).await?;
        match outcome {
            ResponseOutcome::Forward(response) => {
                let wire = response.to_wire(context.downstream_correlation_id)?;
                metrics::record_request_duration(
                    api_key_name(context.api_key),
                    context.arrived.elapsed(),
                );
                self.orderer
                    .submit(
                        context.seq,
                        PendingResponse {
                            correlation_id: context.downstream_correlation_id,
                            data: wire,
                        },
                    )
                    .await;
                Ok(Flow::Continue)
            }
            ResponseOutcome::Drop { close_connection } => {
                self.orderer.submit_skip(context.seq).await;
                if close_connection {
                    self.transition(ConnectionState::Closing);
                    Ok(Flow::Close)
                } else {
                    Ok(Flow::Continue)
                }
            }
        }
    }

    async fn submit_response(&self, seq: u64, response: &ResponseFrame) -> Result<()> {
        let wire = response.to_wire(response.correlation_id)?;
        self.orderer
            .submit(
                seq,
                PendingResponse {
                    correlation_id: response.correlation_id,
                    data: wire,
                },
            )
            .await;
        Ok(())
    }
}
