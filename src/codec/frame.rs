//! Frame model: decoded or opaque Kafka protocol frames
//!
//! A frame always carries its header fields (the proxy needs them to route
//! and re-order), while the body is either the raw wire bytes or a typed
//! message from the decodable set.

use bytes::{Bytes, BytesMut};
use kafka_protocol::messages::{
    ApiKey, ApiVersionsRequest, ApiVersionsResponse, FetchRequest, FetchResponse,
    FindCoordinatorRequest, FindCoordinatorResponse, ListOffsetsRequest, ListOffsetsResponse,
    MetadataRequest, MetadataResponse, ProduceRequest, ProduceResponse, RequestHeader,
    ResponseHeader, SaslAuthenticateRequest, SaslAuthenticateResponse, SaslHandshakeRequest,
    SaslHandshakeResponse,
};
use kafka_protocol::protocol::{Decodable, Encodable};

use super::header_versions::{request_header_version, response_header_version};
use super::{REQUEST_CORRELATION_OFFSET, RESPONSE_CORRELATION_OFFSET};
use crate::error::{GateError, Result};

/// A request frame travelling from the client towards the upstream cluster
#[derive(Debug, Clone)]
pub struct RequestFrame {
    pub api_key: i16,
    pub api_version: i16,
    pub header: RequestHeader,
    pub payload: RequestPayload,
}

/// Request body representation
#[derive(Debug, Clone)]
pub enum RequestPayload {
    /// The complete original frame bytes (header included), relayed verbatim
    Opaque(Bytes),
    /// A fully parsed body
    Decoded(Box<DecodedRequest>),
}

/// The closed set of request bodies the proxy can parse
#[derive(Debug, Clone)]
pub enum DecodedRequest {
    Produce(ProduceRequest),
    Fetch(FetchRequest),
    ListOffsets(ListOffsetsRequest),
    Metadata(MetadataRequest),
    FindCoordinator(FindCoordinatorRequest),
    ApiVersions(ApiVersionsRequest),
    SaslHandshake(SaslHandshakeRequest),
    SaslAuthenticate(SaslAuthenticateRequest),
}

/// A response frame travelling from the upstream cluster towards the client
#[derive(Debug, Clone)]
pub struct ResponseFrame {
    pub api_key: i16,
    pub api_version: i16,
    pub correlation_id: i32,
    pub payload: ResponsePayload,
}

/// Response body representation
#[derive(Debug, Clone)]
pub enum ResponsePayload {
    /// The complete original frame bytes (header included), relayed verbatim
    Opaque(Bytes),
    /// A fully parsed body
    Decoded(Box<DecodedResponse>),
}

/// The closed set of response bodies the proxy can parse or generate
#[derive(Debug, Clone)]
pub enum DecodedResponse {
    Produce(ProduceResponse),
    Fetch(FetchResponse),
    ListOffsets(ListOffsetsResponse),
    Metadata(MetadataResponse),
    FindCoordinator(FindCoordinatorResponse),
    ApiVersions(ApiVersionsResponse),
    SaslHandshake(SaslHandshakeResponse),
    SaslAuthenticate(SaslAuthenticateResponse),
}

/// True when the API's body can be parsed by this codec
pub(crate) fn is_decodable(api_key: i16) -> bool {
    matches!(
        ApiKey::try_from(api_key),
        Ok(ApiKey::ProduceKey
            | ApiKey::FetchKey
            | ApiKey::ListOffsetsKey
            | ApiKey::MetadataKey
            | ApiKey::FindCoordinatorKey
            | ApiKey::ApiVersionsKey
            | ApiKey::SaslHandshakeKey
            | ApiKey::SaslAuthenticateKey)
    )
}

impl RequestFrame {
    pub fn correlation_id(&self) -> i32 {
        self.header.correlation_id
    }

    pub fn decoded(&self) -> Option<&DecodedRequest> {
        match &self.payload {
            RequestPayload::Decoded(d) => Some(d),
            RequestPayload::Opaque(_) => None,
        }
    }

    pub fn decoded_mut(&mut self) -> Option<&mut DecodedRequest> {
        match &mut self.payload {
            RequestPayload::Decoded(d) => Some(d),
            RequestPayload::Opaque(_) => None,
        }
    }

    /// Serialize for the wire with the given correlation id, without the
    /// length prefix. Opaque frames are patched in place rather than
    /// re-encoded.
    pub fn to_wire(&self, correlation_id: i32) -> Result<Bytes> {
        match &self.payload {
            RequestPayload::Opaque(full) => {
                let mut out = BytesMut::with_capacity(full.len());
                out.extend_from_slice(full);
                patch_i32(&mut out, REQUEST_CORRELATION_OFFSET, correlation_id)?;
                Ok(out.freeze())
            }
            RequestPayload::Decoded(decoded) => {
                let mut header = self.header.clone();
                header.correlation_id = correlation_id;
                let mut out = BytesMut::new();
                header
                    .encode(
                        &mut out,
                        request_header_version(self.api_key, self.api_version),
                    )
                    .map_err(|e| {
                        GateError::protocol_msg(format!("failed to encode request header: {e}"))
                    })?;
                encode_request_body(decoded, self.api_key, self.api_version, &mut out)?;
                Ok(out.freeze())
            }
        }
    }
}

impl ResponseFrame {
    /// Construct a generated (filter-produced) response frame
    pub fn decoded(
        api_key: i16,
        api_version: i16,
        correlation_id: i32,
        body: DecodedResponse,
    ) -> Self {
        Self {
            api_key,
            api_version,
            correlation_id,
            payload: ResponsePayload::Decoded(Box::new(body)),
        }
    }

    pub fn decoded_ref(&self) -> Option<&DecodedResponse> {
        match &self.payload {
            ResponsePayload::Decoded(d) => Some(d),
            ResponsePayload::Opaque(_) => None,
        }
    }

    pub fn decoded_mut(&mut self) -> Option<&mut DecodedResponse> {
        match &mut self.payload {
            ResponsePayload::Decoded(d) => Some(d),
            ResponsePayload::Opaque(_) => None,
        }
    }

    /// Serialize for the wire with the given correlation id, without the
    /// length prefix.
    pub fn to_wire(&self, correlation_id: i32) -> Result<Bytes> {
        match &self.payload {
            ResponsePayload::Opaque(full) => {
                let mut out = BytesMut::with_capacity(full.len());
                out.extend_from_slice(full);
                patch_i32(&mut out, RESPONSE_CORRELATION_OFFSET, correlation_id)?;
                Ok(out.freeze())
            }
            ResponsePayload::Decoded(decoded) => {
                let header = ResponseHeader::default().with_correlation_id(correlation_id);
                let mut out = BytesMut::new();
                header
                    .encode(
                        &mut out,
                        response_header_version(self.api_key, self.api_version),
                    )
                    .map_err(|e| {
                        GateError::protocol_msg(format!("failed to encode response header: {e}"))
                    })?;
                encode_response_body(decoded, self.api_key, self.api_version, &mut out)?;
                Ok(out.freeze())
            }
        }
    }
}

fn patch_i32(buf: &mut BytesMut, offset: usize, value: i32) -> Result<()> {
    if buf.len() < offset + 4 {
        return Err(GateError::protocol_msg("frame too short to patch"));
    }
    buf[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
    Ok(())
}

pub(super) fn decode_request(frame: Bytes, decode_body: bool) -> Result<RequestFrame> {
    if frame.len() < 8 {
        return Err(GateError::protocol_msg("request frame too short"));
    }
    let api_key = i16::from_be_bytes([frame[0], frame[1]]);
    let api_version = i16::from_be_bytes([frame[2], frame[3]]);

    let mut buf = frame.clone();
    let header_version = request_header_version(api_key, api_version);
    let header = RequestHeader::decode(&mut buf, header_version).map_err(|e| {
        GateError::protocol_msg(format!(
            "failed to decode request header (api_key {api_key}): {e}"
        ))
    })?;

    let payload = if decode_body && is_decodable(api_key) {
        RequestPayload::Decoded(Box::new(decode_request_body(api_key, api_version, &mut buf)?))
    } else {
        RequestPayload::Opaque(frame)
    };

    Ok(RequestFrame {
        api_key,
        api_version,
        header,
        payload,
    })
}

pub(super) fn decode_response(
    frame: Bytes,
    api_key: i16,
    api_version: i16,
    decode_body: bool,
) -> Result<ResponseFrame> {
    if frame.len() < 4 {
        return Err(GateError::protocol_msg("response frame too short"));
    }
    let mut buf = frame.clone();
    let header_version = response_header_version(api_key, api_version);
    let header = ResponseHeader::decode(&mut buf, header_version).map_err(|e| {
        GateError::protocol_msg(format!(
            "failed to decode response header (api_key {api_key}): {e}"
        ))
    })?;

    let payload = if decode_body && is_decodable(api_key) {
        ResponsePayload::Decoded(Box::new(decode_response_body(api_key, api_version, &mut buf)?))
    } else {
        ResponsePayload::Opaque(frame)
    };

    Ok(ResponseFrame {
        api_key,
        api_version,
        correlation_id: header.correlation_id,
        payload,
    })
}

fn codec_err(what: &str, api_key: i16, api_version: i16, e: impl std::fmt::Display) -> GateError {
    GateError::protocol_msg(format!(
        "failed to {what} (api_key {api_key} v{api_version}): {e}"
    ))
}

fn decode_request_body(
    api_key: i16,
    api_version: i16,
    buf: &mut Bytes,
) -> Result<DecodedRequest> {
    let decode_err = |e| codec_err("decode request body", api_key, api_version, e);
    let decoded = match ApiKey::try_from(api_key) {
        Ok(ApiKey::ProduceKey) => {
            DecodedRequest::Produce(ProduceRequest::decode(buf, api_version).map_err(decode_err)?)
        }
        Ok(ApiKey::FetchKey) => {
            DecodedRequest::Fetch(FetchRequest::decode(buf, api_version).map_err(decode_err)?)
        }
        Ok(ApiKey::ListOffsetsKey) => DecodedRequest::ListOffsets(
            ListOffsetsRequest::decode(buf, api_version).map_err(decode_err)?,
        ),
        Ok(ApiKey::MetadataKey) => {
            DecodedRequest::Metadata(MetadataRequest::decode(buf, api_version).map_err(decode_err)?)
        }
        Ok(ApiKey::FindCoordinatorKey) => DecodedRequest::FindCoordinator(
            FindCoordinatorRequest::decode(buf, api_version).map_err(decode_err)?,
        ),
        Ok(ApiKey::ApiVersionsKey) => DecodedRequest::ApiVersions(
            ApiVersionsRequest::decode(buf, api_version).map_err(decode_err)?,
        ),
        Ok(ApiKey::SaslHandshakeKey) => DecodedRequest::SaslHandshake(
            SaslHandshakeRequest::decode(buf, api_version).map_err(decode_err)?,
        ),
        Ok(ApiKey::SaslAuthenticateKey) => DecodedRequest::SaslAuthenticate(
            SaslAuthenticateRequest::decode(buf, api_version).map_err(decode_err)?,
        ),
        _ => {
            return Err(GateError::protocol_msg(format!(
                "api_key {api_key} is not in the decodable set"
            )))
        }
    };
    Ok(decoded)
}

fn decode_response_body(
    api_key: i16,
    api_version: i16,
    buf: &mut Bytes,
) -> Result<DecodedResponse> {
    let decode_err = |e| codec_err("decode response body", api_key, api_version, e);
    let decoded = match ApiKey::try_from(api_key) {
        Ok(ApiKey::ProduceKey) => DecodedResponse::Produce(
            ProduceResponse::decode(buf, api_version).map_err(decode_err)?,
        ),
        Ok(ApiKey::FetchKey) => {
            DecodedResponse::Fetch(FetchResponse::decode(buf, api_version).map_err(decode_err)?)
        }
        Ok(ApiKey::ListOffsetsKey) => DecodedResponse::ListOffsets(
            ListOffsetsResponse::decode(buf, api_version).map_err(decode_err)?,
        ),
        Ok(ApiKey::MetadataKey) => DecodedResponse::Metadata(
            MetadataResponse::decode(buf, api_version).map_err(decode_err)?,
        ),
        Ok(ApiKey::FindCoordinatorKey) => DecodedResponse::FindCoordinator(
            FindCoordinatorResponse::decode(buf, api_version).map_err(decode_err)?,
        ),
        Ok(ApiKey::ApiVersionsKey) => DecodedResponse::ApiVersions(
            ApiVersionsResponse::decode(buf, api_version).map_err(decode_err)?,
        ),
        Ok(ApiKey::SaslHandshakeKey) => DecodedResponse::SaslHandshake(
            SaslHandshakeResponse::decode(buf, api_version).map_err(decode_err)?,
        ),
        Ok(ApiKey::SaslAuthenticateKey) => DecodedResponse::SaslAuthenticate(
            SaslAuthenticateResponse::decode(buf, api_version).map_err(decode_err)?,
        ),
        _ => {
            return Err(GateError::protocol_msg(format!(
                "api_key {api_key} is not in the decodable set"
            )))
        }
    };
    Ok(decoded)
}

fn encode_request_body(
    decoded: &DecodedRequest,
    api_key: i16,
    api_version: i16,
    out: &mut BytesMut,
) -> Result<()> {
    let encode_err = |e| codec_err("encode request body", api_key, api_version, e);
    match decoded {
        DecodedRequest::Produce(m) => m.encode(out, api_version).map_err(encode_err),
        DecodedRequest::Fetch(m) => m.encode(out, api_version).map_err(encode_err),
        DecodedRequest::ListOffsets(m) => m.encode(out, api_version).map_err(encode_err),
        DecodedRequest::Metadata(m) => m.encode(out, api_version).map_err(encode_err),
        DecodedRequest::FindCoordinator(m) => m.encode(out, api_version).map_err(encode_err),
        DecodedRequest::ApiVersions(m) => m.encode(out, api_version).map_err(encode_err),
        DecodedRequest::SaslHandshake(m) => m.encode(out, api_version).map_err(encode_err),
        DecodedRequest::SaslAuthenticate(m) => m.encode(out, api_version).map_err(encode_err),
    }
}

fn encode_response_body(
    decoded: &DecodedResponse,
    api_key: i16,
    api_version: i16,
    out: &mut BytesMut,
) -> Result<()> {
    let encode_err = |e| codec_err("encode response body", api_key, api_version, e);
    match decoded {
        DecodedResponse::Produce(m) => m.encode(out, api_version).map_err(encode_err),
        DecodedResponse::Fetch(m) => m.encode(out, api_version).map_err(encode_err),
        DecodedResponse::ListOffsets(m) => m.encode(out, api_version).map_err(encode_err),
        DecodedResponse::Metadata(m) => m.encode(out, api_version).map_err(encode_err),
        DecodedResponse::FindCoordinator(m) => m.encode(out, api_version).map_err(encode_err),
        DecodedResponse::ApiVersions(m) => m.encode(out, api_version).map_err(encode_err),
        DecodedResponse::SaslHandshake(m) => m.encode(out, api_version).map_err(encode_err),
        DecodedResponse::SaslAuthenticate(m) => m.encode(out, api_version).map_err(encode_err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kafka_protocol::protocol::StrBytes;

    fn api_versions_request_wire(correlation_id: i32) -> Bytes {
        let header = RequestHeader::default()
            .with_request_api_key(ApiKey::ApiVersionsKey as i16)
            .with_request_api_version(0)
            .with_correlation_id(correlation_id)
            .with_client_id(Some(StrBytes::from_static_str("test-client")));
        let mut buf = BytesMut::new();
        header.encode(&mut buf, 1).unwrap();
        ApiVersionsRequest::default().encode(&mut buf, 0).unwrap();
        buf.freeze()
    }

    #[test]
    fn test_decode_request_header_only() {
        let wire = api_versions_request_wire(42);
        let frame = decode_request(wire.clone(), false).unwrap();
        assert_eq!(frame.api_key, ApiKey::ApiVersionsKey as i16);
        assert_eq!(frame.api_version, 0);
        assert_eq!(frame.correlation_id(), 42);
        match &frame.payload {
            RequestPayload::Opaque(bytes) => assert_eq!(bytes, &wire),
            RequestPayload::Decoded(_) => panic!("expected opaque payload"),
        }
    }

    #[test]
    fn test_decode_request_body() {
        let wire = api_versions_request_wire(7);
        let frame = decode_request(wire, true).unwrap();
        assert!(matches!(
            frame.decoded(),
            Some(DecodedRequest::ApiVersions(_))
        ));
    }

    #[test]
    fn test_opaque_roundtrip_patches_correlation_only() {
        let wire = api_versions_request_wire(1);
        let frame = decode_request(wire.clone(), false).unwrap();
        let rewritten = frame.to_wire(99).unwrap();
        assert_eq!(rewritten.len(), wire.len());
        // Only bytes 4..8 may differ
        assert_eq!(&rewritten[..4], &wire[..4]);
        assert_eq!(&rewritten[8..], &wire[8..]);
        let patched = decode_request(rewritten, false).unwrap();
        assert_eq!(patched.correlation_id(), 99);
    }

    #[test]
    fn test_decoded_request_reencode_roundtrip() {
        let wire = api_versions_request_wire(5);
        let frame = decode_request(wire.clone(), true).unwrap();
        let reencoded = frame.to_wire(5).unwrap();
        assert_eq!(reencoded, wire);
    }

    #[test]
    fn test_generated_response_roundtrip() {
        let body = ApiVersionsResponse::default()
            .with_error_code(0)
            .with_api_keys(vec![])
            .with_throttle_time_ms(0);
        let frame = ResponseFrame::decoded(
            ApiKey::ApiVersionsKey as i16,
            0,
            13,
            DecodedResponse::ApiVersions(body),
        );
        let wire = frame.to_wire(13).unwrap();
        let parsed = decode_response(wire, ApiKey::ApiVersionsKey as i16, 0, true).unwrap();
        assert_eq!(parsed.correlation_id, 13);
        assert!(matches!(
            parsed.decoded_ref(),
            Some(DecodedResponse::ApiVersions(_))
        ));
    }

    #[test]
    fn test_malformed_request_is_error() {
        assert!(decode_request(Bytes::from_static(&[0, 0, 0]), false).is_err());
    }
}
