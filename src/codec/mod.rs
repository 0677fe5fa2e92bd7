//! Kafka wire frame codec for the proxy data path
//!
//! Frames are length-prefixed Kafka protocol messages. The proxy decodes
//! every request header (it needs the api key, version and correlation id to
//! route and re-order), but bodies are only parsed when a filter subscribed
//! to that API, or when SASL gating requires inspection. Everything else is
//! relayed as opaque bytes.
//!
//! The decodable body set is a closed enum over the APIs built-in filters
//! can subscribe to; a filter subscribing outside this set is rejected when
//! the chain is built.

mod frame;
mod header_versions;

pub use frame::{
    DecodedRequest, DecodedResponse, RequestFrame, RequestPayload, ResponseFrame, ResponsePayload,
};
pub(crate) use frame::is_decodable;
pub use header_versions::{
    api_key_name, request_header_version, response_header_version, supported_version_range,
    SUPPORTED_API_VERSIONS,
};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

use crate::error::{GateError, Result};

/// Request frame layout: the correlation id sits after the two i16s of
/// api key and api version.
pub(crate) const REQUEST_CORRELATION_OFFSET: usize = 4;

/// Response frame layout: the correlation id is the first field.
pub(crate) const RESPONSE_CORRELATION_OFFSET: usize = 0;

/// Read one length-prefixed frame from the stream.
///
/// Returns `Ok(None)` on a clean EOF at a frame boundary. A length prefix
/// beyond `max_frame_bytes` is a fatal protocol error for the connection.
pub async fn read_frame<R>(reader: &mut R, max_frame_bytes: u64) -> Result<Option<Bytes>>
where
    R: AsyncRead + Unpin,
{
    let mut size_buf = [0u8; 4];
    match reader.read_exact(&mut size_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    }

    let frame_size = u32::from_be_bytes(size_buf) as usize;
    if frame_size as u64 > max_frame_bytes {
        return Err(GateError::protocol_msg(format!(
            "frame size {} exceeds maximum {}",
            frame_size, max_frame_bytes
        )));
    }
    // Both directions carry at least a correlation id
    if frame_size < 4 {
        return Err(GateError::protocol_msg(format!(
            "frame size {} below minimum header size",
            frame_size
        )));
    }

    // try_reserve so a hostile length prefix cannot abort the process
    let mut frame_buf = Vec::new();
    frame_buf.try_reserve(frame_size).map_err(|e| {
        GateError::protocol_msg(format!("cannot allocate {} byte frame: {e}", frame_size))
    })?;
    frame_buf.resize(frame_size, 0);
    reader.read_exact(&mut frame_buf).await?;

    Ok(Some(Bytes::from(frame_buf)))
}

/// Peek the correlation id of a raw request frame without decoding.
pub fn peek_request_correlation_id(frame: &Bytes) -> Option<i32> {
    peek_i32(frame, REQUEST_CORRELATION_OFFSET)
}

/// Peek the correlation id of a raw response frame without decoding.
pub fn peek_response_correlation_id(frame: &Bytes) -> Option<i32> {
    peek_i32(frame, RESPONSE_CORRELATION_OFFSET)
}

fn peek_i32(frame: &Bytes, offset: usize) -> Option<i32> {
    if frame.len() < offset + 4 {
        return None;
    }
    Some(i32::from_be_bytes([
        frame[offset],
        frame[offset + 1],
        frame[offset + 2],
        frame[offset + 3],
    ]))
}

/// Decode a raw request frame.
///
/// The header is always decoded; the body is decoded only when
/// `decode_body` is true and the API is in the decodable set. On the opaque
/// path the original frame bytes are retained untouched.
pub fn decode_request(frame: Bytes, decode_body: bool) -> Result<RequestFrame> {
    frame::decode_request(frame, decode_body).map_err(|e| {
        debug!(error = %e, "request frame decode failed");
        e
    })
}

/// Decode a raw response frame. The caller supplies the api key and version
/// recorded when the matching request was sent upstream.
pub fn decode_response(
    frame: Bytes,
    api_key: i16,
    api_version: i16,
    decode_body: bool,
) -> Result<ResponseFrame> {
    frame::decode_response(frame, api_key, api_version, decode_body)
}
