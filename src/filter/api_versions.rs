//! ApiVersions handling
//!
//! ApiVersions requests are answered by the proxy itself: the response is
//! generated from the proxy's own supported-version table, so clients never
//! negotiate a version the proxy cannot relay. If an ApiVersions response
//! does arrive from upstream (for example when this filter is not first in
//! the chain), it is intersected with the same table.

use async_trait::async_trait;
use kafka_protocol::messages::api_versions_response::ApiVersion;
use kafka_protocol::messages::{ApiKey, ApiVersionsResponse};

use super::{
    FilterContext, FilterOutcome, RequestFilter, ResponseFilter, ResponseOutcome, SpecificBinding,
};
use crate::codec::{
    supported_version_range, DecodedRequest, DecodedResponse, RequestFrame, ResponseFrame,
    SUPPORTED_API_VERSIONS,
};
use crate::error::{KafkaErrorCode, Result};
use crate::filter::FilterDecl;
use crate::metrics;

/// Short-circuits ApiVersions requests and intersects upstream ApiVersions
/// responses with the proxy's supported versions.
pub struct ApiVersionsFilter;

impl ApiVersionsFilter {
    /// The declaration to install this filter into a chain
    pub fn decl() -> FilterDecl {
        FilterDecl::specific(
            "apiVersions",
            vec![SpecificBinding {
                request_keys: vec![ApiKey::ApiVersionsKey],
                response_keys: vec![ApiKey::ApiVersionsKey],
                request: Some(Box::new(ApiVersionsFilter)),
                response: Some(Box::new(ApiVersionsFilter)),
            }],
        )
    }

    /// Build the proxy's own version table as a response body
    pub fn supported_versions_response() -> ApiVersionsResponse {
        let api_keys = SUPPORTED_API_VERSIONS
            .iter()
            .map(|&(api_key, min_version, max_version)| {
                ApiVersion::default()
                    .with_api_key(api_key)
                    .with_min_version(min_version)
                    .with_max_version(max_version)
            })
            .collect();
        ApiVersionsResponse::default()
            .with_error_code(KafkaErrorCode::None.as_i16())
            .with_api_keys(api_keys)
            .with_throttle_time_ms(0)
    }

    /// The response answering an ApiVersions request the proxy cannot
    /// decode. Per protocol convention the body is encoded at version 0 so
    /// any client can parse the error.
    pub fn unsupported_version_response(correlation_id: i32) -> ResponseFrame {
        let body = ApiVersionsResponse::default()
            .with_error_code(KafkaErrorCode::UnsupportedVersion.as_i16())
            .with_api_keys(
                supported_version_range(ApiKey::ApiVersionsKey as i16)
                    .map(|(min, max)| {
                        vec![ApiVersion::default()
                            .with_api_key(ApiKey::ApiVersionsKey as i16)
                            .with_min_version(min)
                            .with_max_version(max)]
                    })
                    .unwrap_or_default(),
            )
            .with_throttle_time_ms(0);
        ResponseFrame::decoded(
            ApiKey::ApiVersionsKey as i16,
            0,
            correlation_id,
            DecodedResponse::ApiVersions(body),
        )
    }
}

#[async_trait]
impl RequestFilter for ApiVersionsFilter {
    async fn on_request(
        &mut self,
        _ctx: &FilterContext,
        frame: RequestFrame,
    ) -> Result<FilterOutcome> {
        let Some(DecodedRequest::ApiVersions(_)) = frame.decoded() else {
            return Ok(FilterOutcome::Forward(frame));
        };
        metrics::record_short_circuit();
        let response = ResponseFrame::decoded(
            frame.api_key,
            frame.api_version,
            frame.correlation_id(),
            DecodedResponse::ApiVersions(Self::supported_versions_response()),
        );
        Ok(FilterOutcome::ShortCircuit(response))
    }
}

#[async_trait]
impl ResponseFilter for ApiVersionsFilter {
    async fn on_response(
        &mut self,
        _ctx: &FilterContext,
        mut frame: ResponseFrame,
    ) -> Result<ResponseOutcome> {
        if let Some(DecodedResponse::ApiVersions(response)) = frame.decoded_mut() {
            intersect(response);
        }
        Ok(ResponseOutcome::Forward(frame))
    }
}

/// Clamp the upstream's advertised versions to what the proxy supports.
/// APIs the proxy does not know are removed; an empty intersection removes
/// the entry entirely so the client will not negotiate it.
fn intersect(response: &mut ApiVersionsResponse) {
    response.api_keys.retain_mut(|entry| {
        match supported_version_range(entry.api_key) {
            Some((our_min, our_max)) => {
                let min = entry.min_version.max(our_min);
                let max = entry.max_version.min(our_max);
                if min > max {
                    return false;
                }
                entry.min_version = min;
                entry.max_version = max;
                true
            }
            None => false,
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(api_key: i16, min: i16, max: i16) -> ApiVersion {
        ApiVersion::default()
            .with_api_key(api_key)
            .with_min_version(min)
            .with_max_version(max)
    }

    #[test]
    fn test_intersect_clamps_to_proxy_versions() {
        let mut response = ApiVersionsResponse::default()
            .with_api_keys(vec![entry(0, 0, 99), entry(18, 1, 2)]);
        intersect(&mut response);
        assert_eq!(response.api_keys.len(), 2);
        assert_eq!(response.api_keys[0].max_version, 9); // Produce capped
        assert_eq!(response.api_keys[1].min_version, 1); // upstream min kept
    }

    #[test]
    fn test_intersect_drops_unknown_apis() {
        let mut response = ApiVersionsResponse::default().with_api_keys(vec![entry(126, 0, 1)]);
        intersect(&mut response);
        assert!(response.api_keys.is_empty());
    }

    #[test]
    fn test_intersect_drops_disjoint_ranges() {
        // SaslHandshake supported up to v1; upstream only offers v5+
        let mut response = ApiVersionsResponse::default().with_api_keys(vec![entry(17, 5, 7)]);
        intersect(&mut response);
        assert!(response.api_keys.is_empty());
    }

    #[test]
    fn test_supported_versions_response_lists_api_versions_api() {
        let response = ApiVersionsFilter::supported_versions_response();
        assert!(response
            .api_keys
            .iter()
            .any(|e| e.api_key == ApiKey::ApiVersionsKey as i16));
        assert_eq!(response.error_code, 0);
    }

    #[test]
    fn test_unsupported_version_response_is_v0() {
        let frame = ApiVersionsFilter::unsupported_version_response(7);
        assert_eq!(frame.api_version, 0);
        assert_eq!(frame.correlation_id, 7);
        match frame.decoded_ref() {
            Some(DecodedResponse::ApiVersions(body)) => {
                assert_eq!(
                    body.error_code,
                    KafkaErrorCode::UnsupportedVersion.as_i16()
                );
            }
            _ => panic!("expected ApiVersions body"),
        }
    }
}
