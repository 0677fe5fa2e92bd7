//! Filter declarations and their compiled invokers
//!
//! A filter declares exactly one of the following capability shapes:
//!
//! 1. A composite contributing a flattened sub-chain of other filters
//! 2. A generic request and/or response filter seeing every frame
//! 3. One or more per-API-key specific handlers
//!
//! Mixing shapes is rejected when the declaration is compiled. Every
//! compiled invoker is a "safe invoker": dispatching a frame the filter is
//! not interested in is a pass-through, so the chain driver never needs to
//! special-case interest.

use kafka_protocol::messages::ApiKey;

use super::{FilterContext, FilterOutcome, RequestFilter, ResponseFilter, ResponseOutcome};
use crate::codec::{is_decodable, RequestFrame, ResponseFrame};
use crate::error::{GateError, Result};

/// Composites may nest this deep before compilation fails
const RECURSION_DEPTH_LIMIT: usize = 2;

/// Size of the api-key dispatch table; comfortably above the highest
/// assigned Kafka API key.
const API_KEY_TABLE_SIZE: usize = 128;

/// A set of API keys backed by an ordinal-indexed table
#[derive(Clone)]
pub struct ApiKeySet {
    all: bool,
    keys: [bool; API_KEY_TABLE_SIZE],
}

impl ApiKeySet {
    pub fn empty() -> Self {
        Self {
            all: false,
            keys: [false; API_KEY_TABLE_SIZE],
        }
    }

    pub fn all() -> Self {
        Self {
            all: true,
            keys: [false; API_KEY_TABLE_SIZE],
        }
    }

    pub fn insert(&mut self, api_key: i16) {
        if let Ok(idx) = usize::try_from(api_key) {
            if idx < API_KEY_TABLE_SIZE {
                self.keys[idx] = true;
            }
        }
    }

    pub fn contains(&self, api_key: i16) -> bool {
        if self.all {
            return true;
        }
        match usize::try_from(api_key) {
            Ok(idx) if idx < API_KEY_TABLE_SIZE => self.keys[idx],
            _ => false,
        }
    }

    pub fn union_with(&mut self, other: &ApiKeySet) {
        self.all |= other.all;
        for (slot, set) in self.keys.iter_mut().zip(other.keys.iter()) {
            *slot |= *set;
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.all && self.keys.iter().all(|k| !k)
    }
}

impl Default for ApiKeySet {
    fn default() -> Self {
        Self::empty()
    }
}

/// Per-API-key handlers contributed by a specific filter
pub struct SpecificBinding {
    pub request_keys: Vec<ApiKey>,
    pub response_keys: Vec<ApiKey>,
    pub request: Option<Box<dyn RequestFilter>>,
    pub response: Option<Box<dyn ResponseFilter>>,
}

/// A filter declaration, compiled into invokers at connection setup
pub struct FilterDecl {
    pub name: String,
    pub composite: Option<Vec<FilterDecl>>,
    pub request: Option<Box<dyn RequestFilter>>,
    pub response: Option<Box<dyn ResponseFilter>>,
    pub specific: Vec<SpecificBinding>,
}

impl FilterDecl {
    fn bare(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            composite: None,
            request: None,
            response: None,
            specific: Vec::new(),
        }
    }

    /// A composite filter expanding to a sequence of sub-filters
    pub fn composite(name: impl Into<String>, children: Vec<FilterDecl>) -> Self {
        Self {
            composite: Some(children),
            ..Self::bare(name)
        }
    }

    /// A generic filter seeing every request
    pub fn generic_request(name: impl Into<String>, filter: Box<dyn RequestFilter>) -> Self {
        Self {
            request: Some(filter),
            ..Self::bare(name)
        }
    }

    /// A generic filter seeing every response
    pub fn generic_response(name: impl Into<String>, filter: Box<dyn ResponseFilter>) -> Self {
        Self {
            response: Some(filter),
            ..Self::bare(name)
        }
    }

    /// A generic filter seeing every request and every response
    pub fn generic(
        name: impl Into<String>,
        request: Box<dyn RequestFilter>,
        response: Box<dyn ResponseFilter>,
    ) -> Self {
        Self {
            request: Some(request),
            response: Some(response),
            ..Self::bare(name)
        }
    }

    /// A filter made of per-API-key specific handlers
    pub fn specific(name: impl Into<String>, bindings: Vec<SpecificBinding>) -> Self {
        Self {
            specific: bindings,
            ..Self::bare(name)
        }
    }
}

/// A compiled filter step in the chain
pub struct FilterInvoker {
    name: String,
    request: Option<Box<dyn RequestFilter>>,
    response: Option<Box<dyn ResponseFilter>>,
    request_keys: ApiKeySet,
    response_keys: ApiKeySet,
    /// Whether the subscribed bodies must be decoded for this invoker
    /// (specific filters only; generic filters accept opaque frames)
    needs_decode: bool,
}

impl FilterInvoker {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(super) fn needs_decode(&self) -> bool {
        self.needs_decode
    }

    pub(super) fn request_keys(&self) -> &ApiKeySet {
        &self.request_keys
    }

    pub(super) fn response_keys(&self) -> &ApiKeySet {
        &self.response_keys
    }

    pub fn wants_request(&self, api_key: i16) -> bool {
        self.request.is_some() && self.request_keys.contains(api_key)
    }

    pub fn wants_response(&self, api_key: i16) -> bool {
        self.response.is_some() && self.response_keys.contains(api_key)
    }

    /// Dispatch a request; frames the filter is not interested in pass
    /// through untouched.
    pub async fn on_request(
        &mut self,
        ctx: &FilterContext,
        frame: RequestFrame,
    ) -> Result<FilterOutcome> {
        if !self.wants_request(frame.api_key) {
            return Ok(FilterOutcome::Forward(frame));
        }
        match self.request.as_mut() {
            Some(filter) => filter.on_request(ctx, frame).await,
            None => Ok(FilterOutcome::Forward(frame)),
        }
    }

    /// Dispatch a response; frames the filter is not interested in pass
    /// through untouched.
    pub async fn on_response(
        &mut self,
        ctx: &FilterContext,
        frame: ResponseFrame,
    ) -> Result<ResponseOutcome> {
        if !self.wants_response(frame.api_key) {
            return Ok(ResponseOutcome::Forward(frame));
        }
        match self.response.as_mut() {
            Some(filter) => filter.on_response(ctx, frame).await,
            None => Ok(ResponseOutcome::Forward(frame)),
        }
    }
}

/// Compile a declaration into invokers, validating the capability shape.
pub fn build_invokers(decl: FilterDecl, depth: usize) -> Result<Vec<FilterInvoker>> {
    let is_composite = decl.composite.is_some();
    let is_generic = decl.request.is_some() || decl.response.is_some();
    let is_specific = !decl.specific.is_empty();
    let name = decl.name.clone();

    if is_specific && is_composite {
        return Err(invalid_mix(&name, "specific handlers and a composite"));
    }
    if is_generic && is_composite {
        return Err(invalid_mix(&name, "generic handlers and a composite"));
    }
    if is_specific && is_generic {
        return Err(invalid_mix(&name, "specific and generic handlers"));
    }
    if !is_composite && !is_generic && !is_specific {
        return Err(GateError::FilterConstruction(format!(
            "filter '{name}' declares no request, response, specific or composite capability"
        )));
    }

    if let Some(children) = decl.composite {
        if depth >= RECURSION_DEPTH_LIMIT {
            return Err(GateError::FilterConstruction(format!(
                "composite filter '{name}' nested deeper than the limit of {RECURSION_DEPTH_LIMIT}"
            )));
        }
        let mut out = Vec::new();
        for child in children {
            out.extend(build_invokers(child, depth + 1)?);
        }
        return Ok(out);
    }

    if is_generic {
        return Ok(vec![FilterInvoker {
            name,
            request_keys: if decl.request.is_some() {
                ApiKeySet::all()
            } else {
                ApiKeySet::empty()
            },
            response_keys: if decl.response.is_some() {
                ApiKeySet::all()
            } else {
                ApiKeySet::empty()
            },
            request: decl.request,
            response: decl.response,
            needs_decode: false,
        }]);
    }

    // Specific handlers: one invoker per binding, dispatched by key table
    let mut out = Vec::new();
    for binding in decl.specific {
        if binding.request_keys.is_empty() && binding.response_keys.is_empty() {
            return Err(GateError::FilterConstruction(format!(
                "specific filter '{name}' subscribes to no API keys"
            )));
        }
        if !binding.request_keys.is_empty() && binding.request.is_none() {
            return Err(GateError::FilterConstruction(format!(
                "specific filter '{name}' subscribes to requests without a request handler"
            )));
        }
        if !binding.response_keys.is_empty() && binding.response.is_none() {
            return Err(GateError::FilterConstruction(format!(
                "specific filter '{name}' subscribes to responses without a response handler"
            )));
        }
        let mut request_keys = ApiKeySet::empty();
        for key in &binding.request_keys {
            ensure_decodable(&name, *key)?;
            request_keys.insert(*key as i16);
        }
        let mut response_keys = ApiKeySet::empty();
        for key in &binding.response_keys {
            ensure_decodable(&name, *key)?;
            response_keys.insert(*key as i16);
        }
        out.push(FilterInvoker {
            name: name.clone(),
            request: binding.request,
            response: binding.response,
            request_keys,
            response_keys,
            needs_decode: true,
        });
    }
    Ok(out)
}

fn ensure_decodable(name: &str, key: ApiKey) -> Result<()> {
    if !is_decodable(key as i16) {
        return Err(GateError::FilterConstruction(format!(
            "filter '{name}' subscribes to {key:?}, which the codec cannot decode"
        )));
    }
    Ok(())
}

fn invalid_mix(name: &str, what: &str) -> GateError {
    GateError::FilterConstruction(format!("filter '{name}' cannot mix {what}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct NoopRequest;

    #[async_trait]
    impl RequestFilter for NoopRequest {
        async fn on_request(
            &mut self,
            _ctx: &FilterContext,
            frame: RequestFrame,
        ) -> Result<FilterOutcome> {
            Ok(FilterOutcome::Forward(frame))
        }
    }

    struct NoopResponse;

    #[async_trait]
    impl ResponseFilter for NoopResponse {
        async fn on_response(
            &mut self,
            _ctx: &FilterContext,
            frame: ResponseFrame,
        ) -> Result<ResponseOutcome> {
            Ok(ResponseOutcome::Forward(frame))
        }
    }

    fn generic_decl() -> FilterDecl {
        FilterDecl::generic_request("req", Box::new(NoopRequest))
    }

    fn specific_decl() -> FilterDecl {
        FilterDecl::specific(
            "produce-only",
            vec![SpecificBinding {
                request_keys: vec![ApiKey::ProduceKey],
                response_keys: vec![],
                request: Some(Box::new(NoopRequest)),
                response: None,
            }],
        )
    }

    #[test]
    fn test_accepts_generic_request_filter() {
        assert_eq!(build_invokers(generic_decl(), 0).unwrap().len(), 1);
    }

    #[test]
    fn test_accepts_generic_response_filter() {
        let decl = FilterDecl::generic_response("resp", Box::new(NoopResponse));
        assert_eq!(build_invokers(decl, 0).unwrap().len(), 1);
    }

    #[test]
    fn test_accepts_generic_request_and_response_filter() {
        let decl = FilterDecl::generic("both", Box::new(NoopRequest), Box::new(NoopResponse));
        let invokers = build_invokers(decl, 0).unwrap();
        assert_eq!(invokers.len(), 1);
        assert!(invokers[0].wants_request(0));
        assert!(invokers[0].wants_response(0));
    }

    #[test]
    fn test_accepts_specific_filter() {
        let invokers = build_invokers(specific_decl(), 0).unwrap();
        assert_eq!(invokers.len(), 1);
        assert!(invokers[0].wants_request(ApiKey::ProduceKey as i16));
        assert!(!invokers[0].wants_request(ApiKey::FetchKey as i16));
        assert!(invokers[0].needs_decode());
    }

    #[test]
    fn test_accepts_composite_of_allowed_filters() {
        let decl = FilterDecl::composite("outer", vec![generic_decl(), specific_decl()]);
        assert_eq!(build_invokers(decl, 0).unwrap().len(), 2);
    }

    #[test]
    fn test_rejects_composite_mixed_with_generic() {
        let mut decl = FilterDecl::composite("bad", vec![generic_decl()]);
        decl.request = Some(Box::new(NoopRequest));
        assert!(build_invokers(decl, 0).is_err());
    }

    #[test]
    fn test_rejects_composite_mixed_with_specific() {
        let mut decl = FilterDecl::composite("bad", vec![generic_decl()]);
        decl.specific = vec![SpecificBinding {
            request_keys: vec![ApiKey::ProduceKey],
            response_keys: vec![],
            request: Some(Box::new(NoopRequest)),
            response: None,
        }];
        assert!(build_invokers(decl, 0).is_err());
    }

    #[test]
    fn test_rejects_generic_mixed_with_specific() {
        let mut decl = specific_decl();
        decl.response = Some(Box::new(NoopResponse));
        assert!(build_invokers(decl, 0).is_err());
    }

    #[test]
    fn test_rejects_empty_declaration() {
        assert!(build_invokers(FilterDecl::bare("empty"), 0).is_err());
    }

    #[test]
    fn test_rejects_too_deep_composite_nesting() {
        let inner = FilterDecl::composite("inner", vec![generic_decl()]);
        let middle = FilterDecl::composite("middle", vec![inner]);
        let outer = FilterDecl::composite("outer", vec![middle]);
        assert!(build_invokers(outer, 0).is_err());
    }

    #[test]
    fn test_accepts_composite_at_depth_limit() {
        let inner = FilterDecl::composite("inner", vec![generic_decl()]);
        let outer = FilterDecl::composite("outer", vec![inner]);
        assert_eq!(build_invokers(outer, 0).unwrap().len(), 1);
    }

    #[test]
    fn test_rejects_subscription_outside_decodable_set() {
        let decl = FilterDecl::specific(
            "bad",
            vec![SpecificBinding {
                request_keys: vec![ApiKey::CreateTopicsKey],
                response_keys: vec![],
                request: Some(Box::new(NoopRequest)),
                response: None,
            }],
        );
        assert!(build_invokers(decl, 0).is_err());
    }

    #[test]
    fn test_api_key_set() {
        let mut set = ApiKeySet::empty();
        assert!(set.is_empty());
        set.insert(3);
        assert!(set.contains(3));
        assert!(!set.contains(4));
        assert!(!set.contains(-1));
        assert!(ApiKeySet::all().contains(67));
    }
}
