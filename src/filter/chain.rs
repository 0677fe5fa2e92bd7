//! The per-connection filter chain driver
//!
//! Requests run through the invokers in configured order; responses run in
//! reverse. The driver awaits each filter before the next frame on the
//! connection is processed, so every filter observes requests strictly in
//! arrival order. There is no ordering between connections.

use tracing::debug;

use super::invoker::{build_invokers, ApiKeySet, FilterDecl, FilterInvoker};
use super::{FilterContext, FilterOutcome, ResponseOutcome};
use crate::codec::{RequestFrame, ResponseFrame};
use crate::error::Result;

/// An ordered sequence of compiled filter invokers plus the decode
/// predicate derived from their subscriptions.
pub struct FilterChain {
    invokers: Vec<FilterInvoker>,
    decode_request_keys: ApiKeySet,
    decode_response_keys: ApiKeySet,
}

impl FilterChain {
    /// Compile declarations into a chain. Invalid capability mixes fail
    /// here.
    pub fn build(decls: Vec<FilterDecl>) -> Result<Self> {
        let mut invokers = Vec::new();
        for decl in decls {
            invokers.extend(build_invokers(decl, 0)?);
        }

        let mut decode_request_keys = ApiKeySet::empty();
        let mut decode_response_keys = ApiKeySet::empty();
        for invoker in &invokers {
            if invoker.needs_decode() {
                decode_request_keys.union_with(invoker.request_keys());
                decode_response_keys.union_with(invoker.response_keys());
            }
        }

        Ok(Self {
            invokers,
            decode_request_keys,
            decode_response_keys,
        })
    }

    /// Whether any filter needs the body of this request API decoded
    pub fn wants_request_decode(&self, api_key: i16) -> bool {
        self.decode_request_keys.contains(api_key)
    }

    /// Whether any filter needs the body of this response API decoded
    pub fn wants_response_decode(&self, api_key: i16) -> bool {
        self.decode_response_keys.contains(api_key)
    }

    pub fn len(&self) -> usize {
        self.invokers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.invokers.is_empty()
    }

    /// Run a request through the chain in configured order.
    pub async fn on_request(
        &mut self,
        ctx: &FilterContext,
        mut frame: RequestFrame,
    ) -> Result<FilterOutcome> {
        for invoker in self.invokers.iter_mut() {
            match invoker.on_request(ctx, frame).await? {
                FilterOutcome::Forward(next) => frame = next,
                FilterOutcome::ShortCircuit(response) => {
                    debug!(filter = invoker.name(), "filter short-circuited request");
                    return Ok(FilterOutcome::ShortCircuit(response));
                }
                FilterOutcome::Drop { close_connection } => {
                    debug!(
                        filter = invoker.name(),
                        close_connection, "filter dropped request"
                    );
                    return Ok(FilterOutcome::Drop { close_connection });
                }
            }
        }
        Ok(FilterOutcome::Forward(frame))
    }

    /// Run a response through the chain in reverse order.
    pub async fn on_response(
        &mut self,
        ctx: &FilterContext,
        mut frame: ResponseFrame,
    ) -> Result<ResponseOutcome> {
        for invoker in self.invokers.iter_mut().rev() {
            match invoker.on_response(ctx, frame).await? {
                ResponseOutcome::Forward(next) => frame = next,
                ResponseOutcome::Drop { close_connection } => {
                    debug!(
                        filter = invoker.name(),
                        close_connection, "filter dropped response"
                    );
                    return Ok(ResponseOutcome::Drop { close_connection });
                }
            }
        }
        Ok(ResponseOutcome::Forward(frame))
    }
}
