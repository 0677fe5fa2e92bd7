//! Frame filters and the per-connection filter chain
//!
//! A filter intercepts request and/or response frames on one connection.
//! Filters are declared through a [`FilterDecl`], which is compiled into
//! invokers at connection setup; invalid capability combinations are
//! rejected there, which makes them fatal at startup because the first
//! chain is compiled during configuration validation.

mod api_versions;
mod broker_address;
mod chain;
mod invoker;
mod registry;

pub use api_versions::ApiVersionsFilter;
pub use broker_address::BrokerAddressFilter;
pub use chain::FilterChain;
pub use invoker::{ApiKeySet, FilterDecl, FilterInvoker, SpecificBinding};
pub use registry::{FilterFactory, FilterInstanceFactory, FilterRegistry};

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::codec::{RequestFrame, ResponseFrame};
use crate::error::Result;
use crate::net::{BindingResolver, Endpoint, VirtualCluster};

/// Per-connection context handed to every filter invocation
pub struct FilterContext {
    /// The virtual cluster this connection belongs to
    pub virtual_cluster: Arc<VirtualCluster>,
    /// Binding resolver, used by filters that learn broker addresses
    pub resolver: Arc<BindingResolver>,
    /// The local endpoint the client connected to
    pub endpoint: Endpoint,
    /// Downstream peer address
    pub peer_addr: Option<SocketAddr>,
}

/// What a request filter decided to do with a frame
pub enum FilterOutcome {
    /// Pass the (possibly modified) frame to the next filter, and
    /// ultimately upstream
    Forward(RequestFrame),
    /// Answer the client directly without an upstream round trip
    ShortCircuit(ResponseFrame),
    /// Discard the frame. The response orderer is told to skip the slot so
    /// later responses are not held up.
    Drop { close_connection: bool },
}

/// What a response filter decided to do with a frame
pub enum ResponseOutcome {
    /// Pass the (possibly modified) frame to the next filter, and
    /// ultimately downstream
    Forward(ResponseFrame),
    /// Discard the frame
    Drop { close_connection: bool },
}

/// A filter participating on the request path
#[async_trait]
pub trait RequestFilter: Send + Sync {
    async fn on_request(
        &mut self,
        ctx: &FilterContext,
        frame: RequestFrame,
    ) -> Result<FilterOutcome>;
}

/// A filter participating on the response path
#[async_trait]
pub trait ResponseFilter: Send + Sync {
    async fn on_response(
        &mut self,
        ctx: &FilterContext,
        frame: ResponseFrame,
    ) -> Result<ResponseOutcome>;
}
