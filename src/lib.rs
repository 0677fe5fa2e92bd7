#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

//! # Streamgate
//!
//! Streamgate is a transparent protocol-level proxy for the Kafka wire
//! protocol. Clients connect to it as if it were a broker; it terminates
//! their connection, applies a chain of filters to every request and
//! response frame, and relays the traffic to upstream Kafka brokers.
//!
//! ## Features
//!
//! - **Transparent relaying**: unsubscribed frames pass through without
//!   body parsing
//! - **Virtual clusters**: many upstream clusters behind shared ports,
//!   routed by SNI or endpoint
//! - **Filter chain**: ordered request/response filters with forward,
//!   short-circuit and drop semantics
//! - **Envelope record encryption**: per-topic KEKs, cached DEK leases,
//!   in-band EDEK storage, AES-256-GCM
//! - **Proxy-terminated SASL**: optional PLAIN gate before relaying
//! - **Built-in observability**: structured logging and Prometheus metrics
//!
//! ## Quick Start
//!
//! ```bash
//! # Run with a configuration file
//! $ streamgate --config streamgate.toml
//!
//! # Validate the configuration and exit
//! $ streamgate --config streamgate.toml --check-config
//! ```
//!
//! ## Architecture
//!
//! - [`proxy`]: listeners, connection state machine, response ordering
//! - [`codec`]: Kafka frame codec with selective body decoding
//! - [`filter`]: filter traits, chain driver and built-in filters
//! - [`encryption`]: the envelope record encryption filter
//! - [`kms`]: the KMS contract and the in-memory implementation
//! - [`net`]: virtual clusters and `(endpoint, SNI)` resolution
//! - [`config`]: TOML configuration and CLI arguments
//! - [`metrics`]: Prometheus-compatible metrics
//! - [`error`]: error types and Kafka error-code mapping

pub mod admin;
pub mod codec;
pub mod config;
pub mod encryption;
pub mod error;
pub mod filter;
pub mod kms;
pub mod metrics;
pub mod net;
pub mod proxy;

pub use config::{ProxyArgs, ProxyConfig};
pub use error::{GateError, Result};
pub use proxy::ProxyServer;

use filter::FilterRegistry;

/// The registry with every built-in filter plugin registered
pub fn default_filter_registry() -> FilterRegistry {
    let mut registry = FilterRegistry::new();
    registry.register(Box::new(encryption::RecordEncryptionFilterFactory));
    registry
}
