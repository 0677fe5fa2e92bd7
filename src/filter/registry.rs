//! Filter registry
//!
//! Each filter plugin declares a short name and validates its configuration
//! once at startup; the resulting instance factory then creates fresh
//! filter declarations per connection. Shared state (caches, KMS clients)
//! lives behind the instance factory, per-connection state in the
//! declarations it creates.

use std::collections::HashMap;
use std::sync::Arc;

use super::FilterDecl;
use crate::config::FilterDefinition;
use crate::error::{GateError, Result};

/// A registered filter plugin
pub trait FilterFactory: Send + Sync {
    /// The name used in the `type` field of a filter definition
    fn short_name(&self) -> &'static str;

    /// Validate the configuration and build the per-process instance
    /// factory. Errors are fatal at startup.
    fn initialize(&self, config: &toml::Value) -> Result<Arc<dyn FilterInstanceFactory>>;
}

/// Creates per-connection filter declarations
pub trait FilterInstanceFactory: Send + Sync {
    fn create(&self) -> FilterDecl;
}

/// The set of known filter plugins
#[derive(Default)]
pub struct FilterRegistry {
    factories: HashMap<&'static str, Box<dyn FilterFactory>>,
}

impl FilterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, factory: Box<dyn FilterFactory>) {
        self.factories.insert(factory.short_name(), factory);
    }

    /// Resolve every configured filter definition into an instance factory.
    /// Unknown names and invalid configurations are fatal.
    pub fn build_instance_factories(
        &self,
        definitions: &[FilterDefinition],
    ) -> Result<Vec<Arc<dyn FilterInstanceFactory>>> {
        definitions
            .iter()
            .map(|definition| {
                let factory = self
                    .factories
                    .get(definition.filter_type.as_str())
                    .ok_or_else(|| {
                        GateError::Config(format!(
                            "unknown filter type '{}' (known: {:?})",
                            definition.filter_type,
                            self.factories.keys().collect::<Vec<_>>()
                        ))
                    })?;
                factory.initialize(&definition.config)
            })
            .collect()
    }
}
