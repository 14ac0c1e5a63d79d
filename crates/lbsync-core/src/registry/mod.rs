//! Plugin-based provider registry
//!
//! The registry allows provider backends to be registered dynamically at
//! runtime, avoiding hardcoded if-else chains.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use lbsync_core::registry::ProviderRegistry;
//! use lbsync_core::config::ProviderConfig;
//!
//! // A registry with the built-in memory provider
//! let registry = ProviderRegistry::with_builtin();
//!
//! // Register HTTP-backed providers
//! lbsync_provider_octavia::register(&registry);
//!
//! // Create clients from config
//! let clients = registry.create(&ProviderConfig::Memory)?;
//! ```
//!
//! ## Registration
//!
//! Implementations should register themselves during initialization:
//!
//! ```rust,ignore
//! # use lbsync_core::registry::ProviderRegistry;
//! // In lbsync-provider-octavia crate
//! pub fn register(registry: &ProviderRegistry) {
//!     registry.register("octavia", Box::new(OctaviaFactory));
//! }
//! ```

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use crate::config::ProviderConfig;
use crate::error::{Error, Result};
use crate::provider::MemoryProviderFactory;
use crate::traits::{ProviderClients, ProviderFactory};

/// Provider registry for plugin-based client creation
///
/// The registry maintains a map of provider type names to factory objects,
/// allowing dynamic instantiation of providers based on configuration.
///
/// ## Thread Safety
///
/// The registry uses interior mutability with RwLock, allowing concurrent
/// reads and exclusive writes.
#[derive(Default)]
pub struct ProviderRegistry {
    factories: RwLock<HashMap<String, Box<dyn ProviderFactory>>>,
}

impl ProviderRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with the providers of this crate registered
    pub fn with_builtin() -> Self {
        let registry = Self::new();
        registry.register("memory", Box::new(MemoryProviderFactory));
        registry
    }

    /// Register a provider factory
    ///
    /// # Parameters
    ///
    /// - `name`: Provider type name (e.g., "octavia", "memory")
    /// - `factory`: Factory object for creating client pairs
    ///
    /// Registering a name twice replaces the earlier factory.
    pub fn register(&self, name: impl Into<String>, factory: Box<dyn ProviderFactory>) {
        let mut factories = self.factories.write().unwrap_or_else(PoisonError::into_inner);
        factories.insert(name.into(), factory);
    }

    /// Create provider clients from configuration
    ///
    /// # Returns
    ///
    /// - `Ok(ProviderClients)`: Created clients
    /// - `Err(Error)`: If the provider type is not registered or creation fails
    pub fn create(&self, config: &ProviderConfig) -> Result<ProviderClients> {
        let provider_type = config.type_name();
        let factories = self.factories.read().unwrap_or_else(PoisonError::into_inner);

        let factory = factories
            .get(provider_type)
            .ok_or_else(|| Error::config(format!("Unknown provider type: {}", provider_type)))?;

        factory.create(config)
    }

    /// List all registered provider types
    pub fn list(&self) -> Vec<String> {
        let factories = self.factories.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<_> = factories.keys().cloned().collect();
        names.sort();
        names
    }

    /// Check if a provider type is registered
    pub fn has(&self, name: &str) -> bool {
        let factories = self.factories.read().unwrap_or_else(PoisonError::into_inner);
        factories.contains_key(name)
    }
}
