//! Ingestor factory registry.
//!
//! Factories are registered explicitly at boot via
//! [`IngestorRegistry::with_builtin`]; nothing registers itself on module
//! load, so construction order is visible in one place.

use std::collections::HashMap;
use std::sync::Arc;

use warden_core::config::IngestorConfig;

use crate::base::Ingestor;
use crate::error::IngestError;

/// Everything a factory needs to build one ingestor instance.
pub struct SpawnContext {
    /// Connection alias the instance belongs to.
    pub connection_alias: String,
    /// Instance discriminator for multi-instance configurations.
    pub instance_id: Option<String>,
    /// The (possibly caller-overridden) ingestor configuration.
    pub config: IngestorConfig,
    /// The owning route's resolved secrets.
    pub secrets: HashMap<String, String>,
    /// The owning route's resolved auto-inject headers.
    pub route_headers: HashMap<String, String>,
    /// Ring-buffer capacity for this instance.
    pub buffer_size: usize,
}

/// Factory signature: build an ingestor from its spawn context.
pub type IngestorFactory = fn(SpawnContext) -> Result<Arc<dyn Ingestor>, IngestError>;

/// Map from `kind[:protocol]` keys to factories.
pub struct IngestorRegistry {
    factories: HashMap<String, IngestorFactory>,
}

impl IngestorRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// A registry with every built-in provider registered.
    #[must_use]
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register("websocket:discord", crate::websocket::discord::spawn);
        registry.register("websocket:slack", crate::websocket::slack::spawn);
        registry.register("webhook:github", crate::webhook::github::spawn);
        registry.register("webhook:stripe", crate::webhook::stripe::spawn);
        registry.register("webhook:trello", crate::webhook::trello::spawn);
        registry.register("webhook:generic", crate::webhook::generic::spawn);
        registry.register("poll", crate::poll::spawn);
        registry
    }

    /// Register (or replace) a factory.
    pub fn register(&mut self, key: &str, factory: IngestorFactory) {
        self.factories.insert(key.to_string(), factory);
    }

    /// Registered keys, sorted.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.factories.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Build an ingestor for the context's configuration.
    pub fn create(&self, ctx: SpawnContext) -> Result<Arc<dyn Ingestor>, IngestError> {
        let key = ctx.config.registry_key();
        let factory = self
            .factories
            .get(&key)
            .ok_or_else(|| IngestError::UnknownKind(key.clone()))?;
        factory(ctx)
    }
}

impl Default for IngestorRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}
