//! In-process module registry.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::ModuleResolver;
use crate::error::{PluginError, Result};
use crate::identifier::PluginIdentifier;
use crate::module::PluginModule;

/// Builds a fresh module each time the identifier is resolved.
pub type ModuleFactory = Arc<dyn Fn() -> anyhow::Result<PluginModule> + Send + Sync>;

/// Resolver backed by registered factories, for hosts that link their
/// plugins in and for tests.
#[derive(Clone, Default)]
pub struct StaticResolver {
    factories: Arc<RwLock<HashMap<PluginIdentifier, ModuleFactory>>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `factory` under `identifier`, replacing any previous one.
    pub fn register<F>(&self, identifier: PluginIdentifier, factory: F)
    where
        F: Fn() -> anyhow::Result<PluginModule> + Send + Sync + 'static,
    {
        self.factories.write().insert(identifier, Arc::new(factory));
    }

    /// Builder form of [`register`](Self::register).
    pub fn with_module<F>(self, identifier: PluginIdentifier, factory: F) -> Self
    where
        F: Fn() -> anyhow::Result<PluginModule> + Send + Sync + 'static,
    {
        self.register(identifier, factory);
        self
    }

    pub fn unregister(&self, identifier: &PluginIdentifier) -> bool {
        self.factories.write().remove(identifier).is_some()
    }

    pub fn identifiers(&self) -> Vec<PluginIdentifier> {
        let mut ids: Vec<_> = self.factories.read().keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl ModuleResolver for StaticResolver {
    async fn resolve(&self, identifier: &PluginIdentifier) -> Result<PluginModule> {
        let factory = self.factories.read().get(identifier).cloned();
        let factory = factory.ok_or_else(|| {
            PluginError::resolution(identifier.as_str(), "no module registered")
        })?;

        factory().map_err(|e| PluginError::load(identifier.as_str(), format!("{:#}", e)))
    }
}
