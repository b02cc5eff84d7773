//! Module resolution.
//!
//! A [`ModuleResolver`] turns a [`PluginIdentifier`] into an initialized
//! [`PluginModule`]. The loader never looks at files itself; it only caches
//! what a resolver hands back.

mod memory;
mod native;

pub use memory::{ModuleFactory, StaticResolver};
pub use native::{module_from_descriptor, is_library_file, NativeResolver};

use async_trait::async_trait;

use crate::error::Result;
use crate::identifier::PluginIdentifier;
use crate::module::PluginModule;

/// Resolves and initializes plugin modules.
///
/// Implementations report `ResolutionError` when the identifier cannot be
/// located and `LoadError` when it was located but could not be initialized.
#[async_trait]
pub trait ModuleResolver: Send + Sync {
    async fn resolve(&self, identifier: &PluginIdentifier) -> Result<PluginModule>;
}

#[async_trait]
impl<R> ModuleResolver for std::sync::Arc<R>
where
    R: ModuleResolver + ?Sized,
{
    async fn resolve(&self, identifier: &PluginIdentifier) -> Result<PluginModule> {
        (**self).resolve(identifier).await
    }
}
