//! Shared handle to a loaded plugin.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{PluginError, Result};
use crate::identifier::PluginIdentifier;
use crate::module::{
    Capability, CapabilityContract, Export, ExportInfo, PluginInfo, PluginModule, TeardownHook,
};

struct HandleInner {
    identifier: PluginIdentifier,
    info: PluginInfo,
    exports: BTreeMap<String, Export>,
    teardown_hooks: Mutex<Vec<TeardownHook>>,
    loaded_at: chrono::DateTime<chrono::Utc>,
}

/// A loaded plugin's exported surface.
///
/// Clones share the same underlying module; handles returned by repeated
/// loads of a cached identifier compare equal under [`PluginHandle::ptr_eq`].
#[derive(Clone)]
pub struct PluginHandle {
    inner: Arc<HandleInner>,
}

impl PluginHandle {
    pub(crate) fn new(identifier: PluginIdentifier, module: PluginModule) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                identifier,
                info: module.info,
                exports: module.exports,
                teardown_hooks: Mutex::new(module.teardown_hooks),
                loaded_at: chrono::Utc::now(),
            }),
        }
    }

    pub fn identifier(&self) -> &PluginIdentifier {
        &self.inner.identifier
    }

    pub fn info(&self) -> &PluginInfo {
        &self.inner.info
    }

    pub fn loaded_at(&self) -> chrono::DateTime<chrono::Utc> {
        self.inner.loaded_at
    }

    /// Whether both handles refer to the same loaded module.
    pub fn ptr_eq(&self, other: &PluginHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn export(&self, symbol: &str) -> Option<&Export> {
        self.inner.exports.get(symbol)
    }

    pub fn exports(&self) -> Vec<ExportInfo> {
        self.inner
            .exports
            .iter()
            .map(|(symbol, export)| ExportInfo {
                symbol: symbol.clone(),
                callable: export.is_callable(),
                arity: export.arity(),
            })
            .collect()
    }

    /// Register an additional teardown hook for this handle.
    ///
    /// Hooks registered after the handle was unloaded never run.
    pub fn add_teardown_hook(&self, hook: TeardownHook) {
        self.inner.teardown_hooks.lock().push(hook);
    }

    /// Remove every pending teardown hook, in registration order.
    pub(crate) fn take_teardown_hooks(&self) -> Vec<TeardownHook> {
        std::mem::take(&mut *self.inner.teardown_hooks.lock())
    }

    /// Look up a callable capability matching `contract`.
    pub(crate) fn capability(&self, contract: &CapabilityContract) -> Result<Arc<dyn Capability>> {
        let symbol = contract.symbol.as_str();
        let missing = |reason: String| {
            PluginError::missing_capability(self.identifier().as_str(), symbol, reason)
        };

        let capability = match self.export(symbol) {
            None => return Err(missing("is not exported".to_string())),
            Some(Export::Value(_)) => return Err(missing("is not callable".to_string())),
            Some(Export::Function(capability)) => capability.clone(),
        };

        if let (Some(expected), Some(actual)) = (contract.arity, capability.arity()) {
            if expected != actual {
                return Err(missing(format!(
                    "takes {} argument(s), {} required",
                    actual, expected
                )));
            }
        }

        Ok(capability)
    }
}

impl fmt::Debug for PluginHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginHandle")
            .field("identifier", &self.inner.identifier)
            .field("info", &self.inner.info)
            .field("exports", &self.inner.exports.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl fmt::Display for PluginHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} v{} ({})",
            self.inner.info.name, self.inner.info.version, self.inner.identifier
        )
    }
}
