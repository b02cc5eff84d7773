//! Loaded module surface: exports, capabilities and teardown hooks.
//!
//! A [`ModuleResolver`](crate::resolver::ModuleResolver) produces a
//! [`PluginModule`]; the loader wraps it into a
//! [`PluginHandle`](crate::PluginHandle) and caches it.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::identifier::PluginIdentifier;

/// Error raised by a plugin's own code.
pub type PluginFault = anyhow::Error;

/// A named callable operation exposed by a plugin.
///
/// The loader treats implementations as opaque: thread safety of the
/// underlying plugin code is the plugin's own contract.
#[async_trait]
pub trait Capability: Send + Sync {
    /// Number of arguments, when statically known.
    fn arity(&self) -> Option<usize> {
        None
    }

    async fn call(&self, args: Vec<Value>) -> std::result::Result<Value, PluginFault>;
}

type AsyncFn =
    dyn Fn(Vec<Value>) -> BoxFuture<'static, std::result::Result<Value, PluginFault>> + Send + Sync;

/// Adapts a closure into a [`Capability`].
pub struct FnCapability {
    arity: Option<usize>,
    func: Box<AsyncFn>,
}

impl FnCapability {
    pub fn new<F, Fut>(arity: Option<usize>, func: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Value, PluginFault>> + Send + 'static,
    {
        Self {
            arity,
            func: Box::new(move |args| Box::pin(func(args))),
        }
    }

    pub fn from_sync<F>(arity: Option<usize>, func: F) -> Self
    where
        F: Fn(&[Value]) -> std::result::Result<Value, PluginFault> + Send + Sync + 'static,
    {
        let func = Arc::new(func);
        Self::new(arity, move |args| {
            let func = func.clone();
            async move { func(&args) }
        })
    }
}

#[async_trait]
impl Capability for FnCapability {
    fn arity(&self) -> Option<usize> {
        self.arity
    }

    async fn call(&self, args: Vec<Value>) -> std::result::Result<Value, PluginFault> {
        (self.func)(args).await
    }
}

/// A single exported symbol.
#[derive(Clone)]
pub enum Export {
    /// Callable capability.
    Function(Arc<dyn Capability>),
    /// Plain exported value; present but not callable.
    Value(Value),
}

impl Export {
    pub fn is_callable(&self) -> bool {
        matches!(self, Export::Function(_))
    }

    pub fn arity(&self) -> Option<usize> {
        match self {
            Export::Function(cap) => cap.arity(),
            Export::Value(_) => None,
        }
    }
}

impl fmt::Debug for Export {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Export::Function(cap) => f
                .debug_struct("Function")
                .field("arity", &cap.arity())
                .finish(),
            Export::Value(value) => f.debug_tuple("Value").field(value).finish(),
        }
    }
}

/// Serializable summary of one export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportInfo {
    pub symbol: String,
    pub callable: bool,
    pub arity: Option<usize>,
}

/// A declared capability requirement: symbol name plus arity when known.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityContract {
    pub symbol: String,
    pub arity: Option<usize>,
}

impl CapabilityContract {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            arity: None,
        }
    }

    pub fn with_arity(mut self, arity: usize) -> Self {
        self.arity = Some(arity);
        self
    }
}

/// Descriptive information about a plugin module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginInfo {
    pub name: String,
    pub version: semver::Version,
}

impl Default for PluginInfo {
    fn default() -> Self {
        Self {
            name: String::new(),
            version: semver::Version::new(0, 0, 0),
        }
    }
}

/// Cleanup work registered for a handle, run once on unload or teardown.
pub struct TeardownHook {
    label: String,
    run: Box<dyn FnOnce() -> anyhow::Result<()> + Send>,
}

impl TeardownHook {
    pub fn new<F>(label: impl Into<String>, run: F) -> Self
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        Self {
            label: label.into(),
            run: Box::new(run),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn run(self) -> anyhow::Result<()> {
        (self.run)()
    }

    /// Run the hook, turning failures and panics into a message.
    pub(crate) fn run_guarded(self) -> std::result::Result<(), String> {
        let label = self.label.clone();
        match std::panic::catch_unwind(AssertUnwindSafe(move || self.run())) {
            Ok(Ok(())) => {
                tracing::debug!("Teardown hook '{}' completed", label);
                Ok(())
            }
            Ok(Err(e)) => Err(format!("teardown hook '{}' failed: {:#}", label, e)),
            Err(payload) => Err(format!(
                "teardown hook '{}' panicked: {}",
                label,
                panic_message(&*payload)
            )),
        }
    }
}

impl fmt::Debug for TeardownHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TeardownHook")
            .field("label", &self.label)
            .finish()
    }
}

/// A resolved and initialized plugin module.
#[derive(Debug, Default)]
pub struct PluginModule {
    pub(crate) info: PluginInfo,
    pub(crate) exports: BTreeMap<String, Export>,
    pub(crate) teardown_hooks: Vec<TeardownHook>,
}

impl PluginModule {
    pub fn new(name: impl Into<String>, version: semver::Version) -> Self {
        Self {
            info: PluginInfo {
                name: name.into(),
                version,
            },
            exports: BTreeMap::new(),
            teardown_hooks: Vec::new(),
        }
    }

    /// Export an asynchronous function.
    pub fn with_function<F, Fut>(
        self,
        symbol: impl Into<String>,
        arity: Option<usize>,
        func: F,
    ) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Value, PluginFault>> + Send + 'static,
    {
        self.with_capability(symbol, Arc::new(FnCapability::new(arity, func)))
    }

    /// Export a synchronous function.
    pub fn with_sync_function<F>(
        self,
        symbol: impl Into<String>,
        arity: Option<usize>,
        func: F,
    ) -> Self
    where
        F: Fn(&[Value]) -> std::result::Result<Value, PluginFault> + Send + Sync + 'static,
    {
        self.with_capability(symbol, Arc::new(FnCapability::from_sync(arity, func)))
    }

    pub fn with_capability(
        mut self,
        symbol: impl Into<String>,
        capability: Arc<dyn Capability>,
    ) -> Self {
        self.exports.insert(symbol.into(), Export::Function(capability));
        self
    }

    /// Export a plain, non-callable value.
    pub fn with_value(mut self, symbol: impl Into<String>, value: Value) -> Self {
        self.exports.insert(symbol.into(), Export::Value(value));
        self
    }

    pub fn with_teardown<F>(mut self, label: impl Into<String>, run: F) -> Self
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        self.teardown_hooks.push(TeardownHook::new(label, run));
        self
    }

    pub fn info(&self) -> &PluginInfo {
        &self.info
    }

    pub fn exports(&self) -> &BTreeMap<String, Export> {
        &self.exports
    }

    /// Tear down a module that never became a handle.
    pub(crate) fn discard(self, identifier: &PluginIdentifier) {
        tracing::debug!(identifier = %identifier, "Discarding unclaimed plugin module");
        for hook in self.teardown_hooks {
            if let Err(reason) = hook.run_guarded() {
                tracing::warn!(identifier = %identifier, "{}", reason);
            }
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
