//! Plugin loader: caching, validation, invocation and teardown.
//!
//! Every identifier gets its own slot. A slot pairs an async mutex guarding
//! the cached handle with an observable [`PluginState`]. Loads and unloads of
//! one identifier are serialized on that mutex; different identifiers never
//! wait on each other. Slots are created on first use and released once their
//! identifier is unloaded and no other operation holds them.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::config::LoaderConfig;
use crate::error::{Operation, PluginError, Result};
use crate::event::{EventKind, EventSink, LoaderEvent, TracingSink};
use crate::handle::PluginHandle;
use crate::identifier::PluginIdentifier;
use crate::module::{panic_message, CapabilityContract};
use crate::resolver::{ModuleResolver, NativeResolver};

/// Lifecycle state of one identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginState {
    Unloaded,
    Loading,
    Loaded,
}

struct Slot {
    handle: tokio::sync::Mutex<Option<PluginHandle>>,
    state: parking_lot::Mutex<PluginState>,
}

impl Slot {
    fn new() -> Self {
        Self {
            handle: tokio::sync::Mutex::new(None),
            state: parking_lot::Mutex::new(PluginState::Unloaded),
        }
    }

    fn state(&self) -> PluginState {
        *self.state.lock()
    }

    fn set_state(&self, state: PluginState) {
        *self.state.lock() = state;
    }
}

/// Resolves, caches, validates and invokes plugins.
pub struct PluginLoader {
    resolver: Arc<dyn ModuleResolver>,
    slots: parking_lot::Mutex<HashMap<PluginIdentifier, Arc<Slot>>>,
    events: Arc<dyn EventSink>,
    load_timeout: Option<Duration>,
    invoke_timeout: Option<Duration>,
}

impl PluginLoader {
    pub fn new(resolver: impl ModuleResolver + 'static) -> Self {
        Self::with_resolver(Arc::new(resolver))
    }

    pub fn with_resolver(resolver: Arc<dyn ModuleResolver>) -> Self {
        Self {
            resolver,
            slots: parking_lot::Mutex::new(HashMap::new()),
            events: Arc::new(TracingSink),
            load_timeout: None,
            invoke_timeout: None,
        }
    }

    /// Loader over a [`NativeResolver`] built from `config`.
    pub fn from_config(config: &LoaderConfig) -> Self {
        let mut loader = Self::new(NativeResolver::from_config(config));
        loader.load_timeout = config.load_timeout();
        loader.invoke_timeout = config.invoke_timeout();
        loader
    }

    pub fn with_event_sink(mut self, sink: impl EventSink + 'static) -> Self {
        self.events = Arc::new(sink);
        self
    }

    pub fn with_load_timeout(mut self, timeout: Duration) -> Self {
        self.load_timeout = Some(timeout);
        self
    }

    pub fn with_invoke_timeout(mut self, timeout: Duration) -> Self {
        self.invoke_timeout = Some(timeout);
        self
    }

    pub fn load_timeout(&self) -> Option<Duration> {
        self.load_timeout
    }

    pub fn invoke_timeout(&self) -> Option<Duration> {
        self.invoke_timeout
    }

    /// Load `identifier`, returning the cached handle when there is one.
    ///
    /// Concurrent calls for the same identifier share a single resolution.
    pub async fn load(&self, identifier: &PluginIdentifier) -> Result<PluginHandle> {
        self.load_with_cancel(identifier, &CancellationToken::new())
            .await
    }

    /// Like [`load`](Self::load), failing with `CancelledError` once `cancel`
    /// fires or the load timeout elapses. The identifier is then back to
    /// [`PluginState::Unloaded`].
    pub async fn load_with_cancel(
        &self,
        identifier: &PluginIdentifier,
        cancel: &CancellationToken,
    ) -> Result<PluginHandle> {
        let slot = self.slot(identifier);
        let result = bounded(
            identifier,
            Operation::Load,
            self.load_timeout,
            cancel,
            self.load_slot(identifier, &slot),
        )
        .await;
        drop(slot);

        if let Err(err) = &result {
            self.emit_error(identifier, err);
            self.release_slot(identifier);
        }
        result
    }

    async fn load_slot(
        &self,
        identifier: &PluginIdentifier,
        slot: &Slot,
    ) -> Result<PluginHandle> {
        let mut cached = slot.handle.lock().await;
        if let Some(handle) = cached.as_ref() {
            return Ok(handle.clone());
        }

        slot.set_state(PluginState::Loading);
        let rollback = scopeguard::guard(slot, |slot| slot.set_state(PluginState::Unloaded));

        tracing::debug!(identifier = %identifier, "Resolving plugin");
        let module = self.resolver.resolve(identifier).await?;
        let handle = PluginHandle::new(identifier.clone(), module);
        *cached = Some(handle.clone());

        scopeguard::ScopeGuard::into_inner(rollback);
        slot.set_state(PluginState::Loaded);

        self.emit(EventKind::Loaded, identifier, handle.to_string());
        Ok(handle)
    }

    /// Check that `symbol` is exported by `handle` and callable.
    pub fn validate(&self, handle: &PluginHandle, symbol: &str) -> Result<()> {
        self.validate_contract(handle, &CapabilityContract::new(symbol))
    }

    /// Check a capability contract, including arity when both sides declare one.
    pub fn validate_contract(
        &self,
        handle: &PluginHandle,
        contract: &CapabilityContract,
    ) -> Result<()> {
        handle.capability(contract).map(|_| ()).map_err(|err| {
            self.emit_error(handle.identifier(), &err);
            err
        })
    }

    /// Call `symbol` on `handle`.
    ///
    /// Faults raised by the plugin, panics included, are reported as
    /// `InvocationError` with the original fault as the source.
    pub async fn invoke(
        &self,
        handle: &PluginHandle,
        symbol: &str,
        args: Vec<Value>,
    ) -> Result<Value> {
        self.invoke_with_cancel(handle, symbol, args, &CancellationToken::new())
            .await
    }

    pub async fn invoke_with_cancel(
        &self,
        handle: &PluginHandle,
        symbol: &str,
        args: Vec<Value>,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        let identifier = handle.identifier();
        let contract = CapabilityContract::new(symbol).with_arity(args.len());

        let result = match handle.capability(&contract) {
            Ok(capability) => {
                let call = async {
                    match AssertUnwindSafe(capability.call(args)).catch_unwind().await {
                        Ok(Ok(value)) => Ok(value),
                        Ok(Err(fault)) => {
                            Err(PluginError::invocation(identifier.as_str(), symbol, fault))
                        }
                        Err(payload) => Err(PluginError::invocation(
                            identifier.as_str(),
                            symbol,
                            anyhow::anyhow!("panicked: {}", panic_message(&*payload)),
                        )),
                    }
                };
                bounded(identifier, Operation::Invoke, self.invoke_timeout, cancel, call).await
            }
            Err(err) => Err(err),
        };

        match &result {
            Ok(_) => self.emit(EventKind::Invoked, identifier, symbol),
            Err(err) => self.emit_error(identifier, err),
        }
        result
    }

    /// Drop the cached handle for `identifier` and run its teardown hooks.
    ///
    /// Returns whether a handle was unloaded. Teardown failures are logged
    /// and reported as error events only.
    pub async fn unload(&self, identifier: &PluginIdentifier) -> bool {
        let slot = self.slots.lock().get(identifier).cloned();
        let Some(slot) = slot else {
            return false;
        };

        let mut cached = slot.handle.lock().await;
        let Some(handle) = cached.take() else {
            return false;
        };

        self.run_teardown(&handle);
        slot.set_state(PluginState::Unloaded);
        drop(cached);
        drop(slot);
        self.release_slot(identifier);

        self.emit(EventKind::Unloaded, identifier, handle.to_string());
        true
    }

    pub fn state(&self, identifier: &PluginIdentifier) -> PluginState {
        self.slots
            .lock()
            .get(identifier)
            .map(|slot| slot.state())
            .unwrap_or(PluginState::Unloaded)
    }

    /// Identifiers currently loaded, sorted.
    pub fn loaded(&self) -> Vec<PluginIdentifier> {
        let mut ids: Vec<_> = self
            .slots
            .lock()
            .iter()
            .filter(|(_, slot)| slot.state() == PluginState::Loaded)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Unload every loaded plugin. Meant for process exit.
    pub async fn shutdown(&self) {
        let ids = self.loaded();
        let mut unloaded = 0;
        for id in &ids {
            if self.unload(id).await {
                unloaded += 1;
            }
        }
        tracing::info!("Plugin loader shut down ({} plugin(s) unloaded)", unloaded);
    }

    fn slot(&self, identifier: &PluginIdentifier) -> Arc<Slot> {
        self.slots
            .lock()
            .entry(identifier.clone())
            .or_insert_with(|| Arc::new(Slot::new()))
            .clone()
    }

    /// Forget the slot of an unloaded identifier that no operation holds.
    ///
    /// Slots are only handed out under the map lock, so a count of one seen
    /// under that lock cannot race with a new load.
    fn release_slot(&self, identifier: &PluginIdentifier) {
        let mut slots = self.slots.lock();
        let idle = slots.get(identifier).is_some_and(|slot| {
            Arc::strong_count(slot) == 1 && slot.state() == PluginState::Unloaded
        });
        if idle {
            slots.remove(identifier);
        }
    }

    fn run_teardown(&self, handle: &PluginHandle) {
        for hook in handle.take_teardown_hooks() {
            if let Err(reason) = hook.run_guarded() {
                tracing::warn!(identifier = %handle.identifier(), "{}", reason);
                self.emit(EventKind::Error, handle.identifier(), reason);
            }
        }
    }

    fn emit(&self, kind: EventKind, identifier: &PluginIdentifier, detail: impl Into<String>) {
        self.events
            .emit(LoaderEvent::new(kind, identifier.clone(), detail));
    }

    fn emit_error(&self, identifier: &PluginIdentifier, err: &PluginError) {
        self.emit(EventKind::Error, identifier, err.to_string());
    }
}

impl Drop for PluginLoader {
    fn drop(&mut self) {
        for (identifier, slot) in self.slots.get_mut().iter() {
            // A slot still locked belongs to an operation that outlived us.
            let Ok(mut cached) = slot.handle.try_lock() else {
                continue;
            };
            if let Some(handle) = cached.take() {
                tracing::debug!(identifier = %identifier, "Tearing down plugin on drop");
                for hook in handle.take_teardown_hooks() {
                    if let Err(reason) = hook.run_guarded() {
                        tracing::warn!(identifier = %identifier, "{}", reason);
                    }
                }
                slot.set_state(PluginState::Unloaded);
            }
        }
    }
}

/// Run `work` until it completes, `cancel` fires or `timeout` elapses.
async fn bounded<T, F>(
    identifier: &PluginIdentifier,
    operation: Operation,
    timeout: Option<Duration>,
    cancel: &CancellationToken,
    work: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let timed = async {
        match timeout {
            Some(limit) => match tokio::time::timeout(limit, work).await {
                Ok(result) => result,
                Err(_) => {
                    tracing::warn!(
                        identifier = %identifier,
                        "{} timed out after {}ms",
                        operation,
                        limit.as_millis()
                    );
                    Err(PluginError::cancelled(identifier.as_str(), operation))
                }
            },
            None => work.await,
        }
    };

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(PluginError::cancelled(identifier.as_str(), operation)),
        result = timed => result,
    }
}
