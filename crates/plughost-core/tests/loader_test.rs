//! Plugin Loader Tests
//!
//! Lifecycle and failure semantics of `PluginLoader` over in-process modules:
//! - Caching and concurrent load coalescing
//! - Unload / reload and teardown hooks
//! - Error classification
//! - Cancellation and timeouts
//! - Loader events

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use plughost_core::{
    CapabilityContract, ErrorKind, EventKind, InvocationResult, MemorySink, ModuleResolver,
    PluginError, PluginIdentifier, PluginLoader, PluginModule, PluginState, StaticResolver,
    TeardownHook,
};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

fn id(s: &str) -> PluginIdentifier {
    PluginIdentifier::new(s).unwrap()
}

fn math_module() -> PluginModule {
    PluginModule::new("math-plugin", semver::Version::new(0, 1, 0))
        .with_sync_function("add", Some(2), |args| {
            let a = args[0].as_i64().unwrap_or_default();
            let b = args[1].as_i64().unwrap_or_default();
            Ok(json!(a + b))
        })
        .with_sync_function("div", Some(2), |args| {
            let a = args[0].as_i64().unwrap_or_default();
            let b = args[1].as_i64().unwrap_or_default();
            if b == 0 {
                anyhow::bail!("division by zero");
            }
            Ok(json!(a / b))
        })
        .with_sync_function("explode", None, |_| panic!("kaboom"))
        .with_function("slow", Some(0), |_| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(Value::Null)
        })
        .with_value("precision", json!(2))
}

/// Counts resolutions and optionally delays the first one.
struct CountingResolver {
    inner: StaticResolver,
    calls: AtomicUsize,
    first_delay: Duration,
}

impl CountingResolver {
    fn new(inner: StaticResolver) -> Self {
        Self {
            inner,
            calls: AtomicUsize::new(0),
            first_delay: Duration::ZERO,
        }
    }

    fn with_first_delay(mut self, delay: Duration) -> Self {
        self.first_delay = delay;
        self
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModuleResolver for CountingResolver {
    async fn resolve(&self, identifier: &PluginIdentifier) -> plughost_core::Result<PluginModule> {
        let previous = self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = if previous == 0 {
            self.first_delay
        } else {
            Duration::ZERO
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.inner.resolve(identifier).await
    }
}

fn math_resolver() -> Arc<CountingResolver> {
    let registry = StaticResolver::new().with_module(id("math-plugin"), || Ok(math_module()));
    Arc::new(CountingResolver::new(registry))
}

#[tokio::test]
async fn test_load_is_idempotent() {
    let resolver = math_resolver();
    let loader = PluginLoader::new(resolver.clone());

    let first = loader.load(&id("math-plugin")).await.unwrap();
    let second = loader.load(&id("math-plugin")).await.unwrap();

    assert!(first.ptr_eq(&second));
    assert_eq!(resolver.calls(), 1);
    assert_eq!(loader.state(&id("math-plugin")), PluginState::Loaded);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_loads_coalesce() {
    let registry = StaticResolver::new().with_module(id("math-plugin"), || Ok(math_module()));
    let resolver =
        Arc::new(CountingResolver::new(registry).with_first_delay(Duration::from_millis(100)));
    let loader = Arc::new(PluginLoader::new(resolver.clone()));

    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let loader = loader.clone();
            tokio::spawn(async move { loader.load(&id("math-plugin")).await })
        })
        .collect();

    let mut handles = Vec::new();
    for task in tasks {
        handles.push(task.await.unwrap().unwrap());
    }

    assert_eq!(resolver.calls(), 1);
    assert!(handles.iter().all(|h| h.ptr_eq(&handles[0])));
}

#[tokio::test]
async fn test_loading_state_is_observable() {
    let registry = StaticResolver::new().with_module(id("math-plugin"), || Ok(math_module()));
    let resolver =
        Arc::new(CountingResolver::new(registry).with_first_delay(Duration::from_millis(200)));
    let loader = Arc::new(PluginLoader::new(resolver));

    let background = {
        let loader = loader.clone();
        tokio::spawn(async move { loader.load(&id("math-plugin")).await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(loader.state(&id("math-plugin")), PluginState::Loading);

    background.await.unwrap().unwrap();
    assert_eq!(loader.state(&id("math-plugin")), PluginState::Loaded);
}

#[tokio::test]
async fn test_unload_then_reload_resolves_again() {
    let resolver = math_resolver();
    let loader = PluginLoader::new(resolver.clone());

    let first = loader.load(&id("math-plugin")).await.unwrap();
    assert!(loader.unload(&id("math-plugin")).await);
    assert_eq!(loader.state(&id("math-plugin")), PluginState::Unloaded);

    let second = loader.load(&id("math-plugin")).await.unwrap();
    assert_eq!(resolver.calls(), 2);
    assert!(!first.ptr_eq(&second));
}

#[tokio::test]
async fn test_unknown_identifier_is_resolution_error() {
    let loader = PluginLoader::new(math_resolver());

    let err = loader.load(&id("does-not-exist")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ResolutionError);
    assert!(err.to_string().starts_with("ResolutionError: does-not-exist"));
    assert_eq!(loader.state(&id("does-not-exist")), PluginState::Unloaded);
}

#[tokio::test]
async fn test_missing_capability() {
    let registry = StaticResolver::new().with_module(id("empty"), || {
        Ok(PluginModule::new("empty", semver::Version::new(1, 0, 0)))
    });
    let loader = PluginLoader::new(registry);

    let handle = loader.load(&id("empty")).await.unwrap();
    let err = loader.validate(&handle, "add").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MissingCapabilityError);
}

#[tokio::test]
async fn test_non_callable_and_arity_mismatch() {
    let loader = PluginLoader::new(math_resolver());
    let handle = loader.load(&id("math-plugin")).await.unwrap();

    let err = loader.validate(&handle, "precision").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MissingCapabilityError);
    assert!(err.to_string().contains("not callable"));

    let contract = CapabilityContract::new("add").with_arity(3);
    let err = loader.validate_contract(&handle, &contract).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MissingCapabilityError);

    let err = loader
        .invoke(&handle, "add", vec![json!(1)])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MissingCapabilityError);

    // Variadic capabilities accept any argument count.
    loader
        .validate_contract(&handle, &CapabilityContract::new("explode").with_arity(7))
        .unwrap();
}

#[tokio::test]
async fn test_end_to_end_add() {
    let loader = PluginLoader::new(math_resolver());

    let handle = loader.load(&id("math-plugin")).await.unwrap();
    loader.validate(&handle, "add").unwrap();
    let result: InvocationResult = loader
        .invoke(&handle, "add", vec![json!(1), json!(2)])
        .await
        .into();

    assert_eq!(result, InvocationResult::success(3));
}

#[tokio::test]
async fn test_init_failure_is_load_error_and_retries() {
    let fail = Arc::new(AtomicBool::new(true));
    let registry = StaticResolver::new();
    {
        let fail = fail.clone();
        registry.register(id("flaky"), move || {
            if fail.load(Ordering::SeqCst) {
                anyhow::bail!("setup failed");
            }
            Ok(math_module())
        });
    }
    let resolver = Arc::new(CountingResolver::new(registry));
    let loader = PluginLoader::new(resolver.clone());

    let err = loader.load(&id("flaky")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::LoadError);
    assert!(err.to_string().contains("setup failed"));
    assert_eq!(loader.state(&id("flaky")), PluginState::Unloaded);

    fail.store(false, Ordering::SeqCst);
    let handle = loader.load(&id("flaky")).await.unwrap();
    assert_eq!(handle.info().name, "math-plugin");
    assert_eq!(resolver.calls(), 2);
}

#[tokio::test]
async fn test_unload_never_loaded_is_noop() {
    let loader = PluginLoader::new(math_resolver());
    assert!(!loader.unload(&id("never-loaded")).await);
    assert!(!loader.unload(&id("never-loaded")).await);
}

#[tokio::test]
async fn test_plugin_fault_is_invocation_error() {
    let loader = PluginLoader::new(math_resolver());
    let handle = loader.load(&id("math-plugin")).await.unwrap();

    let err = loader
        .invoke(&handle, "div", vec![json!(1), json!(0)])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvocationError);
    match &err {
        PluginError::Invocation { symbol, source, .. } => {
            assert_eq!(symbol, "div");
            assert_eq!(source.to_string(), "division by zero");
        }
        other => panic!("unexpected error: {:?}", other),
    }

    // The loader is untouched by plugin faults.
    assert_eq!(loader.state(&id("math-plugin")), PluginState::Loaded);
}

#[tokio::test]
async fn test_plugin_panic_is_invocation_error() {
    let loader = PluginLoader::new(math_resolver());
    let handle = loader.load(&id("math-plugin")).await.unwrap();

    let err = loader.invoke(&handle, "explode", vec![]).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvocationError);
    assert!(err.to_string().contains("kaboom"));

    let value = loader
        .invoke(&handle, "add", vec![json!(2), json!(2)])
        .await
        .unwrap();
    assert_eq!(value, json!(4));
}

#[tokio::test]
async fn test_cancelled_load_rolls_back() {
    let registry = StaticResolver::new().with_module(id("math-plugin"), || Ok(math_module()));
    let resolver =
        Arc::new(CountingResolver::new(registry).with_first_delay(Duration::from_secs(30)));
    let loader = PluginLoader::new(resolver.clone());

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let err = loader
        .load_with_cancel(&id("math-plugin"), &cancel)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CancelledError);
    assert_eq!(loader.state(&id("math-plugin")), PluginState::Unloaded);

    // A later load retries cleanly.
    let handle = loader.load(&id("math-plugin")).await.unwrap();
    assert_eq!(handle.info().name, "math-plugin");
    assert_eq!(resolver.calls(), 2);
}

#[tokio::test]
async fn test_load_timeout_is_cancellation() {
    let registry = StaticResolver::new().with_module(id("math-plugin"), || Ok(math_module()));
    let resolver =
        Arc::new(CountingResolver::new(registry).with_first_delay(Duration::from_secs(30)));
    let loader = PluginLoader::new(resolver).with_load_timeout(Duration::from_millis(50));

    let err = loader.load(&id("math-plugin")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CancelledError);
    assert_eq!(loader.state(&id("math-plugin")), PluginState::Unloaded);

    assert!(loader.load(&id("math-plugin")).await.is_ok());
}

#[tokio::test]
async fn test_invoke_timeout_and_cancel() {
    let loader =
        PluginLoader::new(math_resolver()).with_invoke_timeout(Duration::from_millis(50));
    let handle = loader.load(&id("math-plugin")).await.unwrap();

    let err = loader.invoke(&handle, "slow", vec![]).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CancelledError);

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = loader
        .invoke_with_cancel(&handle, "add", vec![json!(1), json!(2)], &cancel)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CancelledError);
}

#[tokio::test]
async fn test_teardown_hooks_run_once_on_unload() {
    let runs = Arc::new(AtomicUsize::new(0));
    let registry = StaticResolver::new();
    {
        let runs = runs.clone();
        registry.register(id("math-plugin"), move || {
            let runs = runs.clone();
            Ok(math_module()
                .with_teardown("failing", || anyhow::bail!("close failed"))
                .with_teardown("count", move || {
                    runs.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }))
        });
    }
    let sink = MemorySink::new();
    let loader = PluginLoader::new(registry).with_event_sink(sink.clone());

    let handle = loader.load(&id("math-plugin")).await.unwrap();
    let extra = runs.clone();
    handle.add_teardown_hook(TeardownHook::new("extra", move || {
        extra.fetch_add(10, Ordering::SeqCst);
        Ok(())
    }));

    // A failing hook does not fail the unload or stop later hooks.
    assert!(loader.unload(&id("math-plugin")).await);
    assert_eq!(runs.load(Ordering::SeqCst), 11);
    assert!(!loader.unload(&id("math-plugin")).await);
    assert_eq!(runs.load(Ordering::SeqCst), 11);

    let errors = sink.of_kind(EventKind::Error);
    assert_eq!(errors.len(), 1);
    assert!(errors[0].detail.contains("close failed"));
}

#[tokio::test]
async fn test_shutdown_unloads_everything() {
    let runs = Arc::new(AtomicUsize::new(0));
    let registry = StaticResolver::new();
    for name in ["a", "b", "c"] {
        let runs = runs.clone();
        registry.register(id(name), move || {
            let runs = runs.clone();
            Ok(math_module().with_teardown("count", move || {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }))
        });
    }
    let loader = PluginLoader::new(registry);

    for name in ["a", "b", "c"] {
        loader.load(&id(name)).await.unwrap();
    }
    assert_eq!(loader.loaded(), vec![id("a"), id("b"), id("c")]);

    loader.shutdown().await;
    assert!(loader.loaded().is_empty());
    assert_eq!(runs.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_drop_runs_pending_teardown() {
    let ran = Arc::new(AtomicBool::new(false));
    let registry = StaticResolver::new();
    {
        let ran = ran.clone();
        registry.register(id("math-plugin"), move || {
            let ran = ran.clone();
            Ok(math_module().with_teardown("flag", move || {
                ran.store(true, Ordering::SeqCst);
                Ok(())
            }))
        });
    }

    let loader = PluginLoader::new(registry);
    loader.load(&id("math-plugin")).await.unwrap();
    drop(loader);

    assert!(ran.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_events_are_emitted() {
    let sink = MemorySink::new();
    let loader = PluginLoader::new(math_resolver()).with_event_sink(sink.clone());

    let handle = loader.load(&id("math-plugin")).await.unwrap();
    loader
        .invoke(&handle, "add", vec![json!(1), json!(2)])
        .await
        .unwrap();
    let _ = loader.load(&id("missing")).await;
    loader.unload(&id("math-plugin")).await;

    let kinds: Vec<EventKind> = sink.events().iter().map(|e| e.event).collect();
    assert_eq!(
        kinds,
        vec![
            EventKind::Loaded,
            EventKind::Invoked,
            EventKind::Error,
            EventKind::Unloaded
        ]
    );

    let invoked = &sink.of_kind(EventKind::Invoked)[0];
    assert_eq!(invoked.identifier, id("math-plugin"));
    assert_eq!(invoked.detail, "add");
    assert_eq!(sink.of_kind(EventKind::Error)[0].identifier, id("missing"));
}

#[tokio::test]
async fn test_unrelated_identifiers_do_not_block() {
    let registry = StaticResolver::new()
        .with_module(id("slow"), || Ok(math_module()))
        .with_module(id("fast"), || Ok(math_module()));
    let resolver =
        Arc::new(CountingResolver::new(registry).with_first_delay(Duration::from_secs(30)));
    let loader = Arc::new(PluginLoader::new(resolver));

    let cancel = CancellationToken::new();
    let slow = {
        let loader = loader.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { loader.load_with_cancel(&id("slow"), &cancel).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let fast = tokio::time::timeout(Duration::from_secs(5), loader.load(&id("fast")))
        .await
        .expect("fast load must not wait for the slow one");
    assert!(fast.is_ok());

    cancel.cancel();
    let err = slow.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CancelledError);
}
