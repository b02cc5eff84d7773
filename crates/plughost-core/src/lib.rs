//! Runtime plugin loader for plughost.
//!
//! Resolves plugin identifiers to modules, caches one handle per identifier,
//! validates declared capabilities and invokes them with JSON values.
//!
//! # Architecture
//!
//! ```text
//!   PluginLoader ── per-identifier slot ──> PluginHandle (cached)
//!        │                                      │
//!        │ resolve                              │ exports
//!        ▼                                      ▼
//!   ModuleResolver                        Capability / value
//!     ├─ NativeResolver  (libloading, plughost-sdk descriptor)
//!     └─ StaticResolver  (in-process factories)
//!
//!   LoaderEvent ──> EventSink (TracingSink by default)
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use plughost_core::{LoaderConfig, PluginIdentifier, PluginLoader};
//! use serde_json::json;
//!
//! # async fn run() -> plughost_core::Result<()> {
//! let config = LoaderConfig::default();
//! let loader = PluginLoader::from_config(&config);
//!
//! let id = PluginIdentifier::new("math-plugin")?;
//! let handle = loader.load(&id).await?;
//! loader.validate(&handle, "add")?;
//! let sum = loader.invoke(&handle, "add", vec![json!(1), json!(2)]).await?;
//! assert_eq!(sum, json!(3));
//!
//! loader.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod event;
pub mod handle;
pub mod identifier;
pub mod loader;
pub mod module;
pub mod resolver;
pub mod result;

pub use config::{ConfigError, LoaderConfig};
pub use error::{ErrorKind, Operation, PluginError, Result};
pub use event::{EventKind, EventSink, LoaderEvent, MemorySink, TracingSink};
pub use handle::PluginHandle;
pub use identifier::PluginIdentifier;
pub use loader::{PluginLoader, PluginState};
pub use module::{
    Capability, CapabilityContract, Export, ExportInfo, FnCapability, PluginFault, PluginInfo,
    PluginModule, TeardownHook,
};
pub use resolver::{ModuleResolver, NativeResolver, StaticResolver};
pub use result::InvocationResult;
