//! Native plugin resolver for .so/.dylib/.dll files.
//!
//! Libraries are located on disk, checked (extension, size, optional pinned
//! SHA-256), opened with `libloading` and adapted from their exported
//! [`PluginDescriptor`] into a [`PluginModule`].

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use libloading::{Library, Symbol};
use plughost_sdk::abi::{
    read_str, PluginDescriptor, RawBuffer, ABI_VERSION, DESCRIPTOR_SYMBOL, STATUS_OK,
};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::oneshot;

use super::ModuleResolver;
use crate::config::{defaults, LoaderConfig};
use crate::error::{PluginError, Result};
use crate::identifier::PluginIdentifier;
use crate::module::{Capability, PluginFault, PluginModule};

/// Whether `path` carries the platform's dynamic library extension.
pub fn is_library_file(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some(std::env::consts::DLL_EXTENSION)
}

/// Resolver for native plugin libraries.
#[derive(Debug, Clone)]
pub struct NativeResolver {
    search_paths: Vec<PathBuf>,
    max_file_size: u64,
    checksums: HashMap<String, String>,
}

impl NativeResolver {
    /// Resolver without search paths: only path identifiers resolve.
    pub fn new() -> Self {
        Self {
            search_paths: Vec::new(),
            max_file_size: defaults::MAX_FILE_SIZE,
            checksums: HashMap::new(),
        }
    }

    pub fn from_config(config: &LoaderConfig) -> Self {
        Self {
            search_paths: config.search_paths.clone(),
            max_file_size: config.max_file_size,
            checksums: config.checksums.clone(),
        }
    }

    pub fn with_search_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.search_paths.push(path.into());
        self
    }

    pub fn with_max_file_size(mut self, bytes: u64) -> Self {
        self.max_file_size = bytes;
        self
    }

    /// Pin the SHA-256 digest (hex) of the library behind `identifier`.
    pub fn with_checksum(
        mut self,
        identifier: impl Into<String>,
        sha256: impl Into<String>,
    ) -> Self {
        self.checksums.insert(identifier.into(), sha256.into());
        self
    }

    pub fn search_paths(&self) -> &[PathBuf] {
        &self.search_paths
    }

    /// Find the library file for `identifier`.
    pub fn locate(&self, identifier: &PluginIdentifier) -> Result<PathBuf> {
        if identifier.is_path() {
            let path = absolutize(Path::new(identifier.as_str())).map_err(|e| {
                PluginError::resolution(identifier.as_str(), format!("invalid path: {}", e))
            })?;
            if !path.is_file() {
                return Err(PluginError::resolution(
                    identifier.as_str(),
                    format!("no such file: {}", path.display()),
                ));
            }
            return Ok(path);
        }

        let names = candidate_file_names(identifier.as_str());
        for dir in &self.search_paths {
            for name in &names {
                let candidate = dir.join(name);
                if candidate.is_file() {
                    return Ok(candidate);
                }
            }
        }

        let searched: Vec<String> = self
            .search_paths
            .iter()
            .map(|p| p.display().to_string())
            .collect();
        Err(PluginError::resolution(
            identifier.as_str(),
            format!("plugin not found in search paths [{}]", searched.join(", ")),
        ))
    }

    /// List library files present in the search paths.
    pub fn discover(&self) -> Vec<PathBuf> {
        let mut found = Vec::new();

        for dir in &self.search_paths {
            let Ok(entries) = std::fs::read_dir(dir) else {
                continue;
            };
            let mut libraries: Vec<PathBuf> = entries
                .flatten()
                .map(|entry| entry.path())
                .filter(|path| path.is_file() && is_library_file(path))
                .collect();
            libraries.sort();

            for path in libraries {
                if !found.contains(&path) {
                    tracing::debug!("Discovered plugin library: {}", path.display());
                    found.push(path);
                }
            }
        }

        found
    }
}

impl Default for NativeResolver {
    fn default() -> Self {
        Self::from_config(&LoaderConfig::default())
    }
}

#[async_trait]
impl ModuleResolver for NativeResolver {
    async fn resolve(&self, identifier: &PluginIdentifier) -> Result<PluginModule> {
        let path = self.locate(identifier)?;
        let check = FileCheck {
            max_file_size: self.max_file_size,
            sha256: self.checksums.get(identifier.as_str()).cloned(),
        };

        let id = identifier.clone();
        load_blocking(identifier, move || open_library(&id, &path, &check)).await
    }
}

/// Run `load` on the blocking pool.
///
/// When the caller stops waiting, a module the load still produces is torn
/// down, so every successful `init` is matched by a teardown.
async fn load_blocking<F>(identifier: &PluginIdentifier, load: F) -> Result<PluginModule>
where
    F: FnOnce() -> Result<PluginModule> + Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    let id = identifier.clone();
    tokio::task::spawn_blocking(move || {
        if let Err(Ok(module)) = tx.send(load()) {
            module.discard(&id);
        }
    });

    let mut pending = PendingLoad {
        identifier: identifier.clone(),
        rx,
    };
    (&mut pending.rx)
        .await
        .map_err(|_| PluginError::load(identifier.as_str(), "loader task panicked"))?
}

/// Receiving end of a blocking load.
struct PendingLoad {
    identifier: PluginIdentifier,
    rx: oneshot::Receiver<Result<PluginModule>>,
}

impl Drop for PendingLoad {
    fn drop(&mut self) {
        // Closing first makes a late send fail, so the loader thread discards
        // the module itself; anything already sent is discarded here.
        self.rx.close();
        if let Ok(Ok(module)) = self.rx.try_recv() {
            module.discard(&self.identifier);
        }
    }
}

struct FileCheck {
    max_file_size: u64,
    sha256: Option<String>,
}

impl FileCheck {
    fn verify(&self, identifier: &PluginIdentifier, path: &Path) -> Result<()> {
        let fail = |reason: String| PluginError::load(identifier.as_str(), reason);

        if !is_library_file(path) {
            return Err(fail(format!(
                "{} is not a native library (expected .{})",
                path.display(),
                std::env::consts::DLL_EXTENSION
            )));
        }

        let metadata = std::fs::metadata(path)
            .map_err(|e| fail(format!("cannot stat {}: {}", path.display(), e)))?;
        if metadata.len() > self.max_file_size {
            return Err(fail(format!(
                "library is {} bytes, limit is {}",
                metadata.len(),
                self.max_file_size
            )));
        }

        if let Some(expected) = &self.sha256 {
            let bytes = std::fs::read(path)
                .map_err(|e| fail(format!("cannot read {}: {}", path.display(), e)))?;
            let actual = hex::encode(Sha256::digest(&bytes));
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(fail(format!(
                    "checksum mismatch: expected {}, got {}",
                    expected, actual
                )));
            }
        }

        Ok(())
    }
}

fn open_library(
    identifier: &PluginIdentifier,
    path: &Path,
    check: &FileCheck,
) -> Result<PluginModule> {
    check.verify(identifier, path)?;

    tracing::debug!("Opening native plugin {}", path.display());
    let library = unsafe { Library::new(path) }.map_err(|e| {
        PluginError::load(
            identifier.as_str(),
            format!("failed to open {}: {}", path.display(), e),
        )
    })?;

    let descriptor: *const PluginDescriptor = unsafe {
        let symbol: Symbol<*const PluginDescriptor> =
            library.get(DESCRIPTOR_SYMBOL.as_bytes()).map_err(|e| {
                PluginError::load(
                    identifier.as_str(),
                    format!("missing {} export: {}", DESCRIPTOR_SYMBOL, e),
                )
            })?;
        *symbol
    };
    if descriptor.is_null() {
        return Err(PluginError::load(
            identifier.as_str(),
            format!("{} is null", DESCRIPTOR_SYMBOL),
        ));
    }

    build_module(
        identifier,
        Arc::new(NativeLibrary {
            descriptor,
            _library: Some(library),
        }),
    )
}

/// Adapt a descriptor that is already linked into the current process.
///
/// Runs the descriptor's `init` entry point, exactly as loading it from a
/// library would.
pub fn module_from_descriptor(
    identifier: &PluginIdentifier,
    descriptor: &'static PluginDescriptor,
) -> Result<PluginModule> {
    build_module(
        identifier,
        Arc::new(NativeLibrary {
            descriptor,
            _library: None,
        }),
    )
}

/// An open plugin library and its descriptor.
///
/// Shared by every capability and the teardown hook; the library is closed
/// when the last of them is dropped.
struct NativeLibrary {
    descriptor: *const PluginDescriptor,
    _library: Option<Library>,
}

// SAFETY: the descriptor points into the library image, which stays mapped
// while `_library` is alive, and the host never writes through it. Whether the
// plugin's entry points tolerate concurrent calls is the plugin's contract.
unsafe impl Send for NativeLibrary {}
unsafe impl Sync for NativeLibrary {}

impl NativeLibrary {
    fn descriptor(&self) -> &PluginDescriptor {
        // SAFETY: non-null and valid for the lifetime of `self`, see above.
        unsafe { &*self.descriptor }
    }

    /// Copy a plugin-owned buffer and hand it back to the plugin.
    fn take_buffer(&self, buffer: RawBuffer) -> Vec<u8> {
        let bytes = unsafe { buffer.to_vec() };
        if !buffer.ptr.is_null() {
            if let Some(free) = self.descriptor().free {
                unsafe { free(buffer) };
            }
        }
        bytes
    }

    fn call(&self, symbol: &str, args: &[u8]) -> anyhow::Result<Value> {
        let call = self
            .descriptor()
            .call
            .context("plugin has no call entry point")?;

        let mut out = RawBuffer::empty();
        let status = unsafe {
            call(
                symbol.as_ptr(),
                symbol.len(),
                args.as_ptr(),
                args.len(),
                &mut out,
            )
        };
        let bytes = self.take_buffer(out);

        if status != STATUS_OK {
            anyhow::bail!("{}", String::from_utf8_lossy(&bytes));
        }
        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&bytes).context("plugin returned invalid JSON")
    }
}

fn build_module(
    identifier: &PluginIdentifier,
    library: Arc<NativeLibrary>,
) -> Result<PluginModule> {
    let fail = |reason: String| PluginError::load(identifier.as_str(), reason);
    let desc = library.descriptor();

    if desc.abi_version != ABI_VERSION {
        return Err(fail(format!(
            "plugin ABI version {} is not supported (expected {})",
            desc.abi_version, ABI_VERSION
        )));
    }

    let name = unsafe { read_str(desc.name, desc.name_len) }
        .ok_or_else(|| fail("descriptor name is missing or not valid UTF-8".to_string()))?;
    let version = unsafe { read_str(desc.version, desc.version_len) }
        .ok_or_else(|| fail("descriptor version is missing or not valid UTF-8".to_string()))?;
    let version = semver::Version::parse(version)
        .map_err(|e| fail(format!("invalid plugin version '{}': {}", version, e)))?;

    let mut module = PluginModule::new(name, version);

    for symbol in unsafe { desc.symbol_table() } {
        let symbol_name = unsafe { read_str(symbol.name, symbol.name_len) }
            .ok_or_else(|| fail("symbol name is missing or not valid UTF-8".to_string()))?;

        if !symbol.callable {
            module = module.with_value(symbol_name, Value::Null);
            continue;
        }
        if desc.call.is_none() {
            return Err(fail(format!(
                "'{}' is callable but the plugin has no call entry point",
                symbol_name
            )));
        }

        let capability = NativeCapability {
            library: library.clone(),
            symbol: symbol_name.to_string(),
            arity: usize::try_from(symbol.arity).ok(),
        };
        module = module.with_capability(symbol_name, Arc::new(capability));
    }

    if let Some(init) = desc.init {
        let mut error = RawBuffer::empty();
        let status = unsafe { init(&mut error) };
        let message = library.take_buffer(error);
        if status != STATUS_OK {
            let message = String::from_utf8_lossy(&message);
            return Err(fail(if message.is_empty() {
                format!("plugin init failed with status {}", status)
            } else {
                format!("plugin init failed: {}", message)
            }));
        }
    }

    if let Some(teardown) = desc.teardown {
        let library = library.clone();
        module = module.with_teardown(format!("{} teardown", name), move || {
            unsafe { teardown() };
            drop(library);
            Ok(())
        });
    }

    tracing::debug!(
        plugin = %module.info().name,
        version = %module.info().version,
        exports = module.exports().len(),
        "Native plugin initialized"
    );
    Ok(module)
}

/// A callable export of a native plugin.
struct NativeCapability {
    library: Arc<NativeLibrary>,
    symbol: String,
    arity: Option<usize>,
}

#[async_trait]
impl Capability for NativeCapability {
    fn arity(&self) -> Option<usize> {
        self.arity
    }

    async fn call(&self, args: Vec<Value>) -> std::result::Result<Value, PluginFault> {
        let payload = serde_json::to_vec(&Value::Array(args))?;
        let library = self.library.clone();
        let symbol = self.symbol.clone();

        tokio::task::spawn_blocking(move || library.call(&symbol, &payload))
            .await
            .context("plugin call task failed")?
    }
}

/// File names tried for a logical plugin name, in order.
fn candidate_file_names(name: &str) -> Vec<String> {
    use std::env::consts::{DLL_PREFIX, DLL_SUFFIX};

    let underscored = name.replace('-', "_");
    let mut names = vec![
        format!("{}{}{}", DLL_PREFIX, name, DLL_SUFFIX),
        format!("{}{}{}", DLL_PREFIX, underscored, DLL_SUFFIX),
        format!("{}{}", name, DLL_SUFFIX),
        format!("{}{}", underscored, DLL_SUFFIX),
    ];
    let mut seen = Vec::new();
    names.retain(|n| {
        let fresh = !seen.contains(n);
        seen.push(n.clone());
        fresh
    });
    names
}

/// Make `path` absolute against the working directory and drop `.`/`..`.
fn absolutize(path: &Path) -> std::io::Result<PathBuf> {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };

    let mut normalized = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    Ok(normalized)
}
