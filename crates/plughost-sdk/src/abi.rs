//! C ABI shared between the plughost host and native plugins.
//!
//! Every native plugin exports a static named [`DESCRIPTOR_SYMBOL`] of type
//! [`PluginDescriptor`]. All strings are UTF-8 pointer/length pairs that must
//! stay valid for as long as the library is loaded. Arguments and results
//! cross the boundary as JSON-encoded bytes.

/// Current plugin ABI version.
/// The host refuses descriptors that report a different version.
pub const ABI_VERSION: u32 = 1;

/// Name of the exported descriptor static (without the trailing NUL).
pub const DESCRIPTOR_SYMBOL: &str = "plughost_plugin_descriptor";

/// Status returned by plugin entry points on success.
pub const STATUS_OK: i32 = 0;

/// Status returned by plugin entry points on failure.
/// The output buffer then carries a UTF-8 error message.
pub const STATUS_ERROR: i32 = 1;

/// Arity value for symbols that accept any number of arguments.
pub const VARIADIC: i32 = -1;

/// Byte buffer allocated by the plugin and handed to the host.
///
/// The host must return every non-empty buffer through the descriptor's
/// `free` function so it is released by the allocator that created it.
#[repr(C)]
#[derive(Debug)]
pub struct RawBuffer {
    pub ptr: *mut u8,
    pub len: usize,
}

impl RawBuffer {
    pub const fn empty() -> Self {
        Self {
            ptr: std::ptr::null_mut(),
            len: 0,
        }
    }

    /// Leak `bytes` into a buffer owned by the caller.
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        let boxed = bytes.into_boxed_slice();
        let len = boxed.len();
        let ptr = Box::into_raw(boxed) as *mut u8;
        Self { ptr, len }
    }

    pub fn is_empty(&self) -> bool {
        self.ptr.is_null() || self.len == 0
    }

    /// Copy the buffer contents without taking ownership.
    ///
    /// # Safety
    /// `ptr` must be null or point to `len` readable bytes.
    pub unsafe fn to_vec(&self) -> Vec<u8> {
        if self.is_empty() {
            return Vec::new();
        }
        std::slice::from_raw_parts(self.ptr, self.len).to_vec()
    }
}

/// Releases a buffer created by [`RawBuffer::from_vec`].
///
/// Plugins built with [`declare_plugin!`](crate::declare_plugin) export this
/// as their `free` entry point.
///
/// # Safety
/// `buffer` must come from [`RawBuffer::from_vec`] in the same library and must
/// not be used afterwards.
pub unsafe extern "C" fn free_buffer(buffer: RawBuffer) {
    if buffer.ptr.is_null() {
        return;
    }
    let slice = std::ptr::slice_from_raw_parts_mut(buffer.ptr, buffer.len);
    drop(Box::from_raw(slice));
}

/// Called once after the library is opened. Non-zero status means the plugin
/// failed to initialize; `error` then holds the message.
pub type InitFn = unsafe extern "C" fn(error: *mut RawBuffer) -> i32;

/// Called once when the host unloads the plugin.
pub type TeardownFn = unsafe extern "C" fn();

/// Invokes the exported symbol `name` with a JSON array of arguments.
/// On success `out` holds the JSON-encoded result, otherwise an error message.
pub type CallFn = unsafe extern "C" fn(
    name: *const u8,
    name_len: usize,
    args: *const u8,
    args_len: usize,
    out: *mut RawBuffer,
) -> i32;

/// Releases a buffer returned through `init` or `call`.
pub type FreeFn = unsafe extern "C" fn(buffer: RawBuffer);

/// One entry of the plugin's export table.
#[repr(C)]
#[derive(Debug)]
pub struct SymbolDescriptor {
    pub name: *const u8,
    pub name_len: usize,
    /// Number of arguments, or [`VARIADIC`].
    pub arity: i32,
    /// Whether the symbol can be invoked through `call`.
    pub callable: bool,
}

/// Descriptor exported by every native plugin.
#[repr(C)]
#[derive(Debug)]
pub struct PluginDescriptor {
    /// Must equal [`ABI_VERSION`].
    pub abi_version: u32,

    pub name: *const u8,
    pub name_len: usize,

    /// Plugin version (semver).
    pub version: *const u8,
    pub version_len: usize,

    pub symbols: *const SymbolDescriptor,
    pub symbols_len: usize,

    pub init: Option<InitFn>,
    pub teardown: Option<TeardownFn>,
    pub call: Option<CallFn>,
    pub free: Option<FreeFn>,
}

// SAFETY: descriptors only point at immutable data baked into the library
// image; nothing behind these pointers is ever written.
unsafe impl Sync for PluginDescriptor {}
unsafe impl Sync for SymbolDescriptor {}
unsafe impl Send for PluginDescriptor {}
unsafe impl Send for SymbolDescriptor {}

impl PluginDescriptor {
    /// Borrow the symbol table.
    ///
    /// # Safety
    /// `symbols` must be null or point to `symbols_len` descriptors.
    pub unsafe fn symbol_table(&self) -> &[SymbolDescriptor] {
        if self.symbols.is_null() || self.symbols_len == 0 {
            return &[];
        }
        std::slice::from_raw_parts(self.symbols, self.symbols_len)
    }
}

/// Read a pointer/length string field.
///
/// # Safety
/// `ptr` must be null or point to `len` readable bytes.
pub unsafe fn read_str<'a>(ptr: *const u8, len: usize) -> Option<&'a str> {
    if ptr.is_null() || len == 0 {
        return None;
    }
    std::str::from_utf8(std::slice::from_raw_parts(ptr, len)).ok()
}
