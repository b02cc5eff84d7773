//! Export macros for plugin crates.

/// Export a plugin descriptor from a `cdylib` crate.
///
/// Functions take `&[serde_json::Value]` and return
/// `Result<serde_json::Value, String>`. `init` (optional) has the signature
/// `fn() -> Result<(), String>`, `teardown` (optional) is `fn()`. Arity `-1`
/// accepts any number of arguments. Entries under `values` are exported but
/// not callable.
///
/// # Example
///
/// ```rust,ignore
/// use plughost_sdk::prelude::*;
///
/// fn add(args: &[Value]) -> Result<Value, String> {
///     let a = arg_i64(args, 0)?;
///     let b = arg_i64(args, 1)?;
///     Ok(json!(a + b))
/// }
///
/// declare_plugin! {
///     name: "math-plugin",
///     version: "0.1.0",
///     functions: [
///         "add" / 2 => add,
///     ],
/// }
/// ```
#[macro_export]
macro_rules! declare_plugin {
    (
        name: $name:literal,
        version: $version:literal,
        $(init: $init:path,)?
        $(teardown: $teardown:path,)?
        functions: [ $( $sym:literal / $arity:literal => $func:path ),* $(,)? ]
        $(, values: [ $( $value:literal ),* $(,)? ])?
        $(,)?
    ) => {
        const __PLUGHOST_SYMBOLS: &[$crate::abi::SymbolDescriptor] = &[
            $(
                $crate::abi::SymbolDescriptor {
                    name: $sym.as_ptr(),
                    name_len: $sym.len(),
                    arity: $arity,
                    callable: true,
                },
            )*
            $($(
                $crate::abi::SymbolDescriptor {
                    name: $value.as_ptr(),
                    name_len: $value.len(),
                    arity: 0,
                    callable: false,
                },
            )*)?
        ];

        unsafe extern "C" fn __plughost_call(
            name: *const u8,
            name_len: usize,
            args: *const u8,
            args_len: usize,
            out: *mut $crate::abi::RawBuffer,
        ) -> i32 {
            $crate::__private::dispatch(name, name_len, args, args_len, out, |symbol, args| {
                match symbol {
                    $( $sym => Some($func(args)), )*
                    _ => None,
                }
            })
        }

        #[no_mangle]
        #[allow(non_upper_case_globals)]
        pub static plughost_plugin_descriptor: $crate::abi::PluginDescriptor =
            $crate::abi::PluginDescriptor {
                abi_version: $crate::abi::ABI_VERSION,
                name: $name.as_ptr(),
                name_len: $name.len(),
                version: $version.as_ptr(),
                version_len: $version.len(),
                symbols: __PLUGHOST_SYMBOLS.as_ptr(),
                symbols_len: __PLUGHOST_SYMBOLS.len(),
                init: $crate::__plughost_optional!($({
                    unsafe extern "C" fn __plughost_init(error: *mut $crate::abi::RawBuffer) -> i32 {
                        $crate::__private::run_init(error, $init)
                    }
                    __plughost_init as $crate::abi::InitFn
                })?),
                teardown: $crate::__plughost_optional!($({
                    unsafe extern "C" fn __plughost_teardown() {
                        $crate::__private::run_teardown($teardown)
                    }
                    __plughost_teardown as $crate::abi::TeardownFn
                })?),
                call: Some(__plughost_call as $crate::abi::CallFn),
                free: Some($crate::abi::free_buffer as $crate::abi::FreeFn),
            };
    };
}

#[doc(hidden)]
#[macro_export]
macro_rules! __plughost_optional {
    () => {
        None
    };
    ($value:expr) => {
        Some($value)
    };
}
