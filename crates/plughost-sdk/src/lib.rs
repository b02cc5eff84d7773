//! plughost plugin SDK
//!
//! Everything a native plugin needs: the C ABI shared with the host and the
//! [`declare_plugin!`] macro that exports a descriptor from a `cdylib`.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use plughost_sdk::prelude::*;
//!
//! fn add(args: &[Value]) -> Result<Value, String> {
//!     Ok(json!(arg_i64(args, 0)? + arg_i64(args, 1)?))
//! }
//!
//! declare_plugin! {
//!     name: "math-plugin",
//!     version: "0.1.0",
//!     functions: [
//!         "add" / 2 => add,
//!     ],
//! }
//! ```

pub mod abi;
pub mod macros;

pub use abi::{
    ABI_VERSION, CallFn, DESCRIPTOR_SYMBOL, FreeFn, InitFn, PluginDescriptor, RawBuffer,
    STATUS_ERROR, STATUS_OK, SymbolDescriptor, TeardownFn, VARIADIC,
};

use serde_json::Value;

/// Prelude module with common imports
pub mod prelude {
    pub use crate::declare_plugin;
    pub use crate::{arg, arg_f64, arg_i64, arg_str};
    pub use serde_json::{Value, json};
}

/// Fetch argument `index`, failing with a readable message.
pub fn arg(args: &[Value], index: usize) -> Result<&Value, String> {
    args.get(index)
        .ok_or_else(|| format!("missing argument #{}", index))
}

pub fn arg_i64(args: &[Value], index: usize) -> Result<i64, String> {
    let value = arg(args, index)?;
    value
        .as_i64()
        .ok_or_else(|| format!("argument #{} must be an integer, got {}", index, value))
}

pub fn arg_f64(args: &[Value], index: usize) -> Result<f64, String> {
    let value = arg(args, index)?;
    value
        .as_f64()
        .ok_or_else(|| format!("argument #{} must be a number, got {}", index, value))
}

pub fn arg_str(args: &[Value], index: usize) -> Result<&str, String> {
    let value = arg(args, index)?;
    value
        .as_str()
        .ok_or_else(|| format!("argument #{} must be a string, got {}", index, value))
}

/// Runtime support for the code generated by [`declare_plugin!`].
#[doc(hidden)]
pub mod __private {
    use std::panic::{AssertUnwindSafe, catch_unwind};

    use serde_json::Value;

    use crate::abi::{RawBuffer, STATUS_ERROR, STATUS_OK, read_str};

    fn write_out(out: *mut RawBuffer, bytes: Vec<u8>) {
        if out.is_null() {
            return;
        }
        // SAFETY: the host passes a valid, writable buffer slot.
        unsafe { *out = RawBuffer::from_vec(bytes) };
    }

    fn fail(out: *mut RawBuffer, message: String) -> i32 {
        write_out(out, message.into_bytes());
        STATUS_ERROR
    }

    fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
        if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic".to_string()
        }
    }

    /// Decode the call, run `handler` and encode its outcome into `out`.
    ///
    /// # Safety
    /// Pointer arguments must satisfy the [`CallFn`](crate::abi::CallFn) contract.
    pub unsafe fn dispatch<F>(
        name: *const u8,
        name_len: usize,
        args: *const u8,
        args_len: usize,
        out: *mut RawBuffer,
        handler: F,
    ) -> i32
    where
        F: FnOnce(&str, &[Value]) -> Option<Result<Value, String>>,
    {
        let Some(symbol) = read_str(name, name_len) else {
            return fail(out, "symbol name is missing or not valid UTF-8".to_string());
        };

        let args: Vec<Value> = if args.is_null() || args_len == 0 {
            Vec::new()
        } else {
            let bytes = std::slice::from_raw_parts(args, args_len);
            match serde_json::from_slice(bytes) {
                Ok(Value::Array(items)) => items,
                Ok(other) => vec![other],
                Err(e) => return fail(out, format!("invalid arguments: {}", e)),
            }
        };

        let outcome = catch_unwind(AssertUnwindSafe(|| handler(symbol, &args)));
        match outcome {
            Ok(Some(Ok(value))) => match serde_json::to_vec(&value) {
                Ok(bytes) => {
                    write_out(out, bytes);
                    STATUS_OK
                }
                Err(e) => fail(out, format!("failed to encode result: {}", e)),
            },
            Ok(Some(Err(message))) => fail(out, message),
            Ok(None) => fail(out, format!("unknown symbol '{}'", symbol)),
            Err(payload) => fail(out, format!("panicked: {}", panic_message(payload))),
        }
    }

    /// # Safety
    /// `error` must be null or a valid, writable buffer slot.
    pub unsafe fn run_init(error: *mut RawBuffer, init: fn() -> Result<(), String>) -> i32 {
        match catch_unwind(init) {
            Ok(Ok(())) => STATUS_OK,
            Ok(Err(message)) => fail(error, message),
            Err(payload) => fail(error, format!("panicked: {}", panic_message(payload))),
        }
    }

    pub fn run_teardown(teardown: fn()) {
        // Unwinding into the host is undefined behaviour.
        let _ = catch_unwind(teardown);
    }
}
