//! Math Plugin
//!
//! A small native plugin used to exercise the loader end to end:
//! `add`, `sub`, a variadic `sum`, a failing `div` on zero, a blocking
//! `sleep` and a non-callable `precision` export.

use plughost_sdk::prelude::*;

fn add(args: &[Value]) -> Result<Value, String> {
    Ok(json!(arg_i64(args, 0)? + arg_i64(args, 1)?))
}

fn sub(args: &[Value]) -> Result<Value, String> {
    Ok(json!(arg_i64(args, 0)? - arg_i64(args, 1)?))
}

fn sum(args: &[Value]) -> Result<Value, String> {
    let mut total = 0.0;
    for index in 0..args.len() {
        total += arg_f64(args, index)?;
    }
    Ok(json!(total))
}

fn div(args: &[Value]) -> Result<Value, String> {
    let divisor = arg_i64(args, 1)?;
    if divisor == 0 {
        return Err("division by zero".to_string());
    }
    Ok(json!(arg_i64(args, 0)? / divisor))
}

/// Blocks the calling thread for the given number of milliseconds.
fn sleep(args: &[Value]) -> Result<Value, String> {
    let ms = arg_i64(args, 0)?;
    let ms = u64::try_from(ms).map_err(|_| format!("invalid duration: {}", ms))?;
    std::thread::sleep(std::time::Duration::from_millis(ms));
    Ok(json!(ms))
}

fn setup() -> Result<(), String> {
    if std::env::var_os("MATH_PLUGIN_FAIL_INIT").is_some() {
        return Err("MATH_PLUGIN_FAIL_INIT is set".to_string());
    }
    Ok(())
}

declare_plugin! {
    name: "math-plugin",
    version: "0.1.0",
    init: setup,
    functions: [
        "add" / 2 => add,
        "sub" / 2 => sub,
        "sum" / -1 => sum,
        "div" / 2 => div,
        "sleep" / 1 => sleep,
    ],
    values: ["precision"],
}
