//! Command-line interface for the plughost plugin loader.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use plughost_core::config::env_vars;
use plughost_core::{
    InvocationResult, LoaderConfig, NativeResolver, PluginIdentifier, PluginLoader,
};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

/// plughost - load native plugins and call their exports.
#[derive(Parser, Debug)]
#[command(name = "plughost")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Action to perform.
    #[command(subcommand)]
    command: Command,

    /// Verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (default: ~/.plughost/config.toml).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Extra plugin search directory, searched first. Repeatable.
    #[arg(short = 'p', long = "plugin-path", global = true)]
    plugin_paths: Vec<PathBuf>,

    /// Give up loading after this many milliseconds.
    #[arg(long, global = true)]
    load_timeout_ms: Option<u64>,

    /// Give up invoking after this many milliseconds.
    #[arg(long, global = true)]
    invoke_timeout_ms: Option<u64>,
}

/// Available commands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Load a plugin, call one of its exports and print the result as JSON.
    Run {
        /// Plugin path or name.
        identifier: String,
        /// Exported symbol to call.
        symbol: String,
        /// Arguments; each is parsed as JSON, otherwise passed as a string.
        #[arg(allow_negative_numbers = true)]
        args: Vec<String>,
    },
    /// Load a plugin and print its exports.
    Inspect {
        /// Plugin path or name.
        identifier: String,
    },
    /// List plugin libraries found in the search paths.
    List,
}

fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::from(1)
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    init_logging(args.verbose);

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to start async runtime: {}", e);
            return ExitCode::from(1);
        }
    };
    let outcome = runtime.block_on(run(args));
    // Native calls abandoned by a cancel or timeout may still be running on
    // the blocking pool. Exit without waiting for them.
    runtime.shutdown_background();

    match outcome {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(1)
        }
    }
}

fn init_logging(verbose: bool) {
    // Check if JSON logging is requested
    let json_logging = std::env::var(env_vars::LOG_JSON)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(false);

    let default_level = if verbose { "debug" } else { "info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("warn,plughost={}", default_level))
    });

    // stdout carries results only
    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .compact()
            .init();
    }
}

async fn run(args: Args) -> Result<u8> {
    let config = build_config(&args)?;
    tracing::debug!(?config, "Configuration loaded");

    let loader = PluginLoader::from_config(&config);
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupted, cancelling");
                cancel.cancel();
            }
        });
    }

    let result = match args.command {
        Command::Run {
            identifier,
            symbol,
            args,
        } => run_plugin(&loader, &cancel, &identifier, &symbol, &args).await,
        Command::Inspect { identifier } => inspect_plugin(&loader, &cancel, &identifier).await,
        Command::List => Ok(list_plugins(&config)),
    };

    loader.shutdown().await;
    result
}

fn build_config(args: &Args) -> Result<LoaderConfig> {
    let mut config =
        LoaderConfig::load(args.config.as_deref()).context("Failed to load configuration")?;

    for path in args.plugin_paths.iter().rev() {
        config.prepend_search_path(path.clone());
    }
    if let Some(ms) = args.load_timeout_ms {
        config.load_timeout_ms = Some(ms);
    }
    if let Some(ms) = args.invoke_timeout_ms {
        config.invoke_timeout_ms = Some(ms);
    }

    Ok(config)
}

/// JSON when it parses, otherwise the raw string.
fn parse_arg(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

async fn run_plugin(
    loader: &PluginLoader,
    cancel: &CancellationToken,
    identifier: &str,
    symbol: &str,
    raw_args: &[String],
) -> Result<u8> {
    let args: Vec<Value> = raw_args.iter().map(String::as_str).map(parse_arg).collect();
    let result = InvocationResult::from(call(loader, cancel, identifier, symbol, args).await);

    println!("{}", serde_json::to_string(&result)?);
    Ok(result.exit_code())
}

async fn call(
    loader: &PluginLoader,
    cancel: &CancellationToken,
    identifier: &str,
    symbol: &str,
    args: Vec<Value>,
) -> plughost_core::Result<Value> {
    let id = PluginIdentifier::new(identifier)?;
    let handle = loader.load_with_cancel(&id, cancel).await?;
    loader.validate(&handle, symbol)?;
    loader.invoke_with_cancel(&handle, symbol, args, cancel).await
}

async fn inspect_plugin(
    loader: &PluginLoader,
    cancel: &CancellationToken,
    identifier: &str,
) -> Result<u8> {
    let loaded = match PluginIdentifier::new(identifier) {
        Ok(id) => loader.load_with_cancel(&id, cancel).await,
        Err(e) => Err(e),
    };

    match loaded {
        Ok(handle) => {
            let report = json!({
                "identifier": handle.identifier(),
                "name": handle.info().name,
                "version": handle.info().version.to_string(),
                "loaded_at": handle.loaded_at().to_rfc3339(),
                "exports": handle.exports(),
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(0)
        }
        Err(e) => {
            let result = InvocationResult::failure(&e);
            println!("{}", serde_json::to_string(&result)?);
            Ok(result.exit_code())
        }
    }
}

fn list_plugins(config: &LoaderConfig) -> u8 {
    let resolver = NativeResolver::from_config(config);
    let found = resolver.discover();

    if found.is_empty() {
        eprintln!("No plugins found in search paths:");
        for path in resolver.search_paths() {
            eprintln!("  {}", path.display());
        }
        return 0;
    }

    for path in found {
        println!("{}", path.display());
    }
    0
}
