//! Error taxonomy for plugin loading and invocation.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Result type for loader operations.
pub type Result<T> = std::result::Result<T, PluginError>;

/// Failure class of a [`PluginError`].
///
/// The names are stable: they prefix every error message and are what
/// [`InvocationResult`](crate::InvocationResult) reports as `kind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    ResolutionError,
    LoadError,
    MissingCapabilityError,
    InvocationError,
    CancelledError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ResolutionError => "ResolutionError",
            ErrorKind::LoadError => "LoadError",
            ErrorKind::MissingCapabilityError => "MissingCapabilityError",
            ErrorKind::InvocationError => "InvocationError",
            ErrorKind::CancelledError => "CancelledError",
        }
    }

    /// Process exit code used by the command-line front end.
    pub fn exit_code(&self) -> u8 {
        match self {
            ErrorKind::ResolutionError => 2,
            ErrorKind::LoadError => 3,
            ErrorKind::MissingCapabilityError => 4,
            ErrorKind::InvocationError => 5,
            ErrorKind::CancelledError => 6,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operation that was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Load,
    Invoke,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Load => f.write_str("load"),
            Operation::Invoke => f.write_str("invoke"),
        }
    }
}

/// Plugin error types.
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    /// The identifier could not be located.
    #[error("ResolutionError: {identifier}: {reason}")]
    Resolution { identifier: String, reason: String },

    /// The module was found but failed to initialize.
    #[error("LoadError: {identifier}: {reason}")]
    Load { identifier: String, reason: String },

    /// The required symbol is absent, not callable, or has the wrong arity.
    #[error("MissingCapabilityError: {identifier}: '{symbol}' {reason}")]
    MissingCapability {
        identifier: String,
        symbol: String,
        reason: String,
    },

    /// The plugin's callable raised. `source` is the plugin's own fault.
    #[error("InvocationError: {identifier}: '{symbol}' failed: {source:#}")]
    Invocation {
        identifier: String,
        symbol: String,
        source: anyhow::Error,
    },

    /// The caller cancelled, or the configured timeout elapsed.
    #[error("CancelledError: {identifier}: {operation} was cancelled")]
    Cancelled {
        identifier: String,
        operation: Operation,
    },
}

impl PluginError {
    pub fn resolution(identifier: impl Into<String>, reason: impl Into<String>) -> Self {
        PluginError::Resolution {
            identifier: identifier.into(),
            reason: reason.into(),
        }
    }

    pub fn load(identifier: impl Into<String>, reason: impl Into<String>) -> Self {
        PluginError::Load {
            identifier: identifier.into(),
            reason: reason.into(),
        }
    }

    pub fn missing_capability(
        identifier: impl Into<String>,
        symbol: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        PluginError::MissingCapability {
            identifier: identifier.into(),
            symbol: symbol.into(),
            reason: reason.into(),
        }
    }

    pub fn invocation(
        identifier: impl Into<String>,
        symbol: impl Into<String>,
        source: anyhow::Error,
    ) -> Self {
        PluginError::Invocation {
            identifier: identifier.into(),
            symbol: symbol.into(),
            source,
        }
    }

    pub fn cancelled(identifier: impl Into<String>, operation: Operation) -> Self {
        PluginError::Cancelled {
            identifier: identifier.into(),
            operation,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            PluginError::Resolution { .. } => ErrorKind::ResolutionError,
            PluginError::Load { .. } => ErrorKind::LoadError,
            PluginError::MissingCapability { .. } => ErrorKind::MissingCapabilityError,
            PluginError::Invocation { .. } => ErrorKind::InvocationError,
            PluginError::Cancelled { .. } => ErrorKind::CancelledError,
        }
    }

    /// Identifier the failure relates to.
    pub fn identifier(&self) -> &str {
        match self {
            PluginError::Resolution { identifier, .. }
            | PluginError::Load { identifier, .. }
            | PluginError::MissingCapability { identifier, .. }
            | PluginError::Invocation { identifier, .. }
            | PluginError::Cancelled { identifier, .. } => identifier,
        }
    }

    pub fn exit_code(&self) -> u8 {
        self.kind().exit_code()
    }
}
