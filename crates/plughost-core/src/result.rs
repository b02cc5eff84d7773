//! Outcome of a single invocation.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ErrorKind, PluginError};

/// Either the value a plugin returned or a failure descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum InvocationResult {
    Success { value: Value },
    Failure { kind: ErrorKind, message: String },
}

impl InvocationResult {
    pub fn success(value: impl Into<Value>) -> Self {
        InvocationResult::Success {
            value: value.into(),
        }
    }

    pub fn failure(error: &PluginError) -> Self {
        InvocationResult::Failure {
            kind: error.kind(),
            message: error.to_string(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, InvocationResult::Success { .. })
    }

    /// Failure kind, `None` on success.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            InvocationResult::Success { .. } => None,
            InvocationResult::Failure { kind, .. } => Some(*kind),
        }
    }

    /// Process exit code: 0 on success, the failure kind's code otherwise.
    pub fn exit_code(&self) -> u8 {
        self.kind().map(|kind| kind.exit_code()).unwrap_or(0)
    }
}

impl From<Result<Value, PluginError>> for InvocationResult {
    fn from(result: Result<Value, PluginError>) -> Self {
        match result {
            Ok(value) => InvocationResult::Success { value },
            Err(err) => InvocationResult::failure(&err),
        }
    }
}
