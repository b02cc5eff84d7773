//! Plugin identifiers.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{PluginError, Result};

/// Opaque key naming a plugin: a filesystem path or a logical name.
///
/// Cheap to clone; the underlying string is never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PluginIdentifier(Arc<str>);

impl PluginIdentifier {
    /// Create an identifier. Empty or blank input cannot be resolved.
    pub fn new(value: impl AsRef<str>) -> Result<Self> {
        let value = value.as_ref().trim();
        if value.is_empty() {
            return Err(PluginError::resolution(
                "<empty>",
                "plugin identifier must not be empty",
            ));
        }
        Ok(Self(Arc::from(value)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the identifier names a filesystem location rather than a
    /// logical plugin name.
    pub fn is_path(&self) -> bool {
        let value = self.as_str();
        value.contains('/')
            || value.contains(std::path::MAIN_SEPARATOR)
            || value.ends_with(std::env::consts::DLL_SUFFIX)
            || value.starts_with('.')
    }
}

impl fmt::Display for PluginIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for PluginIdentifier {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for PluginIdentifier {
    type Err = PluginError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for PluginIdentifier {
    type Error = PluginError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<PluginIdentifier> for String {
    fn from(value: PluginIdentifier) -> Self {
        value.0.to_string()
    }
}
