//! Loader configuration.
//!
//! Values are layered: built-in defaults, then a TOML file, then environment
//! variables. Command-line flags are applied on top by the binary.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Environment variable names.
pub mod env_vars {
    /// Extra plugin search directories, in the platform's `PATH` format.
    pub const PLUGIN_PATH: &str = "PLUGHOST_PLUGIN_PATH";
    pub const LOAD_TIMEOUT_MS: &str = "PLUGHOST_LOAD_TIMEOUT_MS";
    pub const INVOKE_TIMEOUT_MS: &str = "PLUGHOST_INVOKE_TIMEOUT_MS";
    pub const LOG_JSON: &str = "PLUGHOST_LOG_JSON";
}

/// Default values.
pub mod defaults {
    pub const MAX_FILE_SIZE: u64 = 100 * 1024 * 1024;
    pub const HOME_DIR_NAME: &str = ".plughost";
    pub const CONFIG_FILE_NAME: &str = "config.toml";
    pub const PLUGIN_DIR_NAME: &str = "plugins";
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid value for {name}: {value}")]
    InvalidEnv { name: &'static str, value: String },

    #[error("Invalid checksum for {identifier}: expected 64 hex characters")]
    InvalidChecksum { identifier: String },
}

/// Plugin loader configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Directories searched for plugins named by logical name.
    pub search_paths: Vec<PathBuf>,

    /// Upper bound for a single load, in milliseconds.
    pub load_timeout_ms: Option<u64>,

    /// Upper bound for a single invocation, in milliseconds.
    pub invoke_timeout_ms: Option<u64>,

    /// Largest plugin library accepted, in bytes.
    pub max_file_size: u64,

    /// Pinned SHA-256 digests (hex) keyed by plugin identifier.
    pub checksums: HashMap<String, String>,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        let mut search_paths = Vec::new();
        if let Some(home) = home_dir() {
            search_paths.push(home.join(defaults::PLUGIN_DIR_NAME));
        }
        search_paths.push(PathBuf::from("."));

        Self {
            search_paths,
            load_timeout_ms: None,
            invoke_timeout_ms: None,
            max_file_size: defaults::MAX_FILE_SIZE,
            checksums: HashMap::new(),
        }
    }
}

/// `~/.plughost`, when a home directory is known.
pub fn home_dir() -> Option<PathBuf> {
    dirs::home_dir()
        .filter(|path| !path.as_os_str().is_empty())
        .map(|path| path.join(defaults::HOME_DIR_NAME))
}

impl LoaderConfig {
    /// Load configuration from `path`, or from `~/.plughost/config.toml` when
    /// it exists, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match home_dir().map(|dir| dir.join(defaults::CONFIG_FILE_NAME)) {
                Some(default_path) if default_path.is_file() => Self::from_file(&default_path)?,
                _ => Self::default(),
            },
        };
        config.apply_env(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Apply overrides from an environment lookup.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(env_vars::PLUGIN_PATH) {
            let mut paths: Vec<PathBuf> = std::env::split_paths(&value)
                .filter(|path| !path.as_os_str().is_empty())
                .collect();
            paths.append(&mut self.search_paths);
            self.search_paths = paths;
        }

        if let Some(value) = lookup(env_vars::LOAD_TIMEOUT_MS) {
            self.load_timeout_ms = Some(parse_millis(env_vars::LOAD_TIMEOUT_MS, &value)?);
        }

        if let Some(value) = lookup(env_vars::INVOKE_TIMEOUT_MS) {
            self.invoke_timeout_ms = Some(parse_millis(env_vars::INVOKE_TIMEOUT_MS, &value)?);
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (identifier, digest) in &self.checksums {
            let valid = digest.len() == 64 && digest.chars().all(|c| c.is_ascii_hexdigit());
            if !valid {
                return Err(ConfigError::InvalidChecksum {
                    identifier: identifier.clone(),
                });
            }
        }
        Ok(())
    }

    pub fn load_timeout(&self) -> Option<Duration> {
        self.load_timeout_ms.map(Duration::from_millis)
    }

    pub fn invoke_timeout(&self) -> Option<Duration> {
        self.invoke_timeout_ms.map(Duration::from_millis)
    }

    /// Put `path` in front of the search paths.
    pub fn prepend_search_path(&mut self, path: impl Into<PathBuf>) {
        self.search_paths.insert(0, path.into());
    }
}

fn parse_millis(name: &'static str, value: &str) -> Result<u64, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        name,
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = LoaderConfig::default();
        assert_eq!(config.max_file_size, 100 * 1024 * 1024);
        assert!(config.load_timeout().is_none());
        assert!(config.invoke_timeout().is_none());
        assert_eq!(config.search_paths.last(), Some(&PathBuf::from(".")));
    }

    #[test]
    fn test_from_toml() {
        let config = LoaderConfig::from_toml(
            r#"
            search_paths = ["/opt/plugins"]
            load_timeout_ms = 2500
            max_file_size = 1024

            [checksums]
            "math-plugin" = "aa"
            "#,
        )
        .unwrap();

        assert_eq!(config.search_paths, vec![PathBuf::from("/opt/plugins")]);
        assert_eq!(config.load_timeout(), Some(Duration::from_millis(2500)));
        assert_eq!(config.max_file_size, 1024);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidChecksum { identifier }) if identifier == "math-plugin"
        ));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = LoaderConfig {
            search_paths: vec![PathBuf::from("/opt/plugins")],
            ..LoaderConfig::default()
        };
        let plugin_path = std::env::join_paths(["/a", "/b"]).unwrap();
        let plugin_path = plugin_path.to_string_lossy().to_string();

        config
            .apply_env(|name| match name {
                env_vars::PLUGIN_PATH => Some(plugin_path.clone()),
                env_vars::INVOKE_TIMEOUT_MS => Some("150".to_string()),
                _ => None,
            })
            .unwrap();

        assert_eq!(
            config.search_paths,
            vec![
                PathBuf::from("/a"),
                PathBuf::from("/b"),
                PathBuf::from("/opt/plugins")
            ]
        );
        assert_eq!(config.invoke_timeout(), Some(Duration::from_millis(150)));
    }

    #[test]
    fn test_invalid_env_value() {
        let mut config = LoaderConfig::default();
        let err = config
            .apply_env(|name| (name == env_vars::LOAD_TIMEOUT_MS).then(|| "soon".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { .. }));
    }

    #[test]
    fn test_missing_file() {
        let err = LoaderConfig::from_file(Path::new("/nonexistent/plughost.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
