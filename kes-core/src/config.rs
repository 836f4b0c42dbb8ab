//! Configuration for the engine supervisor.
//!
//! Two layers: [`EngineConfig`] is the user-facing knobs (TOML file plus CLI
//! overrides), [`EnginePaths`] is the resolved on-disk layout every component
//! works against.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// File name of the engine executable inside each candidate directory.
pub const ENGINE_BINARY_NAME: &str = "kopia";

/// Default loopback port for the engine's HTTP API.
pub const DEFAULT_PORT: u16 = 51515;

/// Fixed default UI credentials used when the server runs in insecure mode.
pub const DEFAULT_SERVER_USERNAME: &str = "kopia";
/// Companion to [`DEFAULT_SERVER_USERNAME`].
pub const DEFAULT_SERVER_PASSWORD: &str = "kopia";

/// Built-in repository password, used only when no password file exists.
pub const DEFAULT_REPOSITORY_PASSWORD: &str = "kopia";

/// Base URL of the engine's loopback API for a given port.
pub fn base_url(port: u16) -> String {
    format!("http://127.0.0.1:{port}")
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Configuration file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Configuration file contains invalid TOML.
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// User-facing supervisor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Loopback port the engine server binds to.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Root directory for repository data and engine configuration.
    /// Defaults to the platform data directory.
    #[serde(default)]
    pub root_dir: Option<PathBuf>,

    /// Directory holding the preinstalled engine binary.
    #[serde(default)]
    pub library_dir: Option<PathBuf>,

    /// Whether the server may be launched with `--insecure` and the fixed
    /// default UI credentials. Required for the local auth handshake.
    #[serde(default = "default_true")]
    pub insecure_allowed: bool,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_true() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            root_dir: None,
            library_dir: None,
            insecure_allowed: true,
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file, or defaults when `path` is `None`
    /// or the file does not exist.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Resolve the on-disk layout for this configuration.
    pub fn paths(&self) -> EnginePaths {
        let root = self
            .root_dir
            .clone()
            .unwrap_or_else(|| {
                dirs::data_local_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("kes")
            });
        let mut paths = EnginePaths::under(&root);
        if let Some(library_dir) = &self.library_dir {
            paths.library_dir = library_dir.clone();
        }
        paths
    }
}

/// Resolved on-disk layout for one engine instance.
///
/// The three executable candidate directories are searched in order; the
/// cache directory additionally serves as the fallback location when the OS
/// refuses to execute from the first two (no-exec mounts).
#[derive(Debug, Clone)]
pub struct EnginePaths {
    /// Preinstalled library directory (first executable candidate).
    pub library_dir: PathBuf,
    /// App-private storage copy (second executable candidate).
    pub private_dir: PathBuf,
    /// Process-private cache directory (fallback executable copy).
    pub cache_dir: PathBuf,
    /// Engine configuration directory.
    pub config_dir: PathBuf,
    /// Repository data directory.
    pub repo_dir: PathBuf,
    /// Home directory override handed to every engine invocation.
    pub home_dir: PathBuf,
}

impl EnginePaths {
    /// Lay out all directories under a single root.
    pub fn under(root: &Path) -> Self {
        Self {
            library_dir: root.join("lib"),
            private_dir: root.join("files"),
            cache_dir: root.join("cache"),
            config_dir: root.join("config"),
            repo_dir: root.join("repository"),
            home_dir: root.to_path_buf(),
        }
    }

    /// Path of the engine's repository configuration file.
    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join("repository.config")
    }

    /// Password file the engine itself writes next to its configuration.
    pub fn engine_password_file(&self) -> PathBuf {
        self.config_dir.join("repository.config.kopia-password")
    }

    /// Fallback password file written by the hosting application.
    pub fn fallback_password_file(&self) -> PathBuf {
        self.config_dir.join("repository.password")
    }
}
