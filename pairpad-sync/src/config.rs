//! Layered configuration.
//!
//! Later sources override earlier ones:
//! 1. Built-in defaults ([`ServerConfig::default`])
//! 2. TOML file (`pairpad.toml`, or the path in `PAIRPAD_CONFIG`)
//! 3. Environment variables, e.g. `PAIRPAD__BIND_ADDR=0.0.0.0:8000`

use std::path::{Path, PathBuf};

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::server::ServerConfig;
use crate::storage::DEFAULT_LANGUAGE;

/// Config file read when no explicit path is given.
pub const DEFAULT_CONFIG_FILE: &str = "pairpad.toml";
/// Environment variable naming an alternative config file.
pub const CONFIG_PATH_ENV: &str = "PAIRPAD_CONFIG";
/// Prefix for per-field environment overrides.
pub const ENV_PREFIX: &str = "PAIRPAD";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("{0}")]
    Invalid(String),
}

/// A room created at startup when the store has none.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeedRoom {
    pub name: String,
    #[serde(default)]
    pub language: Option<String>,
}

impl Default for SeedRoom {
    fn default() -> Self {
        Self {
            name: "Scratchpad".to_string(),
            language: Some(DEFAULT_LANGUAGE.to_string()),
        }
    }
}

/// Resolve which config file to read.
///
/// An explicit path wins over `PAIRPAD_CONFIG`, which wins over `pairpad.toml`.
pub fn config_path(explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    std::env::var_os(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
}

/// Load and validate the server configuration.
///
/// A missing file is not an error; defaults apply.
pub fn load(path: Option<&Path>) -> Result<ServerConfig, ConfigError> {
    let path = config_path(path);
    let defaults = ServerConfig::default();

    let built = Config::builder()
        .set_default("bind_addr", defaults.bind_addr.as_str())?
        .set_default("outbox_capacity", defaults.outbox_capacity as i64)?
        .set_default("debug", defaults.debug)?
        .add_source(
            File::from(path.as_path())
                .format(FileFormat::Toml)
                .required(false),
        )
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    let config: ServerConfig = built.try_deserialize()?;
    config.validate()?;
    log::debug!("Loaded configuration from {}", path.display());
    Ok(config)
}
