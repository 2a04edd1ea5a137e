//! Server configuration
//!
//! Reads the optional `configuration.yaml` in the config directory. Only the
//! sections the host acts on are parsed; everything else is ignored.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE: &str = "configuration.yaml";
pub const CONFIG_DIR_ENV: &str = "HA_CONFIG_DIR";
const DEFAULT_CONFIG_DIR: &str = "config";

/// `logger:` section
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LoggerConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub default: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            default: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub logger: LoggerConfig,
}

impl ServerConfig {
    pub fn from_yaml(content: &str) -> Result<Self> {
        // An empty file parses as null
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content).context("Invalid configuration.yaml")
    }

    /// Load `configuration.yaml` from `config_dir`, defaulting when absent
    pub fn load(config_dir: &Path) -> Result<Self> {
        let path = config_dir.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_yaml(&content)
    }
}

/// First CLI argument, then `HA_CONFIG_DIR`, then `./config`
pub fn resolve_config_dir(arg: Option<String>, env: Option<String>) -> PathBuf {
    arg.or(env)
        .filter(|dir| !dir.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_DIR))
}
