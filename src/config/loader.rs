//! Configuration loading from file system

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::{info, instrument, warn};

use super::types::{default_home, ShellConfig};

/// Path of the config file for the resolved shell home
pub fn config_path() -> PathBuf {
    default_home().join("config.json")
}

/// Load configuration from `<home>/config.json`.
///
/// Returns `ShellConfig::default()` if the file is missing or invalid.
#[instrument(name = "load_config")]
pub fn load_config() -> ShellConfig {
    let path = config_path();

    if !path.exists() {
        info!(path = %path.display(), "Config file not found, using defaults");
        return ShellConfig::default();
    }

    match load_config_from(&path) {
        Ok(config) => {
            info!(path = %path.display(), "Successfully loaded config");
            config
        }
        Err(e) => {
            warn!(error = %format!("{:#}", e), path = %path.display(), "Failed to load config, using defaults");
            ShellConfig::default()
        }
    }
}

/// Strict variant of [`load_config`]: any read or parse failure is returned.
pub fn load_config_from(path: &Path) -> Result<ShellConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let config: ShellConfig = serde_json::from_str(&contents)
        .with_context(|| format!("Failed to parse config JSON in {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("Invalid config in {}", path.display()))?;
    Ok(config)
}
