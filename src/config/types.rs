//! Configuration type definitions

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use super::defaults::*;
use crate::error::{Result, ShellError};

/// Shell-wide settings.
///
/// Every field is optional in the file; unset paths are derived from the
/// shell home directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShellConfig {
    /// Root of the shell's own files (default: ~/.script-shell)
    #[serde(default = "default_home")]
    pub home: PathBuf,
    /// One directory per script name lives under here
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_root: Option<PathBuf>,
    /// Error lines for every script land here, keyed by the same file name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err_root: Option<PathBuf>,
    /// JSON tables of the config store
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_root: Option<PathBuf>,
    /// Script directories (`<scriptsDir>/<name>/main.<ext>`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scripts_dir: Option<PathBuf>,
    #[serde(default = "default_pipe_interval_ms")]
    pub pipe_interval_ms: u64,
    #[serde(default = "default_bunch_limit")]
    pub bunch_limit: usize,
    #[serde(default = "default_bunch_sleep_ms")]
    pub bunch_sleep_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_log_retention_days")]
    pub log_retention_days: i64,
    /// Extension -> program overrides, merged over the built-in table
    #[serde(default)]
    pub runtimes: HashMap<String, String>,
}

pub(crate) fn default_home() -> PathBuf {
    if let Ok(home) = std::env::var(HOME_ENV_VAR) {
        if !home.trim().is_empty() {
            return PathBuf::from(shellexpand::tilde(home.trim()).as_ref());
        }
    }
    PathBuf::from(shellexpand::tilde(DEFAULT_HOME_DIR).as_ref())
}
fn default_pipe_interval_ms() -> u64 {
    DEFAULT_PIPE_INTERVAL_MS
}
fn default_bunch_limit() -> usize {
    DEFAULT_BUNCH_LIMIT
}
fn default_bunch_sleep_ms() -> u64 {
    DEFAULT_BUNCH_SLEEP_MS
}
fn default_request_timeout_ms() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_MS
}
fn default_log_retention_days() -> i64 {
    DEFAULT_LOG_RETENTION_DAYS
}

impl Default for ShellConfig {
    fn default() -> Self {
        ShellConfig {
            home: default_home(),
            log_root: None,
            err_root: None,
            store_root: None,
            scripts_dir: None,
            pipe_interval_ms: DEFAULT_PIPE_INTERVAL_MS,
            bunch_limit: DEFAULT_BUNCH_LIMIT,
            bunch_sleep_ms: DEFAULT_BUNCH_SLEEP_MS,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            log_retention_days: DEFAULT_LOG_RETENTION_DAYS,
            runtimes: HashMap::new(),
        }
    }
}

impl ShellConfig {
    /// Config rooted at `home`, everything else default. Used by tests and
    /// embedders that keep their state outside the user's home.
    pub fn with_home(home: impl AsRef<Path>) -> Self {
        ShellConfig {
            home: home.as_ref().to_path_buf(),
            ..ShellConfig::default()
        }
    }

    pub fn log_root(&self) -> PathBuf {
        self.log_root
            .clone()
            .unwrap_or_else(|| self.home.join("logs").join("scripts"))
    }

    pub fn err_root(&self) -> PathBuf {
        self.err_root
            .clone()
            .unwrap_or_else(|| self.home.join("logs").join("err"))
    }

    pub fn store_root(&self) -> PathBuf {
        self.store_root
            .clone()
            .unwrap_or_else(|| self.home.join("store"))
    }

    pub fn scripts_dir(&self) -> PathBuf {
        self.scripts_dir
            .clone()
            .unwrap_or_else(|| self.home.join("scripts"))
    }

    /// Reject values the buses and the request layer cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.pipe_interval_ms == 0 {
            return Err(ShellError::Config("pipeIntervalMs must be positive".to_string()));
        }
        if self.request_timeout_ms == 0 {
            return Err(ShellError::Config("requestTimeoutMs must be positive".to_string()));
        }
        if self.log_retention_days < 0 {
            return Err(ShellError::Config(format!(
                "logRetentionDays must not be negative, got {}",
                self.log_retention_days
            )));
        }
        if let Some((ext, _)) = self.runtimes.iter().find(|(_, program)| program.trim().is_empty()) {
            return Err(ShellError::Config(format!("runtime for .{} is empty", ext)));
        }
        Ok(())
    }

    /// Where the shell's own tracing output goes
    pub fn app_log_dir(&self) -> PathBuf {
        self.home.join("logs")
    }

    /// Built-in runtime table with user overrides applied
    pub fn runtime_table(&self) -> HashMap<String, String> {
        let mut table: HashMap<String, String> = DEFAULT_RUNTIMES
            .iter()
            .map(|(ext, program)| (ext.to_string(), program.to_string()))
            .collect();
        for (ext, program) in &self.runtimes {
            table.insert(ext.trim_start_matches('.').to_string(), program.clone());
        }
        table
    }
}
