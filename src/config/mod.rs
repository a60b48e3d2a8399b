//! Configuration module - shell settings
//!
//! # Module Structure
//!
//! - `defaults` - All default constant values
//! - `types` - `ShellConfig` and derived paths
//! - `loader` - File system loading and parsing

mod defaults;
mod loader;
mod types;

pub use defaults::{
    DEFAULT_BUNCH_LIMIT, DEFAULT_BUNCH_SLEEP_MS, DEFAULT_LOG_RETENTION_DAYS,
    DEFAULT_PIPE_INTERVAL_MS, DEFAULT_REQUEST_TIMEOUT_MS, DEFAULT_RUNTIMES, HOME_ENV_VAR,
};
pub use loader::{config_path, load_config, load_config_from};
pub use types::ShellConfig;

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
