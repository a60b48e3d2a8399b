//! Default configuration values
//!
//! All constants used throughout the config module are defined here.

/// Environment variable that overrides the shell home directory
pub const HOME_ENV_VAR: &str = "SCRIPT_SHELL_HOME";

/// Home directory name under the user's home
pub const DEFAULT_HOME_DIR: &str = "~/.script-shell";

/// Pipe pump cadence (one log message per tick)
pub const DEFAULT_PIPE_INTERVAL_MS: u64 = 100;

/// Default concurrency limit for BunchThread
pub const DEFAULT_BUNCH_LIMIT: usize = 6;

/// Sleep inserted after each chained task in busy mode
pub const DEFAULT_BUNCH_SLEEP_MS: u64 = 3000;

/// Round-trip budget for request helpers
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 3000;

/// Log files older than this are removed by `clean-logs`
pub const DEFAULT_LOG_RETENTION_DAYS: i64 = 31;

/// Extension -> program used to launch a script entry file
pub const DEFAULT_RUNTIMES: &[(&str, &str)] = &[
    ("js", "node"),
    ("mjs", "node"),
    ("ts", "bun"),
    ("py", "python3"),
    ("sh", "sh"),
];
