use std::path::PathBuf;

use thiserror::Error;
use tracing::{error, warn};

/// Error severity, used when a failure is surfaced to the UI as a log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    Info,     // informational
    Warning,  // recoverable, bus keeps working
    Error,    // operation failed
    Critical, // the shell cannot continue
}

/// Domain errors for the script shell
#[derive(Error, Debug)]
pub enum ShellError {
    #[error("channel {0} not registered")]
    ChannelNotRegistered(String),

    #[error("{channel} channel has no method {function}")]
    MethodNotFound { channel: String, function: String },

    #[error("{0} channel message has no function name")]
    MissingFunction(String),

    #[error("channel message {message} failed: {reason}")]
    Handler { message: String, reason: String },

    #[error("invalid argument for {function}: {reason}")]
    InvalidArgument { function: String, reason: String },

    #[error("failed to parse protocol message: {0}")]
    Protocol(#[from] serde_json::Error),

    #[error("i/o failed for '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("process spawn failed for '{script}': {reason}")]
    ProcessSpawn { script: String, reason: String },

    #[error("script not found: {0}")]
    ScriptNotFound(String),

    #[error("upstream send failed: {0}")]
    Upstream(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("request {command} timed out after {timeout_ms}ms")]
    RequestTimeout { command: String, timeout_ms: u64 },

    #[error("configuration error: {0}")]
    Config(String),
}

impl ShellError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::ChannelNotRegistered(_) => ErrorSeverity::Warning,
            Self::MethodNotFound { .. } => ErrorSeverity::Warning,
            Self::MissingFunction(_) => ErrorSeverity::Warning,
            Self::Handler { .. } => ErrorSeverity::Error,
            Self::InvalidArgument { .. } => ErrorSeverity::Warning,
            Self::Protocol(_) => ErrorSeverity::Warning,
            Self::Io { .. } => ErrorSeverity::Error,
            Self::ProcessSpawn { .. } => ErrorSeverity::Error,
            Self::ScriptNotFound(_) => ErrorSeverity::Error,
            Self::Upstream(_) => ErrorSeverity::Critical,
            Self::Store(_) => ErrorSeverity::Warning,
            Self::RequestTimeout { .. } => ErrorSeverity::Warning,
            Self::Config(_) => ErrorSeverity::Warning,
        }
    }

    pub fn user_message(&self) -> String {
        match self {
            Self::ChannelNotRegistered(channel) => format!("Channel {} is not available", channel),
            Self::MethodNotFound { function, .. } => format!("Unknown operation {}", function),
            Self::MissingFunction(_) => "Message has no operation name".to_string(),
            Self::Handler { reason, .. } => reason.clone(),
            Self::InvalidArgument { function, reason } => {
                format!("Bad argument for {}: {}", function, reason)
            }
            Self::Protocol(e) => format!("Invalid message format: {}", e),
            Self::Io { path, .. } => format!("Could not access {}", path.display()),
            Self::ProcessSpawn { script, .. } => format!("Could not start {}", script),
            Self::ScriptNotFound(script) => format!("Script {} does not exist", script),
            Self::Upstream(_) => "Lost connection to the shell".to_string(),
            Self::Store(msg) => msg.clone(),
            Self::RequestTimeout { command, .. } => format!("{} did not answer in time", command),
            Self::Config(msg) => format!("Configuration issue: {}", msg),
        }
    }
}

pub type Result<T> = std::result::Result<T, ShellError>;

/// Extension trait for silent error logging with caller location tracking.
/// Use when the operation is recoverable and nobody is waiting on the result.
///
/// ```ignore
/// use script_shell::error::ResultExt;
///
/// // the pump keeps running even if one consumer write fails
/// write_line(&path, &line).log_err();
/// ```
pub trait ResultExt<T> {
    /// Log error with caller location and return None.
    fn log_err(self) -> Option<T>;
    /// Log as warning with caller location and return None.
    fn warn_on_err(self) -> Option<T>;
}

impl<T, E: std::fmt::Debug> ResultExt<T> for std::result::Result<T, E> {
    #[track_caller]
    fn log_err(self) -> Option<T> {
        match self {
            Ok(value) => Some(value),
            Err(error) => {
                let caller = std::panic::Location::caller();
                error!(
                    error = ?error,
                    file = caller.file(),
                    line = caller.line(),
                    "Operation failed"
                );
                None
            }
        }
    }

    #[track_caller]
    fn warn_on_err(self) -> Option<T> {
        match self {
            Ok(value) => Some(value),
            Err(error) => {
                let caller = std::panic::Location::caller();
                warn!(
                    error = ?error,
                    file = caller.file(),
                    line = caller.line(),
                    "Operation had warning"
                );
                None
            }
        }
    }
}
