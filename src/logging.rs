//! Structured JSONL logging for the shell process and human-readable stderr output.
//!
//! This module provides dual-output logging for the parent:
//! - **JSONL to file** (`<home>/logs/script-shell.jsonl`) - structured, machine readable
//! - **Pretty to stderr** - human-readable for developers
//!
//! Child processes use [`init_child`] instead: their stdout carries the channel
//! transport, so diagnostics may only go to stderr.
//!
//! This is the shell's own diagnostic log. Script output that users see goes
//! through [`crate::bus::LogBus`] instead.
//!
//! # Usage
//!
//! ```rust,ignore
//! use script_shell::{config, logging};
//!
//! let config = config::load_config();
//! // MUST keep guard alive for duration of program
//! let _guard = logging::init(&config);
//! tracing::info!(event_type = "shell_start", "Shell started");
//! ```

use std::collections::VecDeque;
use std::fs::{self, OpenOptions};
use std::path::PathBuf;
use std::sync::OnceLock;

use parking_lot::Mutex;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::ShellConfig;

static LOG_BUFFER: OnceLock<Mutex<VecDeque<String>>> = OnceLock::new();
const MAX_LOG_LINES: usize = 50;
const LOG_FILE_NAME: &str = "script-shell.jsonl";
const DEFAULT_FILTER: &str = "info";

/// Guard that must be kept alive for the duration of the program.
/// Dropping this guard will flush and close the log file.
pub struct LoggingGuard {
    _file_guard: Option<WorkerGuard>,
}

/// Initialize the dual-output logging system for the parent process.
///
/// Returns a guard that MUST be kept alive for the duration of the program.
pub fn init(config: &ShellConfig) -> LoggingGuard {
    let log_dir = config.app_log_dir();
    if let Err(e) = fs::create_dir_all(&log_dir) {
        eprintln!("[LOGGING] Failed to create log directory: {}", e);
    }
    let log_path = log_dir.join(LOG_FILE_NAME);

    let file = match OpenOptions::new().create(true).append(true).open(&log_path) {
        Ok(file) => file,
        Err(e) => {
            eprintln!("[LOGGING] Failed to open log file: {}", e);
            return init_stderr_only();
        }
    };

    // Non-blocking writer so a slow disk never stalls channel dispatch
    let (non_blocking_file, file_guard) = tracing_appender::non_blocking(file);

    let json_layer = fmt::layer()
        .json()
        .with_writer(non_blocking_file)
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .with_target(true)
        .with_level(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_file(false)
        .with_line_number(false)
        .with_span_events(FmtSpan::NONE);

    let pretty_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(true)
        .with_target(true)
        .with_level(true)
        .with_thread_ids(false)
        .compact();

    let initialized = tracing_subscriber::registry()
        .with(env_filter())
        .with(json_layer)
        .with(pretty_layer)
        .try_init();

    if initialized.is_ok() {
        tracing::info!(
            event_type = "shell_lifecycle",
            action = "started",
            log_path = %log_path.display(),
            "Shell logging initialized"
        );
    }

    LoggingGuard {
        _file_guard: Some(file_guard),
    }
}

/// Initialize stderr-only logging for a child script process.
pub fn init_child() -> LoggingGuard {
    init_stderr_only()
}

fn init_stderr_only() -> LoggingGuard {
    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_target(true)
        .compact();

    // Ignore the error: a subscriber may already be installed (tests, embedders)
    let _ = tracing_subscriber::registry()
        .with(env_filter())
        .with(stderr_layer)
        .try_init();

    LoggingGuard { _file_guard: None }
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Get the path to the JSONL log file
pub fn log_path(config: &ShellConfig) -> PathBuf {
    config.app_log_dir().join(LOG_FILE_NAME)
}

/// Category-tagged info log that also feeds the recent-lines buffer.
///
/// Prefer tracing macros directly when structured fields are useful.
pub fn log(category: &str, message: &str) {
    add_to_buffer(category, message);
    tracing::info!(category = category, "{}", message);
}

fn add_to_buffer(category: &str, message: &str) {
    let buffer = LOG_BUFFER.get_or_init(|| Mutex::new(VecDeque::with_capacity(MAX_LOG_LINES)));
    let mut buf = buffer.lock();
    if buf.len() >= MAX_LOG_LINES {
        buf.pop_front();
    }
    buf.push_back(format!("[{}] {}", category, message));
}

/// Recent `log()` lines, oldest first
pub fn recent_logs() -> Vec<String> {
    LOG_BUFFER
        .get()
        .map(|buffer| buffer.lock().iter().cloned().collect())
        .unwrap_or_default()
}

/// Log a script lifecycle event with structured fields
pub fn log_script_event(script: &str, action: &str, pid: Option<u32>, exit_code: Option<i32>) {
    add_to_buffer("SCRIPT", &format!("{} {}", action, script));
    tracing::info!(
        event_type = "script_event",
        script = script,
        action = action,
        pid = pid,
        exit_code = exit_code,
        "Script {} {}",
        action,
        script
    );
}

/// Log an error with structured fields and context
pub fn log_error(category: &str, error: &str, context: Option<&str>) {
    let msg = match context {
        Some(ctx) => format!("{}: {} (context: {})", category, error, ctx),
        None => format!("{}: {}", category, error),
    };
    add_to_buffer("ERROR", &msg);

    tracing::error!(
        event_type = "error",
        category = category,
        error_message = error,
        context = context,
        "{}",
        msg
    );
}

// Re-export tracing for use by other modules
pub use tracing;
