//! Channel-backed buses shared by the parent and its scripts.
//!
//! - `log`: per-script log files, backup cache and pipe replay
//! - `progress`: progress view model and multiplexed progress calls

pub mod log;
pub mod progress;

pub use log::{FileLogger, LogBus, LogKind, LogMessage, LOGGER_CHANNEL};
pub use progress::{
    LogSurface, ProgressBus, ProgressState, ProgressStatus, ProgressTracker, UiSurface,
    PROGRESS_CHANNEL,
};
