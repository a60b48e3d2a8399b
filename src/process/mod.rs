//! Script process lifecycle.
//!
//! - `launcher`: script name -> program + entry file
//! - `registry`: `ProcessRegistry` and its `ScriptProcess` records
//! - `signal`: process-group signalling (unix)

mod launcher;
mod registry;
#[cfg(unix)]
mod signal;

pub use launcher::{LaunchPlan, ScriptLauncher};
pub use registry::{
    ExitCallback, ProcessLookup, ProcessRegistry, ProcessStatus, ScriptProcess,
    EXIT_CODE_UNKNOWN,
};
