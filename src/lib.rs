//! Script Shell - run scripts as child processes and carry their logs,
//! progress and settings back to a parent over a JSONL channel transport.
//!
//! The same buses work in both roles: in the parent they write files and
//! update state, in a child (launched with `SCRIPT_SHELL_IPC=1`) they
//! forward every call to the parent on stdout.

pub mod bunch;
pub mod bus;
pub mod channel;
pub mod config;
pub mod error;
pub mod logging;
pub mod process;
pub mod protocol;
pub mod request;
pub mod serve;
pub mod shell;
pub mod store;
