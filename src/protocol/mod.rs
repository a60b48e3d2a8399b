//! JSONL protocol between child scripts and the shell
//!
//! Children write newline-delimited JSON envelopes on stdout. Each envelope
//! names a channel and carries one or more `{function, argv}` records.
//!
//! # Module Structure
//!
//! - `message`: `ChannelMessage`, `Messages` (one-or-many) and `Envelope`
//! - `io`: graceful line parsing, serialization, streaming reader

mod io;
mod message;

pub use io::*;
pub use message::*;
