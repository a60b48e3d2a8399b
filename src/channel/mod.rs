//! Channel layer: role resolution, upstream transport and dispatch.
//!
//! - `role`: `Role` (parent or child-with-upstream) and the `Upstream` trait
//! - `router`: `HandlerTable`, `ChannelRouter`, `DispatchReport`

mod role;
mod router;

pub use role::{Role, StdoutUpstream, Upstream, IPC_ENV_VAR};
pub use router::{ChannelRouter, DispatchReport, Handler, HandlerTable};
