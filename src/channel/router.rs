//! Channel router: channel name -> handler table.
//!
//! In the parent, [`ChannelRouter::call`] looks the handler table up and runs
//! each message against it. In a child, the same call packages
//! `{channel, messages}` and hands it to the upstream.

use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, error};

use super::role::Role;
use crate::error::{Result, ShellError};
use crate::protocol::{ChannelMessage, Envelope, Messages};

/// A channel operation. Receives the whole record so handlers can read the
/// positional `argv` as well as stamped metadata such as the progress track.
pub type Handler = Box<dyn Fn(&ChannelMessage) -> Result<()> + Send + Sync>;

/// The named operations one channel exposes
pub struct HandlerTable {
    channel: String,
    methods: HashMap<String, Handler>,
}

impl HandlerTable {
    pub fn new(channel: impl Into<String>) -> Self {
        HandlerTable {
            channel: channel.into(),
            methods: HashMap::new(),
        }
    }

    /// Add (or replace) an operation
    pub fn method<F>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&ChannelMessage) -> Result<()> + Send + Sync + 'static,
    {
        self.methods.insert(name.into(), Box::new(handler));
        self
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn get(&self, name: &str) -> Option<&Handler> {
        self.methods.get(name)
    }

    pub fn method_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.methods.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerTable")
            .field("channel", &self.channel)
            .field("methods", &self.method_names())
            .finish()
    }
}

/// Outcome of one `call`, for callers that want more than the logs
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    /// Messages whose handler ran and returned Ok
    pub delivered: usize,
    /// Messages that were skipped or whose handler failed
    pub failed: usize,
    /// The batch was handed to the upstream instead of run locally
    pub forwarded: bool,
}

/// Process-wide channel registry plus role-aware dispatch
pub struct ChannelRouter {
    role: Role,
    channels: RwLock<HashMap<String, Arc<HandlerTable>>>,
}

impl ChannelRouter {
    pub fn new(role: Role) -> Self {
        ChannelRouter {
            role,
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// Router for the parent process
    pub fn parent() -> Self {
        Self::new(Role::Parent)
    }

    pub fn role(&self) -> &Role {
        &self.role
    }

    pub fn is_parent(&self) -> bool {
        self.role.is_parent()
    }

    /// Upsert a handler table under its channel name. Last registration wins.
    pub fn register(&self, table: HandlerTable) {
        let channel = table.channel().to_string();
        debug!(channel = %channel, methods = ?table.method_names(), "Registering channel");
        self.channels.write().insert(channel, Arc::new(table));
    }

    pub fn is_registered(&self, channel: &str) -> bool {
        self.channels.read().contains_key(channel)
    }

    pub fn registered_channels(&self) -> Vec<String> {
        let mut names: Vec<String> = self.channels.read().keys().cloned().collect();
        names.sort_unstable();
        names
    }

    /// Run `messages` against `channel` here (parent) or forward them (child).
    ///
    /// Never fails: unknown channels, unknown methods and handler errors are
    /// logged and counted, and remaining messages in the batch still run.
    pub fn call(&self, channel: &str, messages: impl Into<Messages>) -> DispatchReport {
        let messages = messages.into();
        match &self.role {
            Role::Parent => self.invoke_local(channel, messages.into_vec()),
            Role::Child(upstream) => {
                let count = messages.len();
                let envelope = Envelope::new(channel, messages);
                match upstream.send(&envelope) {
                    Ok(()) => DispatchReport {
                        forwarded: true,
                        ..DispatchReport::default()
                    },
                    Err(e) => {
                        error!(channel = %channel, error = %e, "Failed to forward channel call");
                        DispatchReport {
                            failed: count,
                            forwarded: false,
                            ..DispatchReport::default()
                        }
                    }
                }
            }
        }
    }

    /// Entry point for envelopes arriving from a child
    pub fn dispatch_envelope(&self, envelope: Envelope) -> DispatchReport {
        self.call(&envelope.channel, envelope.messages)
    }

    fn invoke_local(&self, channel: &str, messages: Vec<ChannelMessage>) -> DispatchReport {
        let mut report = DispatchReport::default();

        // Clone the table out so handlers may register or call re-entrantly
        let table = self.channels.read().get(channel).cloned();
        let Some(table) = table else {
            error!(
                channel = %channel,
                error = %ShellError::ChannelNotRegistered(channel.to_string()),
                "Channel call dropped"
            );
            report.failed = messages.len();
            return report;
        };

        for message in &messages {
            match invoke_one(&table, message) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    error!(
                        channel = %channel,
                        function = %message.function,
                        error = %e,
                        "Channel message failed"
                    );
                    report.failed += 1;
                }
            }
        }
        report
    }
}

fn invoke_one(table: &HandlerTable, message: &ChannelMessage) -> Result<()> {
    if message.function.is_empty() {
        return Err(ShellError::MissingFunction(table.channel().to_string()));
    }
    let handler = table
        .get(&message.function)
        .ok_or_else(|| ShellError::MethodNotFound {
            channel: table.channel().to_string(),
            function: message.function.clone(),
        })?;

    match catch_unwind(AssertUnwindSafe(|| handler(message))) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(ShellError::Handler {
            message: describe(message),
            reason: e.to_string(),
        }),
        Err(panic) => Err(ShellError::Handler {
            message: describe(message),
            reason: panic_reason(panic.as_ref()),
        }),
    }
}

fn describe(message: &ChannelMessage) -> String {
    serde_json::to_string(message).unwrap_or_else(|_| message.function.clone())
}

fn panic_reason(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("handler panicked: {}", s)
    } else {
        "handler panicked".to_string()
    }
}

impl fmt::Debug for ChannelRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelRouter")
            .field("role", &self.role)
            .field("channels", &self.registered_channels())
            .finish()
    }
}

#[cfg(test)]
#[path = "router_tests.rs"]
mod tests;
