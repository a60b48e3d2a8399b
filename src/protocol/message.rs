//! Channel message records exchanged between a child and the parent.
//!
//! A child writes one [`Envelope`] per line on its stdout:
//!
//! ```json
//! {"channel":"LOGGER_CHANNEL","messages":{"function":"log","argv":["cloning","repo-a"]}}
//! {"channel":"PROGRESS_CHANNEL","messages":[{"function":"update","argv":[55],"progressName":"vcommit"}]}
//! ```
//!
//! `messages` may be a single record or a list; [`Messages::into_vec`]
//! normalises both shapes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One method invocation on a channel handler.
///
/// `argv` is plain data only; it is spread positionally into the handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelMessage {
    /// Handler method name. Empty when the sender omitted it.
    #[serde(default)]
    pub function: String,
    #[serde(default)]
    pub argv: Vec<Value>,
    /// Progress track this call belongs to (stamped by the progress bus)
    #[serde(
        rename = "progressName",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub progress_name: Option<String>,
}

impl ChannelMessage {
    pub fn new(function: impl Into<String>, argv: Vec<Value>) -> Self {
        ChannelMessage {
            function: function.into(),
            argv,
            progress_name: None,
        }
    }

    /// A call with no arguments
    pub fn call(function: impl Into<String>) -> Self {
        Self::new(function, Vec::new())
    }

    pub fn with_progress_name(mut self, name: impl Into<String>) -> Self {
        self.progress_name = Some(name.into());
        self
    }

    /// Positional argument as a string, if present and a string
    pub fn arg_str(&self, index: usize) -> Option<&str> {
        self.argv.get(index).and_then(Value::as_str)
    }

    /// Positional argument as a number, if present and numeric
    pub fn arg_f64(&self, index: usize) -> Option<f64> {
        self.argv.get(index).and_then(Value::as_f64)
    }
}

/// One record or a batch, as sent on the wire.
///
/// `Many` is listed first: serde would otherwise accept `[]` as a
/// sequence-form `ChannelMessage`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Messages {
    Many(Vec<ChannelMessage>),
    One(ChannelMessage),
}

impl Messages {
    pub fn into_vec(self) -> Vec<ChannelMessage> {
        match self {
            Messages::Many(messages) => messages,
            Messages::One(message) => vec![message],
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Messages::Many(messages) => messages.len(),
            Messages::One(_) => 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<ChannelMessage> for Messages {
    fn from(message: ChannelMessage) -> Self {
        Messages::One(message)
    }
}

impl From<Vec<ChannelMessage>> for Messages {
    fn from(messages: Vec<ChannelMessage>) -> Self {
        Messages::Many(messages)
    }
}

/// Child -> parent process message: `{ channel, messages }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub channel: String,
    pub messages: Messages,
}

impl Envelope {
    pub fn new(channel: impl Into<String>, messages: impl Into<Messages>) -> Self {
        Envelope {
            channel: channel.into(),
            messages: messages.into(),
        }
    }
}
