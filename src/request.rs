//! Command requests from the UI side.
//!
//! Two patterns over one registry of named commands:
//!
//! - `notify`: fire-and-forget, the result is only logged
//! - `request`: tagged with a generated response id, answered with a
//!   [`Response`] or rejected once the timeout elapses
//!
//! A handler answers immediately with [`Reply::Ready`], or hands back a
//! receiver with [`Reply::Pending`] when the answer comes from another
//! thread (e.g. a script's exit callback).

use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::bus::LogBus;
use crate::config::ShellConfig;
use crate::error::{ErrorSeverity, Result, ShellError};

pub const STATUS_OK: u16 = 200;
pub const STATUS_ERROR: u16 = 500;

/// What every request resolves to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub status: u16,
    pub data: Value,
    pub message: String,
}

impl Response {
    pub fn ok(data: Value) -> Self {
        Response {
            status: STATUS_OK,
            data,
            message: "success".to_string(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Response {
            status: STATUS_ERROR,
            data: Value::Null,
            message: message.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == STATUS_OK
    }
}

/// A handler's answer
pub enum Reply {
    Ready(Value),
    Pending(Receiver<anyhow::Result<Value>>),
}

impl Reply {
    /// A pending reply plus the sender that completes it
    pub fn channel() -> (mpsc::Sender<anyhow::Result<Value>>, Reply) {
        let (tx, rx) = mpsc::channel();
        (tx, Reply::Pending(rx))
    }
}

pub type CommandHandler = Arc<dyn Fn(Value) -> anyhow::Result<Reply> + Send + Sync>;

pub struct CommandRegistry {
    handlers: Mutex<HashMap<String, CommandHandler>>,
    pending: Arc<Mutex<HashMap<String, String>>>,
    timeout: Duration,
    error_log: Option<Arc<LogBus>>,
}

impl CommandRegistry {
    pub fn new(timeout: Duration) -> Self {
        CommandRegistry {
            handlers: Mutex::new(HashMap::new()),
            pending: Arc::new(Mutex::new(HashMap::new())),
            timeout,
            error_log: None,
        }
    }

    pub fn from_config(config: &ShellConfig) -> Self {
        Self::new(Duration::from_millis(config.request_timeout_ms))
    }

    /// Also write command failures to the user-facing log
    pub fn with_error_log(mut self, log_bus: Arc<LogBus>) -> Self {
        self.error_log = Some(log_bus);
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn register<F>(&self, command: &str, handler: F)
    where
        F: Fn(Value) -> anyhow::Result<Reply> + Send + Sync + 'static,
    {
        self.handlers
            .lock()
            .insert(command.to_string(), Arc::new(handler));
    }

    pub fn commands(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.lock().keys().cloned().collect();
        names.sort_unstable();
        names
    }

    /// Response ids still waiting for an answer, with their command
    pub fn pending(&self) -> Vec<(String, String)> {
        self.pending
            .lock()
            .iter()
            .map(|(id, command)| (id.clone(), command.clone()))
            .collect()
    }

    /// Run a command without waiting for its answer
    pub fn notify(&self, command: &str, data: Value) {
        let Some(handler) = self.handler(command) else {
            self.report(command, &format!("unknown command {}", command));
            return;
        };
        match handler(data) {
            Ok(Reply::Ready(_)) => debug!(command = %command, "Notify handled"),
            Ok(Reply::Pending(rx)) => {
                let command = command.to_string();
                let error_log = self.error_log.clone();
                thread::spawn(move || {
                    if let Ok(Err(e)) = rx.recv() {
                        warn!(command = %command, error = %format!("{:#}", e), "Notify failed");
                        if let Some(log) = error_log {
                            log.err([format!("{} failed: {:#}", command, e)]);
                        }
                    }
                });
            }
            Err(e) => self.report(command, &format!("{:#}", e)),
        }
    }

    /// Run a command and wait up to the configured timeout
    pub fn request(&self, command: &str, data: Value) -> Result<Response> {
        self.request_with_timeout(command, data, Some(self.timeout))
    }

    /// `None` waits as long as the handler takes.
    ///
    /// Handler failures come back as a 500 [`Response`]; only a timeout is
    /// an `Err`.
    pub fn request_with_timeout(
        &self,
        command: &str,
        data: Value,
        timeout: Option<Duration>,
    ) -> Result<Response> {
        let Some(handler) = self.handler(command) else {
            let message = format!("unknown command {}", command);
            self.report(command, &message);
            return Ok(Response::error(message));
        };

        let response_id = Uuid::new_v4().to_string();
        self.pending
            .lock()
            .insert(response_id.clone(), command.to_string());
        debug!(command = %command, response_id = %response_id, "Request started");

        let outcome = match handler(data) {
            Ok(Reply::Ready(value)) => Ok(Ok(value)),
            Ok(Reply::Pending(rx)) => wait(&rx, timeout),
            Err(e) => Ok(Err(e)),
        };
        self.pending.lock().remove(&response_id);

        match outcome {
            Ok(Ok(value)) => Ok(Response::ok(value)),
            Ok(Err(e)) => {
                let detail = format!("{:#}", e);
                match e.downcast_ref::<ShellError>() {
                    Some(shell_error) => {
                        self.report_with(command, &detail, shell_error.severity());
                        Ok(Response::error(shell_error.user_message()))
                    }
                    None => {
                        self.report(command, &detail);
                        Ok(Response::error(detail))
                    }
                }
            }
            Err(()) => Err(ShellError::RequestTimeout {
                command: command.to_string(),
                timeout_ms: timeout.map_or(0, |t| t.as_millis() as u64),
            }),
        }
    }

    fn handler(&self, command: &str) -> Option<CommandHandler> {
        self.handlers.lock().get(command).cloned()
    }

    fn report(&self, command: &str, message: &str) {
        self.report_with(command, message, ErrorSeverity::Warning);
    }

    /// The err file gets the full error chain, whatever the UI is shown
    fn report_with(&self, command: &str, message: &str, severity: ErrorSeverity) {
        match severity {
            ErrorSeverity::Info => debug!(command = %command, error = %message, "Command failed"),
            ErrorSeverity::Warning => warn!(command = %command, error = %message, "Command failed"),
            ErrorSeverity::Error | ErrorSeverity::Critical => {
                error!(command = %command, error = %message, ?severity, "Command failed")
            }
        }
        if let Some(log) = &self.error_log {
            log.err([format!("{} failed: {}", command, message)]);
        }
    }
}

/// `Err(())` on timeout. A dropped sender counts as a failed command.
fn wait(
    rx: &Receiver<anyhow::Result<Value>>,
    timeout: Option<Duration>,
) -> std::result::Result<anyhow::Result<Value>, ()> {
    let received = match timeout {
        Some(timeout) => rx.recv_timeout(timeout),
        None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
    };
    match received {
        Ok(result) => Ok(result),
        Err(RecvTimeoutError::Timeout) => Err(()),
        Err(RecvTimeoutError::Disconnected) => {
            Ok(Err(anyhow::anyhow!("command finished without answering")))
        }
    }
}

impl std::fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandRegistry")
            .field("commands", &self.commands())
            .field("timeout", &self.timeout)
            .finish()
    }
}
