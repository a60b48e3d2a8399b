//! Composition root.
//!
//! [`ScriptContext`] is what every process gets: one router and one instance
//! of each bus, wired for the process's role. [`ScriptShell`] is the parent:
//! a context plus the process registry and the UI command surface.
//!
//! Construction order is fixed: router, buses (channels registered), then
//! registry and commands. Nothing logs or reports progress before its bus
//! exists.

use std::io::Write;
use std::sync::{Arc, Weak};
use std::thread;

use anyhow::Context as _;
use chrono::Local;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::bunch::BunchThread;
use crate::bus::{FileLogger, LogBus, LogMessage, LogSurface, ProgressBus, UiSurface};
use crate::channel::{ChannelRouter, Role};
use crate::config::ShellConfig;
use crate::error::{Result, ResultExt, ShellError};
use crate::process::{ProcessRegistry, ScriptLauncher, EXIT_CODE_UNKNOWN};
use crate::protocol::ChannelMessage;
use crate::request::{CommandRegistry, Reply};
use crate::store::{ConfigStore, StoreBus};

pub const CMD_EXEC_SCRIPT: &str = "exec-script";
pub const CMD_TERMINATE_SCRIPT: &str = "terminate-script";
pub const CMD_START_LOG: &str = "start-log-to-front";
pub const CMD_STOP_LOG: &str = "stop-log-to-front";

/// UI event carrying one piped log record
pub const LOG_MESSAGE_EVENT: &str = "log-message";

/// Buses for one process, wired for its role
pub struct ScriptContext {
    config: ShellConfig,
    router: Arc<ChannelRouter>,
    log: Arc<LogBus>,
    progress: Arc<ProgressBus>,
    store: Arc<StoreBus>,
}

impl ScriptContext {
    /// Context for a script binary: child when launched by the shell,
    /// otherwise a standalone parent writing its own files.
    pub fn from_env(config: ShellConfig) -> Self {
        Self::new(Role::from_env(), config, Arc::new(LogSurface))
    }

    pub fn new(role: Role, config: ShellConfig, surface: Arc<dyn UiSurface>) -> Self {
        let router = Arc::new(ChannelRouter::new(role));
        let log = Arc::new(LogBus::new(Arc::clone(&router), &config));
        let progress = Arc::new(ProgressBus::new(Arc::clone(&router), surface));
        let store = Arc::new(StoreBus::new(
            Arc::clone(&router),
            Arc::new(ConfigStore::from_config(&config)),
        ));

        if router.is_parent() {
            log.register_channel();
            progress.register_channel();
            store.register_channel();
        }

        ScriptContext {
            config,
            router,
            log,
            progress,
            store,
        }
    }

    pub fn config(&self) -> &ShellConfig {
        &self.config
    }

    pub fn router(&self) -> &Arc<ChannelRouter> {
        &self.router
    }

    pub fn log(&self) -> &Arc<LogBus> {
        &self.log
    }

    pub fn progress(&self) -> &Arc<ProgressBus> {
        &self.progress
    }

    pub fn store(&self) -> &Arc<StoreBus> {
        &self.store
    }

    /// A concurrency gate with the configured limit and busy sleep
    pub fn bunch(&self) -> BunchThread {
        BunchThread::from_config(&self.config)
    }
}

/// Result of `exec_script`
#[derive(Debug)]
pub enum ExecOutcome {
    StillRunning,
    Started {
        pid: u32,
        exit: async_channel::Receiver<i32>,
    },
}

/// Result of `terminate_script`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateOutcome {
    Stopped,
    AlreadyStopped,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScriptArgs {
    #[serde(default)]
    script_name: String,
}

impl ScriptArgs {
    fn parse(data: Value) -> anyhow::Result<Self> {
        let args: ScriptArgs = if data.is_null() {
            ScriptArgs::default()
        } else {
            serde_json::from_value(data).context("expected { scriptName }")?
        };
        Ok(args)
    }

    fn required(data: Value) -> anyhow::Result<String> {
        let args = Self::parse(data)?;
        anyhow::ensure!(!args.script_name.is_empty(), "scriptName is required");
        Ok(args.script_name)
    }
}

/// The parent process: runs scripts and serves UI commands
pub struct ScriptShell {
    context: ScriptContext,
    surface: Arc<dyn UiSurface>,
    registry: Arc<ProcessRegistry>,
    commands: CommandRegistry,
}

impl ScriptShell {
    pub fn new(config: ShellConfig, surface: Arc<dyn UiSurface>) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<ScriptShell>| {
            let context = ScriptContext::new(Role::Parent, config, Arc::clone(&surface));
            let registry = Arc::new(ProcessRegistry::new(
                ScriptLauncher::from_config(context.config()),
                Arc::clone(context.router()),
            ));
            let commands = CommandRegistry::from_config(context.config())
                .with_error_log(Arc::clone(context.log()));
            register_commands(&commands, weak);

            info!(
                event_type = "shell_lifecycle",
                action = "ready",
                scripts_dir = %context.config().scripts_dir().display(),
                "Script shell ready"
            );
            ScriptShell {
                context,
                surface,
                registry,
                commands,
            }
        })
    }

    pub fn context(&self) -> &ScriptContext {
        &self.context
    }

    pub fn registry(&self) -> &Arc<ProcessRegistry> {
        &self.registry
    }

    pub fn commands(&self) -> &CommandRegistry {
        &self.commands
    }

    /// Start `name` unless it is already starting or running. Concurrent
    /// calls for one name spawn at most one process.
    ///
    /// The log bus and the progress bus are rotated to the script before it
    /// spawns, so its first messages land in the new files.
    pub fn exec_script(&self, name: &str) -> Result<ExecOutcome> {
        let (tx, exit) = async_channel::bounded(1);
        let Some(record) = self.registry.claim_process(name, move |code| {
            let _ = tx.try_send(code);
        }) else {
            return Ok(ExecOutcome::StillRunning);
        };

        self.context.log.init(Some(name), None);
        self.context.progress.init(name);
        let pid = record.start()?;
        Ok(ExecOutcome::Started { pid, exit })
    }

    /// Drive the script's progress to 100 and stop it
    pub fn terminate_script(&self, name: &str) -> Result<TerminateOutcome> {
        let record = self
            .registry
            .get_process(name)
            .ok_or_else(|| ShellError::ScriptNotFound(name.to_string()))?;
        if !record.is_running() {
            return Ok(TerminateOutcome::AlreadyStopped);
        }
        self.context.progress.update(Some(100.0));
        record.stop();
        Ok(TerminateOutcome::Stopped)
    }

    /// Pipe the log backlog (and live tail) to the UI as `log-message` events
    pub fn start_log_stream(&self) {
        let surface = Arc::clone(&self.surface);
        self.start_log_stream_with(move |message| {
            let payload = serde_json::to_value(&message).unwrap_or(Value::Null);
            surface.notify(
                LOG_MESSAGE_EVENT,
                &[ChannelMessage::new(LOG_MESSAGE_EVENT, vec![payload])],
            );
        });
    }

    pub fn start_log_stream_with<F>(&self, consumer: F)
    where
        F: FnMut(LogMessage) + Send + 'static,
    {
        self.context.log.pipe(consumer).open();
    }

    pub fn stop_log_stream(&self) {
        self.context.log.close();
    }

    /// Delete log files past the retention window
    pub fn clean_logs(&self) -> Result<usize> {
        clean_logs(self.context.config())
    }

    pub fn shutdown(&self) {
        self.registry.stop_all();
        self.context.log.close();
        info!(event_type = "shell_lifecycle", action = "stopped", "Script shell stopped");
    }
}

pub fn clean_logs(config: &ShellConfig) -> Result<usize> {
    FileLogger::from_config(config)
        .clear_expired(config.log_retention_days, Local::now().date_naive())
}

fn register_commands(commands: &CommandRegistry, weak: &Weak<ScriptShell>) {
    let shell = weak.clone();
    commands.register(CMD_EXEC_SCRIPT, move |data| {
        let shell = upgrade(&shell)?;
        let name = ScriptArgs::required(data)?;
        match shell.exec_script(&name)? {
            ExecOutcome::StillRunning => Ok(Reply::Ready(json!(format!("{} still running", name)))),
            ExecOutcome::Started { exit, .. } => {
                let (tx, reply) = Reply::channel();
                thread::spawn(move || {
                    let code = exit.recv_blocking().unwrap_or(EXIT_CODE_UNKNOWN);
                    let _ = tx.send(Ok(json!(format!("script finish {}", code))));
                });
                Ok(reply)
            }
        }
    });

    let shell = weak.clone();
    commands.register(CMD_TERMINATE_SCRIPT, move |data| {
        let shell = upgrade(&shell)?;
        let name = ScriptArgs::required(data)?;
        let message = match shell.terminate_script(&name)? {
            TerminateOutcome::Stopped => "script stopped",
            TerminateOutcome::AlreadyStopped => "script already stopped",
        };
        Ok(Reply::Ready(json!(message)))
    });

    let shell = weak.clone();
    commands.register(CMD_START_LOG, move |_| {
        upgrade(&shell)?.start_log_stream();
        Ok(Reply::Ready(json!("success")))
    });

    let shell = weak.clone();
    commands.register(CMD_STOP_LOG, move |_| {
        upgrade(&shell)?.stop_log_stream();
        Ok(Reply::Ready(json!("success")))
    });
}

fn upgrade(shell: &Weak<ScriptShell>) -> anyhow::Result<Arc<ScriptShell>> {
    shell.upgrade().context("script shell has shut down")
}

/// UI surface that writes one JSON line per event:
/// `{"event": "<channel>", "messages": [...]}`
pub struct JsonlSurface<W: Write + Send> {
    out: Arc<Mutex<W>>,
}

impl<W: Write + Send> JsonlSurface<W> {
    pub fn new(out: Arc<Mutex<W>>) -> Self {
        JsonlSurface { out }
    }
}

#[derive(Serialize)]
struct SurfaceEvent<'a> {
    event: &'a str,
    messages: &'a [ChannelMessage],
}

impl<W: Write + Send> UiSurface for JsonlSurface<W> {
    fn notify(&self, channel: &str, messages: &[ChannelMessage]) {
        let line = match serde_json::to_string(&SurfaceEvent {
            event: channel,
            messages,
        }) {
            Ok(line) => line,
            Err(e) => {
                warn!(channel = %channel, error = %e, "Failed to serialize UI event");
                return;
            }
        };
        let mut out = self.out.lock();
        writeln!(out, "{}", line).and_then(|_| out.flush()).log_err();
    }
}

#[cfg(test)]
#[path = "shell_tests.rs"]
mod tests;
