//! Process registry: one lifecycle record per script name.
//!
//! A record moves `init -> starting -> running -> exit` and may be started
//! again once it has exited. `starting` counts as running everywhere, so a
//! name is never spawned twice at once. While running, every envelope the script prints on stdout is
//! handed to the [`ChannelRouter`]; the registry itself knows nothing about
//! which channels exist.
//!
//! Exit and spawn failure share one path: mark `exit`, drop the handle,
//! invoke the exit callback with the code (-1 when there is none).
//! Each start is tagged with a generation number; `stop()` bumps it, which
//! detaches the threads of the stopped run from the record.
//!
//! The exit is reaped on its own thread and does not wait for stdout to
//! close: a background grandchild may hold the pipe long after the script
//! itself is gone.

use std::collections::HashMap;
use std::fmt;
use std::io::{BufRead, BufReader};
use std::process::{Child, ChildStderr, ChildStdout, ExitStatus, Stdio};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, warn};

#[cfg(unix)]
use std::os::unix::process::CommandExt;

use super::launcher::ScriptLauncher;
use crate::channel::{ChannelRouter, IPC_ENV_VAR};
use crate::error::{Result, ShellError};
use crate::logging;
use crate::protocol::{JsonlReader, ParseResult};

/// Poll cadence while reaping a child
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// How long the exit path waits for buffered stdout once the script is gone
const STDOUT_DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Exit code reported for spawn failures and unknown termination
pub const EXIT_CODE_UNKNOWN: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    Init,
    /// Claimed for a run, spawn in progress
    Starting,
    Running,
    Exit,
}

pub type ExitCallback = Arc<dyn Fn(i32) + Send + Sync>;

/// Lookup key for [`ProcessRegistry::get_process`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessLookup {
    Name(String),
    Pid(u32),
}

impl From<&str> for ProcessLookup {
    fn from(name: &str) -> Self {
        ProcessLookup::Name(name.to_string())
    }
}

impl From<String> for ProcessLookup {
    fn from(name: String) -> Self {
        ProcessLookup::Name(name)
    }
}

impl From<u32> for ProcessLookup {
    fn from(pid: u32) -> Self {
        ProcessLookup::Pid(pid)
    }
}

/// What a successful spawn hands to the watcher threads
struct Spawned {
    pid: u32,
    child: Arc<Mutex<Child>>,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
}

struct RunState {
    status: ProcessStatus,
    child: Option<Arc<Mutex<Child>>>,
    pid: Option<u32>,
    generation: u64,
    on_exit: ExitCallback,
}

/// The lifecycle record of one named script
pub struct ScriptProcess {
    name: String,
    launcher: Arc<ScriptLauncher>,
    router: Arc<ChannelRouter>,
    state: Mutex<RunState>,
}

impl ScriptProcess {
    fn new(
        name: String,
        launcher: Arc<ScriptLauncher>,
        router: Arc<ChannelRouter>,
        on_exit: ExitCallback,
        status: ProcessStatus,
    ) -> Self {
        ScriptProcess {
            name,
            launcher,
            router,
            state: Mutex::new(RunState {
                status,
                child: None,
                pid: None,
                generation: 0,
                on_exit,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> ProcessStatus {
        self.state.lock().status
    }

    /// Running or about to be
    pub fn is_running(&self) -> bool {
        matches!(
            self.status(),
            ProcessStatus::Starting | ProcessStatus::Running
        )
    }

    /// OS process id while running
    pub fn pid(&self) -> Option<u32> {
        self.state.lock().pid
    }

    /// Spawn the script and wire its stdout/stderr listeners.
    ///
    /// Returns the PID. A record that is already running is left alone and
    /// its current PID returned. Resolution and spawn failures go through the
    /// exit path (callback with -1) and are also returned as the error.
    pub fn start(self: &Arc<Self>) -> Result<u32> {
        let mut state = self.state.lock();
        if state.status == ProcessStatus::Running {
            if let Some(pid) = state.pid {
                warn!(script = %self.name, pid, "Script already running, not spawning again");
                return Ok(pid);
            }
        }
        state.generation += 1;
        let generation = state.generation;
        state.status = ProcessStatus::Starting;

        // The record stays locked until the spawn settles; a concurrent
        // start() then finds it running.
        let spawned = self.spawn(&mut state);
        drop(state);

        match spawned {
            Ok(spawned) => {
                let pid = spawned.pid;
                self.watch(generation, spawned);
                Ok(pid)
            }
            Err(e) => {
                error!(script = %self.name, error = %e, "Script failed to start");
                self.finish(generation, EXIT_CODE_UNKNOWN);
                Err(e)
            }
        }
    }

    fn spawn(&self, state: &mut RunState) -> Result<Spawned> {
        let mut command = self.launcher.command(&self.name)?;
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env(IPC_ENV_VAR, "1");

        // The child's PID becomes its PGID, so stop() reaches grandchildren too
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|e| ShellError::ProcessSpawn {
            script: self.name.clone(),
            reason: e.to_string(),
        })?;
        let pid = child.id();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let child = Arc::new(Mutex::new(child));

        state.status = ProcessStatus::Running;
        state.child = Some(Arc::clone(&child));
        state.pid = Some(pid);
        Ok(Spawned {
            pid,
            child,
            stdout,
            stderr,
        })
    }

    /// One thread per stream plus a waiter that owns the exit path
    fn watch(self: &Arc<Self>, generation: u64, spawned: Spawned) {
        let Spawned {
            pid,
            child,
            stdout,
            stderr,
        } = spawned;
        logging::log_script_event(&self.name, "started", Some(pid), None);

        if let Some(stderr) = stderr {
            let name = self.name.clone();
            thread::spawn(move || {
                for line in BufReader::new(stderr).lines() {
                    match line {
                        Ok(line) => info!(event_type = "script_stderr", script = %name, "{}", line),
                        Err(_) => break,
                    }
                }
            });
        }

        // Disconnects once the reader is done with stdout
        let (drained_tx, drained) = mpsc::channel::<()>();
        if let Some(stdout) = stdout {
            let record = Arc::clone(self);
            thread::spawn(move || {
                let _drained = drained_tx;
                record.pump_messages(generation, JsonlReader::new(stdout));
            });
        }

        let record = Arc::clone(self);
        thread::spawn(move || {
            let code = wait_for_exit(&child);
            // Let the reader dispatch what the script printed before exiting
            let _ = drained.recv_timeout(STDOUT_DRAIN_GRACE);
            record.finish(generation, code);
        });
    }

    /// Forward child envelopes to the router until stdout closes
    fn pump_messages<R: std::io::Read>(&self, generation: u64, mut reader: JsonlReader<R>) {
        loop {
            match reader.next_line() {
                Ok(Some(ParseResult::Ok(envelope))) => {
                    if !self.is_current(generation) {
                        continue;
                    }
                    self.router.dispatch_envelope(envelope);
                }
                Ok(Some(ParseResult::NotEnvelope { error, raw })) => {
                    warn!(script = %self.name, error = %error, raw = %raw, "Ignoring malformed envelope");
                }
                Ok(Some(ParseResult::ParseError { raw, .. })) => {
                    debug!(script = %self.name, line = %raw, "Script stdout");
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(script = %self.name, error = %e, "Script stdout read failed");
                    break;
                }
            }
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.state.lock().generation == generation
    }

    /// Exit/error path. Only the run that owns `generation` may complete it.
    fn finish(&self, generation: u64, code: i32) {
        let callback = {
            let mut state = self.state.lock();
            if state.generation != generation {
                return;
            }
            state.generation += 1;
            state.status = ProcessStatus::Exit;
            state.child = None;
            state.pid = None;
            Arc::clone(&state.on_exit)
        };
        logging::log_script_event(&self.name, "exited", None, Some(code));
        callback(code);
    }

    /// Request termination and report exit code 0 right away.
    ///
    /// Termination is requested, not confirmed: the record is marked `exit`
    /// without waiting for the OS process to die.
    pub fn stop(&self) {
        let (child, pid, callback) = {
            let mut state = self.state.lock();
            state.generation += 1;
            state.status = ProcessStatus::Exit;
            (
                state.child.take(),
                state.pid.take(),
                Arc::clone(&state.on_exit),
            )
        };

        match (child, pid) {
            (Some(child), Some(pid)) => {
                terminate(&self.name, pid, &child);
                logging::log_script_event(&self.name, "stopped", Some(pid), Some(0));
            }
            _ => error!(script = %self.name, "Stop requested but no process is attached"),
        }
        callback(0);
    }
}

impl fmt::Debug for ScriptProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ScriptProcess")
            .field("name", &self.name)
            .field("status", &state.status)
            .field("pid", &state.pid)
            .finish()
    }
}

#[cfg(unix)]
fn terminate(name: &str, pid: u32, child: &Mutex<Child>) {
    use super::signal::{kill_process_group, process_group_alive, SIGTERM};

    match kill_process_group(pid, SIGTERM) {
        Ok(()) => debug!(script = %name, pgid = pid, "Sent SIGTERM to process group"),
        Err(e) if !process_group_alive(pid) => {
            debug!(script = %name, pgid = pid, error = e, "Process group already gone")
        }
        Err(e) => {
            warn!(script = %name, pgid = pid, error = e, "Group signal failed, killing leader");
            if let Err(e) = child.lock().kill() {
                warn!(script = %name, pid, error = %e, "Kill failed");
            }
        }
    }
}

#[cfg(not(unix))]
fn terminate(name: &str, pid: u32, child: &Mutex<Child>) {
    if let Err(e) = child.lock().kill() {
        warn!(script = %name, pid, error = %e, "Kill failed");
    }
}

/// Reap the child without holding its lock across a blocking wait
fn wait_for_exit(child: &Mutex<Child>) -> i32 {
    loop {
        match child.lock().try_wait() {
            Ok(Some(status)) => return exit_code(status),
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "Failed to wait for script");
                return EXIT_CODE_UNKNOWN;
            }
        }
        thread::sleep(EXIT_POLL_INTERVAL);
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    EXIT_CODE_UNKNOWN
}

/// All script records of this parent, keyed by script name
pub struct ProcessRegistry {
    launcher: Arc<ScriptLauncher>,
    router: Arc<ChannelRouter>,
    records: Mutex<HashMap<String, Arc<ScriptProcess>>>,
}

impl ProcessRegistry {
    pub fn new(launcher: ScriptLauncher, router: Arc<ChannelRouter>) -> Self {
        ProcessRegistry {
            launcher: Arc::new(launcher),
            router,
            records: Mutex::new(HashMap::new()),
        }
    }

    /// The running (or starting) record for `name`, or a fresh `init` record
    /// bound to `on_exit`. Never spawns; call [`ScriptProcess::start`] for that.
    pub fn create_process<F>(&self, name: &str, on_exit: F) -> Arc<ScriptProcess>
    where
        F: Fn(i32) + Send + Sync + 'static,
    {
        let mut records = self.records.lock();
        if let Some(existing) = records.get(name) {
            if existing.is_running() {
                return Arc::clone(existing);
            }
        }
        self.insert(&mut records, name, Arc::new(on_exit), ProcessStatus::Init)
    }

    /// Claim `name` for a new run in one step.
    ///
    /// `None` while the name is starting or running. Otherwise the new record
    /// is already `starting`, so a concurrent claim gets `None`; the caller
    /// follows up with [`ScriptProcess::start`].
    pub fn claim_process<F>(&self, name: &str, on_exit: F) -> Option<Arc<ScriptProcess>>
    where
        F: Fn(i32) + Send + Sync + 'static,
    {
        let mut records = self.records.lock();
        if records.get(name).is_some_and(|existing| existing.is_running()) {
            debug!(script = %name, "Script already claimed");
            return None;
        }
        Some(self.insert(&mut records, name, Arc::new(on_exit), ProcessStatus::Starting))
    }

    fn insert(
        &self,
        records: &mut HashMap<String, Arc<ScriptProcess>>,
        name: &str,
        on_exit: ExitCallback,
        status: ProcessStatus,
    ) -> Arc<ScriptProcess> {
        let record = Arc::new(ScriptProcess::new(
            name.to_string(),
            Arc::clone(&self.launcher),
            Arc::clone(&self.router),
            on_exit,
            status,
        ));
        records.insert(name.to_string(), Arc::clone(&record));
        record
    }

    pub fn get_process(&self, lookup: impl Into<ProcessLookup>) -> Option<Arc<ScriptProcess>> {
        let records = self.records.lock();
        match lookup.into() {
            ProcessLookup::Name(name) => records.get(&name).cloned(),
            ProcessLookup::Pid(pid) => records
                .values()
                .find(|record| record.pid() == Some(pid))
                .cloned(),
        }
    }

    /// Every record regardless of status, ordered by name
    pub fn get_process_all(&self) -> Vec<Arc<ScriptProcess>> {
        let mut all: Vec<Arc<ScriptProcess>> = self.records.lock().values().cloned().collect();
        all.sort_by(|a, b| a.name().cmp(b.name()));
        all
    }

    /// Stop a script by name or pid
    pub fn kill_process(&self, lookup: impl Into<ProcessLookup>) -> Result<()> {
        let lookup = lookup.into();
        let record = self.get_process(lookup.clone()).ok_or_else(|| {
            ShellError::ScriptNotFound(match &lookup {
                ProcessLookup::Name(name) => name.clone(),
                ProcessLookup::Pid(pid) => pid.to_string(),
            })
        })?;
        record.stop();
        Ok(())
    }

    /// Stop every running script, e.g. on shell shutdown
    pub fn stop_all(&self) {
        for record in self.get_process_all() {
            if record.is_running() {
                record.stop();
            }
        }
    }
}

#[cfg(all(test, unix))]
#[path = "registry_tests.rs"]
mod tests;
