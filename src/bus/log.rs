//! Log bus: the user-facing per-script log.
//!
//! In the parent, `log`/`err` append a timestamped line to
//! `<log_root>/<dir>/<name>` (or `<err_root>/<name>`) and push a record onto
//! the backup cache. In a child, the same calls are shipped over
//! `LOGGER_CHANNEL` and executed by the parent's bus, so only one process
//! ever writes the files.
//!
//! # Pipe
//!
//! `pipe(consumer)` replays the backup cache to a consumer, one record per
//! tick of the pump thread started by `open()`:
//!
//! ```text
//! pipe(a)        -> a active, private queue = snapshot(cache)
//! pipe(b)        -> a still streaming, b waits
//! queue drained  -> b active, queue = snapshot(cache) taken now
//! ```
//!
//! While a consumer is active, newly logged records are also appended to its
//! queue (live tail). `close()` stops the pump; `open()` resumes it.

use std::collections::VecDeque;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Local, NaiveDate, TimeZone};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::channel::{ChannelRouter, HandlerTable};
use crate::config::ShellConfig;
use crate::error::{Result, ResultExt, ShellError};
use crate::protocol::ChannelMessage;

pub const LOGGER_CHANNEL: &str = "LOGGER_CHANNEL";

pub const DEFAULT_LOG_DIR: &str = "main";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogKind {
    Log,
    Err,
}

/// One cached `log`/`err` call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogMessage {
    #[serde(rename = "type")]
    pub kind: LogKind,
    pub messages: Vec<Value>,
}

impl LogMessage {
    /// The call's arguments joined by spaces, as written to disk
    pub fn text(&self) -> String {
        join_args(&self.messages)
    }
}

fn join_args(args: &[Value]) -> String {
    args.iter()
        .map(|arg| match arg {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// `"<YYYY-MM-DD hh:mm:ss> - <args>\n"`
pub fn format_line<Tz: TimeZone>(now: &DateTime<Tz>, args: &[Value]) -> String
where
    Tz::Offset: fmt::Display,
{
    format!("{} - {}\n", now.format("%Y-%m-%d %H:%M:%S"), join_args(args))
}

/// `YYYY-MM-DD_hhmmss.log`
pub fn default_file_name<Tz: TimeZone>(now: &DateTime<Tz>) -> String
where
    Tz::Offset: fmt::Display,
{
    format!("{}.log", now.format("%Y-%m-%d_%H%M%S"))
}

/// Date encoded in a log file name (`YYYY-MM-DD.log`, `YYYY-MM-DD_hhmmss.log`)
fn file_name_date(file_name: &str) -> Option<NaiveDate> {
    let stem = file_name.split('.').next()?;
    let date = stem.split('_').next()?;
    NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
}

/// Disk side of the log bus: file layout, line appends and housekeeping
#[derive(Debug, Clone)]
pub struct FileLogger {
    log_root: PathBuf,
    err_root: PathBuf,
    log_file: PathBuf,
    err_file: PathBuf,
}

impl FileLogger {
    pub fn new(log_root: impl Into<PathBuf>, err_root: impl Into<PathBuf>) -> Self {
        let mut logger = FileLogger {
            log_root: log_root.into(),
            err_root: err_root.into(),
            log_file: PathBuf::new(),
            err_file: PathBuf::new(),
        };
        logger.init(None, None);
        logger
    }

    pub fn from_config(config: &ShellConfig) -> Self {
        Self::new(config.log_root(), config.err_root())
    }

    /// Point the logger at `<log_root>/<dir>/<name>` and `<err_root>/<name>`.
    pub fn init(&mut self, dir: Option<&str>, name: Option<&str>) {
        let dir = dir.filter(|d| !d.is_empty()).unwrap_or(DEFAULT_LOG_DIR);
        let name = match name.filter(|n| !n.is_empty()) {
            Some(name) => name.to_string(),
            None => default_file_name(&Local::now()),
        };
        self.log_file = self.log_root.join(dir).join(&name);
        self.err_file = self.err_root.join(&name);
    }

    pub fn log_file(&self) -> &Path {
        &self.log_file
    }

    pub fn err_file(&self) -> &Path {
        &self.err_file
    }

    pub fn log(&self, args: &[Value]) -> Result<()> {
        append(&self.log_file, &format_line(&Local::now(), args))
    }

    pub fn err(&self, args: &[Value]) -> Result<()> {
        append(&self.err_file, &format_line(&Local::now(), args))
    }

    /// Truncate the current log file (it is kept, not deleted)
    pub fn clear_log(&self) -> Result<()> {
        truncate(&self.log_file)
    }

    pub fn clear_err(&self) -> Result<()> {
        truncate(&self.err_file)
    }

    /// Delete every file under the log root, the err root, or both.
    /// Returns how many files were removed.
    pub fn clear_all(&self, kind: Option<LogKind>) -> Result<usize> {
        let mut removed = 0;
        for root in self.roots(kind) {
            for file in files_under(root)? {
                fs::remove_file(&file).map_err(|e| ShellError::io(&file, e))?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Delete log and err files whose name date is more than
    /// `retention_days` before `today`. Files without a date are kept.
    pub fn clear_expired(&self, retention_days: i64, today: NaiveDate) -> Result<usize> {
        let cutoff = today - chrono::Duration::days(retention_days);
        let mut removed = 0;
        for root in self.roots(None) {
            for file in files_under(root)? {
                let expired = file
                    .file_name()
                    .and_then(|n| n.to_str())
                    .and_then(file_name_date)
                    .is_some_and(|date| date < cutoff);
                if expired {
                    fs::remove_file(&file).map_err(|e| ShellError::io(&file, e))?;
                    removed += 1;
                }
            }
        }
        info!(removed, retention_days, "Cleared expired log files");
        Ok(removed)
    }

    fn roots(&self, kind: Option<LogKind>) -> Vec<&Path> {
        match kind {
            Some(LogKind::Log) => vec![&self.log_root],
            Some(LogKind::Err) => vec![&self.err_root],
            None => vec![&self.log_root, &self.err_root],
        }
    }
}

fn append(path: &Path, line: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| ShellError::io(parent, e))?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| ShellError::io(path, e))?;
    file.write_all(line.as_bytes())
        .map_err(|e| ShellError::io(path, e))
}

fn truncate(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| ShellError::io(parent, e))?;
    }
    fs::write(path, "").map_err(|e| ShellError::io(path, e))
}

/// All regular files below `root`, depth first. A missing root is empty.
fn files_under(root: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    if !root.exists() {
        return Ok(files);
    }
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let entries = fs::read_dir(&dir).map_err(|e| ShellError::io(&dir, e))?;
        for entry in entries {
            let path = entry.map_err(|e| ShellError::io(&dir, e))?.path();
            if path.is_dir() {
                pending.push(path);
            } else if path.is_file() {
                files.push(path);
            }
        }
    }
    Ok(files)
}

pub type PipeConsumer = Box<dyn FnMut(LogMessage) + Send>;

#[derive(Default)]
struct PipeState {
    gate: bool,
    streaming: bool,
    pump_running: bool,
    active: Option<PipeConsumer>,
    waiting: VecDeque<PipeConsumer>,
    queue: VecDeque<LogMessage>,
}

struct LogBusInner {
    logger: Mutex<FileLogger>,
    /// Every record logged since the last `init`, in call order
    cache: Mutex<Vec<LogMessage>>,
    pipe: Mutex<PipeState>,
    interval: Duration,
}

impl LogBusInner {
    fn init(&self, dir: Option<&str>, name: Option<&str>) {
        // Lock order is pipe -> cache -> logger everywhere
        let mut pipe = self.pipe.lock();
        pipe.queue.clear();
        self.cache.lock().clear();
        self.logger.lock().init(dir, name);
        debug!(log_file = %self.logger.lock().log_file().display(), "Log bus initialized");
    }

    /// The pipe lock spans the disk write and the cache push, so file order,
    /// cache order and the `init` rotation always agree.
    fn record(&self, kind: LogKind, messages: Vec<Value>) {
        let mut pipe = self.pipe.lock();
        let result = {
            let logger = self.logger.lock();
            match kind {
                LogKind::Log => logger.log(&messages),
                LogKind::Err => logger.err(&messages),
            }
        };
        result.log_err();

        let message = LogMessage { kind, messages };
        self.cache.lock().push(message.clone());
        if pipe.streaming {
            pipe.queue.push_back(message);
        }
    }

    fn pipe(&self, consumer: PipeConsumer) {
        let mut pipe = self.pipe.lock();
        if pipe.streaming {
            pipe.waiting.push_back(consumer);
        } else {
            self.load(&mut pipe, consumer);
        }
    }

    fn load(&self, pipe: &mut PipeState, consumer: PipeConsumer) {
        pipe.queue = self.cache.lock().iter().cloned().collect();
        pipe.active = Some(consumer);
        pipe.streaming = true;
        debug!(backlog = pipe.queue.len(), "Pipe consumer loaded");
    }

    /// One pump tick. Returns false once the gate is closed.
    fn tick(&self) -> bool {
        let delivery = {
            let mut pipe = self.pipe.lock();
            if !pipe.gate {
                pipe.pump_running = false;
                return false;
            }
            match pipe.queue.pop_front() {
                Some(message) => pipe.active.take().map(|consumer| (consumer, message)),
                None => {
                    if let Some(next) = pipe.waiting.pop_front() {
                        pipe.streaming = false;
                        self.load(&mut pipe, next);
                    }
                    None
                }
            }
        };

        // Consumers run without the lock so they may log themselves
        if let Some((mut consumer, message)) = delivery {
            if catch_unwind(AssertUnwindSafe(|| consumer(message))).is_err() {
                error!("Log pipe consumer panicked, record dropped");
            }
            let mut pipe = self.pipe.lock();
            if pipe.active.is_none() {
                pipe.active = Some(consumer);
            }
        }
        true
    }
}

/// Lets `open()` spawn a fresh pump if this one unwinds
struct PumpGuard(Arc<LogBusInner>);

impl Drop for PumpGuard {
    fn drop(&mut self) {
        if thread::panicking() {
            self.0.pipe.lock().pump_running = false;
        }
    }
}

/// Channel-backed logger, one instance per process
pub struct LogBus {
    router: Arc<ChannelRouter>,
    inner: Arc<LogBusInner>,
}

impl LogBus {
    pub fn new(router: Arc<ChannelRouter>, config: &ShellConfig) -> Self {
        Self::with_logger(
            router,
            FileLogger::from_config(config),
            Duration::from_millis(config.pipe_interval_ms),
        )
    }

    pub fn with_logger(router: Arc<ChannelRouter>, logger: FileLogger, interval: Duration) -> Self {
        LogBus {
            router,
            inner: Arc::new(LogBusInner {
                logger: Mutex::new(logger),
                cache: Mutex::new(Vec::new()),
                pipe: Mutex::new(PipeState::default()),
                interval,
            }),
        }
    }

    /// Operations children may invoke on `LOGGER_CHANNEL`
    pub fn handler_table(&self) -> HandlerTable {
        let init = Arc::clone(&self.inner);
        let log = Arc::clone(&self.inner);
        let err = Arc::clone(&self.inner);
        let clear_log = Arc::clone(&self.inner);
        let clear_err = Arc::clone(&self.inner);
        HandlerTable::new(LOGGER_CHANNEL)
            .method("init", move |msg: &ChannelMessage| {
                init.init(msg.arg_str(0), msg.arg_str(1));
                Ok(())
            })
            .method("log", move |msg: &ChannelMessage| {
                log.record(LogKind::Log, msg.argv.clone());
                Ok(())
            })
            .method("err", move |msg: &ChannelMessage| {
                err.record(LogKind::Err, msg.argv.clone());
                Ok(())
            })
            .method("clearLog", move |_: &ChannelMessage| clear_log.logger.lock().clear_log())
            .method("clearErr", move |_: &ChannelMessage| clear_err.logger.lock().clear_err())
    }

    pub fn register_channel(&self) {
        self.router.register(self.handler_table());
    }

    fn is_parent(&self) -> bool {
        self.router.is_parent()
    }

    fn forward(&self, function: &str, argv: Vec<Value>) {
        self.router
            .call(LOGGER_CHANNEL, ChannelMessage::new(function, argv));
    }

    /// Rotate the backing files; in the parent this also empties the cache
    pub fn init(&self, dir: Option<&str>, name: Option<&str>) {
        if self.is_parent() {
            self.inner.init(dir, name);
        } else {
            let arg = |v: Option<&str>| v.map_or(Value::Null, |s| Value::String(s.to_string()));
            self.forward("init", vec![arg(dir), arg(name)]);
        }
    }

    pub fn log<I, V>(&self, args: I)
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.emit(LogKind::Log, args.into_iter().map(Into::into).collect());
    }

    pub fn err<I, V>(&self, args: I)
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.emit(LogKind::Err, args.into_iter().map(Into::into).collect());
    }

    fn emit(&self, kind: LogKind, messages: Vec<Value>) {
        if self.is_parent() {
            self.inner.record(kind, messages);
        } else {
            let function = match kind {
                LogKind::Log => "log",
                LogKind::Err => "err",
            };
            self.forward(function, messages);
        }
    }

    pub fn clear_log(&self) {
        if self.is_parent() {
            self.inner.logger.lock().clear_log().log_err();
        } else {
            self.forward("clearLog", Vec::new());
        }
    }

    pub fn clear_err(&self) {
        if self.is_parent() {
            self.inner.logger.lock().clear_err().log_err();
        } else {
            self.forward("clearErr", Vec::new());
        }
    }

    pub fn log_file(&self) -> PathBuf {
        self.inner.logger.lock().log_file().to_path_buf()
    }

    pub fn err_file(&self) -> PathBuf {
        self.inner.logger.lock().err_file().to_path_buf()
    }

    /// Snapshot of the backup cache
    pub fn cached(&self) -> Vec<LogMessage> {
        self.inner.cache.lock().clone()
    }

    pub fn is_streaming(&self) -> bool {
        self.inner.pipe.lock().streaming
    }

    /// Records the active consumer has not finished, counting one in flight
    pub fn backlog(&self) -> usize {
        let pipe = self.inner.pipe.lock();
        let in_flight = pipe.streaming && pipe.active.is_none();
        pipe.queue.len() + usize::from(in_flight)
    }

    /// Register a backlog consumer; chains behind one already streaming.
    pub fn pipe<F>(&self, consumer: F) -> &Self
    where
        F: FnMut(LogMessage) + Send + 'static,
    {
        if !self.is_parent() {
            warn!("Log pipe is only available in the parent process");
            return self;
        }
        self.inner.pipe(Box::new(consumer));
        self
    }

    /// Start (or resume) the pump thread
    pub fn open(&self) -> &Self {
        if !self.is_parent() {
            warn!("Log pipe is only available in the parent process");
            return self;
        }
        let spawn = {
            let mut pipe = self.inner.pipe.lock();
            pipe.gate = true;
            !std::mem::replace(&mut pipe.pump_running, true)
        };
        if spawn {
            let inner = Arc::clone(&self.inner);
            thread::spawn(move || {
                let _guard = PumpGuard(Arc::clone(&inner));
                debug!("Log pipe pump started");
                while inner.tick() {
                    thread::sleep(inner.interval);
                }
                debug!("Log pipe pump stopped");
            });
        }
        self
    }

    pub fn close(&self) {
        self.inner.pipe.lock().gate = false;
    }
}

impl Drop for LogBus {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for LogBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogBus")
            .field("role", self.router.role())
            .field("log_file", &self.log_file())
            .finish()
    }
}

#[cfg(test)]
#[path = "log_tests.rs"]
mod tests;
