//! Progress bus and the progress view model it drives.
//!
//! Several logical progress bars share one rendering surface. Every call is
//! stamped with the active track name (`progressName`); the view model
//! switches to that track before applying the call, caching the outgoing
//! track's state so switching back restores it exactly.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, error};

use crate::channel::{ChannelRouter, HandlerTable};
use crate::error::{Result, ShellError};
use crate::protocol::ChannelMessage;

pub const PROGRESS_CHANNEL: &str = "PROGRESS_CHANNEL";

pub const DEFAULT_PROGRESS_NAME: &str = "default";

pub const COLOR_NORMAL: &str = "#1890ff";
pub const COLOR_SUCCESS: &str = "#52c41a";
pub const COLOR_EXCEPTION: &str = "#ff4d4f";

const METHODS: &[&str] = &[
    "init",
    "update",
    "setStepAmount",
    "switchProgressBar",
    "complete",
    "fail",
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressStatus {
    #[default]
    Normal,
    Active,
    Success,
    Exception,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressType {
    #[default]
    Line,
    Circle,
    Dashboard,
    Text,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressState {
    pub name: String,
    /// Always within 0..=100
    pub percent: f64,
    pub step: f64,
    pub status: ProgressStatus,
    pub stroke_color: String,
    #[serde(rename = "type")]
    pub kind: ProgressType,
    pub is_completed: bool,
}

impl ProgressState {
    pub fn named(name: impl Into<String>) -> Self {
        ProgressState {
            name: name.into(),
            percent: 0.0,
            step: 1.0,
            status: ProgressStatus::Normal,
            stroke_color: COLOR_NORMAL.to_string(),
            kind: ProgressType::Line,
            is_completed: false,
        }
    }
}

impl Default for ProgressState {
    fn default() -> Self {
        Self::named(DEFAULT_PROGRESS_NAME)
    }
}

/// The view model: one visible state plus a snapshot per known track
#[derive(Debug, Clone, Default)]
pub struct ProgressTracker {
    state: ProgressState,
    multiple_cached: Vec<ProgressState>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &ProgressState {
        &self.state
    }

    /// Last cached state of a track
    pub fn snapshot(&self, name: &str) -> Option<&ProgressState> {
        self.multiple_cached.iter().find(|s| s.name == name)
    }

    /// Switch to `name` and reset it to defaults
    pub fn init(&mut self, name: &str) {
        self.switch_progress_bar(name);
        self.state = ProgressState::named(name);
        self.cache_state();
    }

    /// Derive the step from the number of expected updates
    pub fn set_step_amount(&mut self, amount: f64) -> Result<()> {
        if amount <= 0.0 || !amount.is_finite() {
            return Err(ShellError::InvalidArgument {
                function: "setStepAmount".to_string(),
                reason: format!("step amount must be a positive number, got {}", amount),
            });
        }
        self.state.step = (100.0 / amount * 100.0).ceil() / 100.0;
        self.cache_state();
        Ok(())
    }

    /// Set the percent (clamped), or advance by one step when `None`
    pub fn update(&mut self, value: Option<f64>) {
        let target = value.unwrap_or(self.state.percent + self.state.step);
        self.state.percent = target.clamp(0.0, 100.0);
        if self.state.percent >= 100.0 {
            self.complete();
        } else {
            self.state.status = ProgressStatus::Active;
        }
        self.cache_state();
    }

    pub fn complete(&mut self) {
        self.state.percent = 100.0;
        self.state.status = ProgressStatus::Success;
        self.state.is_completed = true;
        self.state.stroke_color = COLOR_SUCCESS.to_string();
        self.cache_state();
    }

    pub fn has_completed(&self) -> bool {
        self.state.status == ProgressStatus::Success
    }

    pub fn fail(&mut self) {
        self.state.status = ProgressStatus::Exception;
        self.state.stroke_color = COLOR_EXCEPTION.to_string();
        self.cache_state();
    }

    /// Park the current track and show `name` (its snapshot, or defaults)
    pub fn switch_progress_bar(&mut self, name: &str) {
        if self.state.name == name {
            return;
        }
        self.cache_state();
        self.state = self
            .snapshot(name)
            .cloned()
            .unwrap_or_else(|| ProgressState::named(name));
    }

    /// Apply one channel call: switch to its track, then run the function
    pub fn apply(&mut self, message: &ChannelMessage) -> Result<()> {
        if let Some(name) = message.progress_name.as_deref() {
            self.switch_progress_bar(name);
        }
        match message.function.as_str() {
            "init" => {
                let name = message
                    .arg_str(0)
                    .or(message.progress_name.as_deref())
                    .unwrap_or(DEFAULT_PROGRESS_NAME)
                    .to_string();
                self.init(&name);
            }
            "update" => self.update(message.arg_f64(0)),
            "setStepAmount" => self.set_step_amount(message.arg_f64(0).unwrap_or(100.0))?,
            "switchProgressBar" => {
                self.switch_progress_bar(message.arg_str(0).unwrap_or(DEFAULT_PROGRESS_NAME))
            }
            "complete" => self.complete(),
            "fail" => self.fail(),
            other => {
                return Err(ShellError::MethodNotFound {
                    channel: PROGRESS_CHANNEL.to_string(),
                    function: other.to_string(),
                })
            }
        }
        Ok(())
    }

    fn cache_state(&mut self) {
        let state = self.state.clone();
        match self.multiple_cached.iter_mut().find(|s| s.name == state.name) {
            Some(slot) => *slot = state,
            None => self.multiple_cached.push(state),
        }
    }
}

/// Where the parent pushes progress calls for display
pub trait UiSurface: Send + Sync {
    fn notify(&self, channel: &str, messages: &[ChannelMessage]);
}

/// Surface for headless parents; calls only reach the tracing log
#[derive(Debug, Default)]
pub struct LogSurface;

impl UiSurface for LogSurface {
    fn notify(&self, channel: &str, messages: &[ChannelMessage]) {
        for message in messages {
            debug!(
                channel = %channel,
                function = %message.function,
                progress_name = ?message.progress_name,
                argv = ?message.argv,
                "UI notify"
            );
        }
    }
}

struct ProgressInner {
    active: Mutex<String>,
    tracker: Mutex<ProgressTracker>,
    surface: Arc<dyn UiSurface>,
}

impl ProgressInner {
    fn stamp(&self, mut message: ChannelMessage) -> ChannelMessage {
        if message.progress_name.is_none() {
            message.progress_name = Some(self.active.lock().clone());
        }
        message
    }

    /// Track the name carried by init/switch calls as the new active track
    fn follow(&self, message: &ChannelMessage) {
        if matches!(message.function.as_str(), "init" | "switchProgressBar") {
            if let Some(name) = message.arg_str(0).filter(|n| !n.is_empty()) {
                *self.active.lock() = name.to_string();
            }
        }
    }

    /// Parent side: update the view model, then the UI
    fn deliver(&self, message: ChannelMessage) -> Result<()> {
        let message = self.stamp(message);
        self.follow(&message);
        self.tracker.lock().apply(&message)?;
        self.surface.notify(PROGRESS_CHANNEL, std::slice::from_ref(&message));
        Ok(())
    }
}

/// Channel-backed progress reporting, one instance per process
pub struct ProgressBus {
    router: Arc<ChannelRouter>,
    inner: Arc<ProgressInner>,
}

impl ProgressBus {
    pub fn new(router: Arc<ChannelRouter>, surface: Arc<dyn UiSurface>) -> Self {
        ProgressBus {
            router,
            inner: Arc::new(ProgressInner {
                active: Mutex::new(DEFAULT_PROGRESS_NAME.to_string()),
                tracker: Mutex::new(ProgressTracker::new()),
                surface,
            }),
        }
    }

    pub fn handler_table(&self) -> HandlerTable {
        METHODS.iter().fold(HandlerTable::new(PROGRESS_CHANNEL), |table, &name| {
            let inner = Arc::clone(&self.inner);
            table.method(name, move |message: &ChannelMessage| inner.deliver(message.clone()))
        })
    }

    pub fn register_channel(&self) {
        self.router.register(self.handler_table());
    }

    /// Name stamped on calls that do not carry one
    pub fn active_name(&self) -> String {
        self.inner.active.lock().clone()
    }

    /// Visible progress state (parent only; a child's stays at defaults)
    pub fn state(&self) -> ProgressState {
        self.inner.tracker.lock().state().clone()
    }

    pub fn snapshot(&self, name: &str) -> Option<ProgressState> {
        self.inner.tracker.lock().snapshot(name).cloned()
    }

    fn send(&self, function: &str, argv: Vec<Value>) {
        self.dispatch(ChannelMessage::new(function, argv));
    }

    fn dispatch(&self, message: ChannelMessage) {
        let message = self.inner.stamp(message);
        if self.router.is_parent() {
            let function = message.function.clone();
            if let Err(e) = self.inner.deliver(message) {
                error!(channel = PROGRESS_CHANNEL, function = %function, error = %e, "Progress call failed");
            }
        } else {
            self.inner.follow(&message);
            self.router.call(PROGRESS_CHANNEL, message);
        }
    }

    /// Make `name` the active track and reset it
    pub fn init(&self, name: &str) {
        self.dispatch(ChannelMessage::new("init", vec![json!(name)]).with_progress_name(name));
    }

    /// Set the percent, or advance one step with `None`
    pub fn update(&self, value: Option<f64>) {
        self.send("update", value.map(|v| vec![json!(v)]).unwrap_or_default());
    }

    pub fn set_step_amount(&self, amount: usize) {
        self.send("setStepAmount", vec![json!(amount)]);
    }

    pub fn switch_progress_bar(&self, name: &str) {
        self.dispatch(
            ChannelMessage::new("switchProgressBar", vec![json!(name)]).with_progress_name(name),
        );
    }

    pub fn complete(&self) {
        self.send("complete", Vec::new());
    }

    pub fn fail(&self) {
        self.send("fail", Vec::new());
    }
}

impl fmt::Debug for ProgressBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressBus")
            .field("role", self.router.role())
            .field("active", &self.active_name())
            .finish()
    }
}

#[cfg(test)]
#[path = "progress_tests.rs"]
mod tests;
