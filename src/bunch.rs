//! Bounded-concurrency task runner.
//!
//! Two modes share one instance:
//!
//! - **Bulk**: [`BunchThread::register`] a parameter list and one task, then
//!   [`BunchThread::emit`]. At most `limit` task ids are live at once; `emit`
//!   blocks while the gate is full. The end callback fires once, after every
//!   id has been consumed.
//! - **Chained**: [`BunchThread::task_calling`] feeds tasks one at a time. Up
//!   to `limit` chains run; each chain pulls the next queued task when its
//!   current one finishes, optionally sleeping in between (busy mode).
//!
//! Task failures and panics are logged and swallowed. Tasks report their own
//! errors; the runner only bounds concurrency.

use std::collections::VecDeque;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, warn};

use crate::config::{ShellConfig, DEFAULT_BUNCH_LIMIT, DEFAULT_BUNCH_SLEEP_MS};

type Job = Box<dyn FnOnce() -> anyhow::Result<()> + Send>;
type EndCallback = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct BunchState {
    registered: Vec<Job>,
    total: usize,
    living_ids: Vec<usize>,
    consumed_ids: Vec<usize>,
    queue: VecDeque<Job>,
    chains: usize,
    peak_living: usize,
    done: bool,
    /// End callbacks currently running
    finishing: usize,
}

struct BunchInner {
    limit: usize,
    busy: bool,
    sleep: Duration,
    state: Mutex<BunchState>,
    changed: Condvar,
    end: Mutex<Option<EndCallback>>,
}

impl BunchInner {
    fn run_job(&self, job: Job) {
        match catch_unwind(AssertUnwindSafe(job)) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %format!("{:#}", e), "Bunch task failed"),
            Err(_) => error!("Bunch task panicked"),
        }
    }

    /// Run the end callback for a round that was marked done under the lock
    fn finish(&self) {
        let end = self.end.lock().clone();
        match end {
            Some(end) => {
                if catch_unwind(AssertUnwindSafe(|| end())).is_err() {
                    error!("Bunch end callback panicked");
                }
            }
            None => debug!("Bunch end"),
        }
        self.state.lock().finishing -= 1;
        self.changed.notify_all();
    }

    fn consume(&self, id: usize) {
        let all_done = {
            let mut state = self.state.lock();
            state.living_ids.retain(|living| *living != id);
            state.consumed_ids.push(id);
            let all_done = state.consumed_ids.len() == state.total;
            if all_done {
                state.done = true;
                state.finishing += 1;
            }
            all_done
        };
        self.changed.notify_all();
        if all_done {
            self.finish();
        }
    }

    /// One chain: run, optionally rest, pull the next queued task
    fn run_chain(self: Arc<Self>, first: Job) {
        let mut job = first;
        loop {
            self.run_job(job);
            if self.busy {
                thread::sleep(self.sleep);
            }
            let mut state = self.state.lock();
            match state.queue.pop_front() {
                Some(next) => job = next,
                None => {
                    state.chains -= 1;
                    let idle = state.chains == 0;
                    if idle {
                        state.done = true;
                        state.finishing += 1;
                    }
                    drop(state);
                    self.changed.notify_all();
                    if idle {
                        self.finish();
                    }
                    return;
                }
            }
        }
    }
}

pub struct BunchThread {
    inner: Arc<BunchInner>,
}

impl BunchThread {
    pub fn new(limit: usize) -> Self {
        Self::with_options(limit, false, Duration::from_millis(DEFAULT_BUNCH_SLEEP_MS))
    }

    pub fn from_config(config: &ShellConfig) -> Self {
        Self::with_options(
            config.bunch_limit,
            false,
            Duration::from_millis(config.bunch_sleep_ms),
        )
    }

    /// `busy` inserts `sleep` after every chained task
    pub fn with_options(limit: usize, busy: bool, sleep: Duration) -> Self {
        BunchThread {
            inner: Arc::new(BunchInner {
                limit: limit.max(1),
                busy,
                sleep,
                state: Mutex::new(BunchState {
                    done: true,
                    ..BunchState::default()
                }),
                changed: Condvar::new(),
                end: Mutex::new(None),
            }),
        }
    }

    pub fn limit(&self) -> usize {
        self.inner.limit
    }

    /// Callback for when every task has been consumed
    pub fn finally<F>(&self, callback: F) -> &Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.inner.end.lock() = Some(Arc::new(callback));
        self
    }

    /// Bulk mode: one `task(param, index)` per parameter
    pub fn register<P, F>(&self, params: Vec<P>, task: F) -> &Self
    where
        P: Send + 'static,
        F: Fn(P, usize) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let task = Arc::new(task);
        let jobs: Vec<Job> = params
            .into_iter()
            .enumerate()
            .map(|(index, param)| {
                let task = Arc::clone(&task);
                Box::new(move || task(param, index)) as Job
            })
            .collect();
        self.inner.state.lock().registered = jobs;
        self
    }

    /// Start the registered tasks, blocking while `limit` ids are live
    pub fn emit(&self) -> &Self {
        let jobs = {
            let mut state = self.inner.state.lock();
            let jobs = std::mem::take(&mut state.registered);
            state.total = jobs.len();
            state.living_ids.clear();
            state.consumed_ids.clear();
            state.done = jobs.is_empty();
            if state.done {
                state.finishing += 1;
            }
            jobs
        };
        if jobs.is_empty() {
            self.inner.finish();
            return self;
        }

        let total = jobs.len();
        for (id, job) in jobs.into_iter().enumerate() {
            {
                let mut state = self.inner.state.lock();
                while state.living_ids.len() >= self.inner.limit {
                    self.inner.changed.wait(&mut state);
                }
                state.living_ids.push(id);
                state.peak_living = state.peak_living.max(state.living_ids.len());
            }
            debug!(remaining = total - id, "Bunch task started");
            let inner = Arc::clone(&self.inner);
            thread::spawn(move || {
                inner.run_job(job);
                inner.consume(id);
            });
        }
        self
    }

    /// Chained mode: start `task` on a free chain, or queue it
    pub fn task_calling<F>(&self, task: F) -> &Self
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        let job: Job = Box::new(task);
        let mut state = self.inner.state.lock();
        state.done = false;
        if state.chains >= self.inner.limit {
            state.queue.push_back(job);
            return self;
        }
        state.chains += 1;
        state.peak_living = state.peak_living.max(state.chains);
        drop(state);

        let inner = Arc::clone(&self.inner);
        thread::spawn(move || inner.run_chain(job));
        self
    }

    /// Block until the current bulk run or chain set has finished
    pub fn wait(&self) {
        let mut state = self.inner.state.lock();
        while !state.done || state.finishing > 0 {
            self.inner.changed.wait(&mut state);
        }
    }

    /// Task ids currently live (bulk mode)
    pub fn living(&self) -> usize {
        self.inner.state.lock().living_ids.len()
    }

    /// Most tasks ever live at once
    pub fn peak_living(&self) -> usize {
        self.inner.state.lock().peak_living
    }

    /// Ids finished in the current bulk run, in completion order
    pub fn consumed_ids(&self) -> Vec<usize> {
        self.inner.state.lock().consumed_ids.clone()
    }
}

impl Default for BunchThread {
    fn default() -> Self {
        Self::new(DEFAULT_BUNCH_LIMIT)
    }
}

impl fmt::Debug for BunchThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("BunchThread")
            .field("limit", &self.inner.limit)
            .field("busy", &self.inner.busy)
            .field("living", &state.living_ids.len())
            .field("chains", &state.chains)
            .field("queued", &state.queue.len())
            .finish()
    }
}
