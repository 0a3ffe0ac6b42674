//! In-process cooperative host loop.
//!
//! One iteration runs the idle callbacks, then the prepare callbacks, then
//! waits for work (unless an idle callback is registered) and finally runs
//! tasks posted from other threads. All callbacks run on the thread that
//! calls `run`; registration and posting may happen from any thread.

use super::{HandleId, HostLoop, IdleCallback, PrepareCallback, Waker};
use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

type Task = Box<dyn FnOnce() + Send>;

/// How long `EventLoop::run` keeps iterating
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Iterate until stopped or until no handles or tasks remain
    Default,
    /// One iteration, blocking if there is nothing to do
    Once,
    /// One iteration, never blocking
    NoWait,
    /// Iterate until stopped, blocking while idle
    Forever,
}

#[derive(Default)]
struct LoopState {
    next_id: u64,
    // A slot is `None` while its callback is running.
    prepare: BTreeMap<HandleId, Option<PrepareCallback>>,
    idle: BTreeMap<HandleId, Option<IdleCallback>>,
    tasks: VecDeque<Task>,
    woken: bool,
    stopped: bool,
}

impl LoopState {
    fn next_handle(&mut self) -> HandleId {
        self.next_id += 1;
        HandleId::new(self.next_id)
    }

    fn is_alive(&self) -> bool {
        !self.prepare.is_empty() || !self.idle.is_empty() || !self.tasks.is_empty()
    }

    fn has_work(&self) -> bool {
        self.woken || self.stopped || !self.tasks.is_empty()
    }
}

struct Shared {
    state: Mutex<LoopState>,
    signal: Condvar,
}

impl Shared {
    fn notify(&self, state: &mut LoopState) {
        state.woken = true;
        self.signal.notify_all();
    }
}

/// Cooperative single-threaded event loop
pub struct EventLoop {
    shared: Arc<Shared>,
    iterations: AtomicU64,
}

static DEFAULT_LOOP: Lazy<Arc<EventLoop>> = Lazy::new(|| Arc::new(EventLoop::new()));

impl EventLoop {
    /// Create an empty loop
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(LoopState::default()),
                signal: Condvar::new(),
            }),
            iterations: AtomicU64::new(0),
        }
    }

    /// The process-wide default loop, created on first use
    pub fn default_loop() -> &'static Arc<EventLoop> {
        &DEFAULT_LOOP
    }

    /// A cloneable handle for posting work from other threads
    pub fn remote(&self) -> LoopRemote {
        LoopRemote {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Completed iterations
    pub fn iterations(&self) -> u64 {
        self.iterations.load(Ordering::Relaxed)
    }

    /// Registered prepare callbacks
    pub fn prepare_count(&self) -> usize {
        self.shared.state.lock().prepare.len()
    }

    /// Registered idle callbacks
    pub fn idle_count(&self) -> usize {
        self.shared.state.lock().idle.len()
    }

    /// Whether the loop has handles or pending tasks
    pub fn is_alive(&self) -> bool {
        self.shared.state.lock().is_alive()
    }

    /// Run the loop. Returns whether it is still alive afterwards.
    pub fn run(&self, mode: RunMode) -> bool {
        debug!(?mode, "Running host loop");

        let alive = loop {
            if self.shared.state.lock().stopped {
                break self.is_alive();
            }
            match mode {
                RunMode::NoWait => break self.iterate(false),
                RunMode::Once => break self.iterate(true),
                RunMode::Default => {
                    if !self.is_alive() {
                        break false;
                    }
                    self.iterate(true);
                }
                RunMode::Forever => {
                    self.iterate(true);
                }
            }
        };

        // A stop request is consumed by the run it interrupted
        self.shared.state.lock().stopped = false;
        debug!(alive = alive, "Host loop returned");
        alive
    }

    fn iterate(&self, may_block: bool) -> bool {
        self.run_idle();
        let hint = self.run_prepare();
        self.wait(may_block, hint);
        self.run_tasks();
        self.iterations.fetch_add(1, Ordering::Relaxed);
        self.is_alive()
    }

    fn run_idle(&self) {
        let ids: Vec<HandleId> = self.shared.state.lock().idle.keys().copied().collect();
        for id in ids {
            let taken = self.shared.state.lock().idle.get_mut(&id).and_then(Option::take);
            let mut callback = match taken {
                Some(callback) => callback,
                None => continue,
            };

            callback();

            let leftover = {
                let mut state = self.shared.state.lock();
                match state.idle.get_mut(&id) {
                    Some(slot) => {
                        *slot = Some(callback);
                        None
                    }
                    None => Some(callback),
                }
            };
            // Removed while running; drop outside the lock
            drop(leftover);
        }
    }

    fn run_prepare(&self) -> Option<Duration> {
        let mut hint: Option<Duration> = None;
        let ids: Vec<HandleId> = self.shared.state.lock().prepare.keys().copied().collect();
        for id in ids {
            let taken = self
                .shared
                .state
                .lock()
                .prepare
                .get_mut(&id)
                .and_then(Option::take);
            let mut callback = match taken {
                Some(callback) => callback,
                None => continue,
            };

            if let Some(wait) = callback() {
                hint = Some(hint.map_or(wait, |current| current.min(wait)));
            }

            let leftover = {
                let mut state = self.shared.state.lock();
                match state.prepare.get_mut(&id) {
                    Some(slot) => {
                        *slot = Some(callback);
                        None
                    }
                    None => Some(callback),
                }
            };
            drop(leftover);
        }
        hint
    }

    fn wait(&self, may_block: bool, hint: Option<Duration>) {
        let mut state = self.shared.state.lock();
        let spin = !may_block || !state.idle.is_empty() || state.has_work();

        if !spin {
            match hint {
                Some(timeout) if timeout.is_zero() => {}
                Some(timeout) => {
                    let deadline = Instant::now() + timeout;
                    while !state.has_work() {
                        if self.shared.signal.wait_until(&mut state, deadline).timed_out() {
                            break;
                        }
                    }
                }
                None => {
                    while !state.has_work() {
                        self.shared.signal.wait(&mut state);
                    }
                }
            }
        }

        state.woken = false;
    }

    fn run_tasks(&self) {
        let tasks = std::mem::take(&mut self.shared.state.lock().tasks);
        if !tasks.is_empty() {
            trace!(count = tasks.len(), "Running posted tasks");
        }
        for task in tasks {
            task();
        }
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl HostLoop for EventLoop {
    fn add_prepare(&self, callback: PrepareCallback) -> HandleId {
        let mut state = self.shared.state.lock();
        let id = state.next_handle();
        state.prepare.insert(id, Some(callback));
        // A loop blocked on another thread has to pick the handle up
        self.shared.notify(&mut state);
        trace!(%id, "Prepare handle registered");
        id
    }

    fn remove_prepare(&self, id: HandleId) -> bool {
        let removed = self.shared.state.lock().prepare.remove(&id);
        trace!(%id, found = removed.is_some(), "Prepare handle removed");
        removed.is_some()
    }

    fn add_idle(&self, callback: IdleCallback) -> HandleId {
        let mut state = self.shared.state.lock();
        let id = state.next_handle();
        state.idle.insert(id, Some(callback));
        self.shared.notify(&mut state);
        trace!(%id, "Idle handle registered");
        id
    }

    fn remove_idle(&self, id: HandleId) -> bool {
        let removed = self.shared.state.lock().idle.remove(&id);
        trace!(%id, found = removed.is_some(), "Idle handle removed");
        removed.is_some()
    }

    fn waker(&self) -> Waker {
        let remote = self.remote();
        Arc::new(move || remote.wake())
    }
}

/// Thread-safe handle to an `EventLoop`
#[derive(Clone)]
pub struct LoopRemote {
    shared: Arc<Shared>,
}

impl LoopRemote {
    /// Queue a task to run on the loop thread during the next iteration
    pub fn post<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.shared.state.lock();
        state.tasks.push_back(Box::new(task));
        self.shared.signal.notify_all();
    }

    /// Interrupt a blocking wait
    pub fn wake(&self) {
        let mut state = self.shared.state.lock();
        self.shared.notify(&mut state);
    }

    /// Make the current (or next) `run` return
    pub fn stop(&self) {
        let mut state = self.shared.state.lock();
        state.stopped = true;
        self.shared.signal.notify_all();
    }
}

/// A dedicated OS thread running an `EventLoop` until stopped
pub struct LoopThread {
    remote: LoopRemote,
    handle: Option<JoinHandle<()>>,
}

impl LoopThread {
    /// Spawn a named thread running `event_loop` in `RunMode::Forever`
    pub fn spawn(event_loop: Arc<EventLoop>, name: &str) -> std::io::Result<Self> {
        let remote = event_loop.remote();
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                event_loop.run(RunMode::Forever);
            })?;

        debug!(thread = name, "Spawned host loop thread");

        Ok(Self {
            remote,
            handle: Some(handle),
        })
    }

    /// Remote handle to the running loop
    pub fn remote(&self) -> &LoopRemote {
        &self.remote
    }

    /// Whether the thread is still running
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().map_or(false, |h| !h.is_finished())
    }

    /// Stop the loop and join the thread
    pub fn stop(&mut self) {
        let handle = match self.handle.take() {
            Some(handle) => handle,
            None => return,
        };

        self.remote.stop();

        // Joining ourselves would deadlock; the loop exits on its own
        if handle.thread().id() == std::thread::current().id() {
            return;
        }

        if handle.join().is_err() {
            warn!("Host loop thread panicked");
        }
    }
}

impl Drop for LoopThread {
    fn drop(&mut self) {
        self.stop();
    }
}
