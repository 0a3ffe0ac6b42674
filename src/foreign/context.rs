//! GLib-style main context.

use super::{ControlFlow, Source};
use crate::config::DEFAULT_DISPATCH_BUDGET;
use crate::host::Waker;
use crate::metrics::BridgeMetrics;
use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Identifier of a source attached to a `MainContext`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceId(u64);

impl SourceId {
    /// Raw numeric value
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for SourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "source#{}", self.0)
    }
}

struct Entry {
    // `None` while the source is being dispatched
    source: Option<Box<dyn Source>>,
    priority: i32,
    name: String,
}

#[derive(Default)]
struct ContextState {
    next_id: u64,
    sources: BTreeMap<SourceId, Entry>,
}

/// A set of sources polled and dispatched together
pub struct MainContext {
    state: Mutex<ContextState>,
    woken: Mutex<bool>,
    signal: Condvar,
    wake_hook: Mutex<Option<Waker>>,
    metrics: Arc<BridgeMetrics>,
    dispatch_budget: usize,
}

static DEFAULT_CONTEXT: Lazy<Arc<MainContext>> = Lazy::new(|| Arc::new(MainContext::new()));

impl MainContext {
    /// Create a context with the default dispatch budget
    pub fn new() -> Self {
        Self::with_budget(DEFAULT_DISPATCH_BUDGET)
    }

    /// Create a context whose channel sources deliver at most `budget`
    /// events per dispatch
    pub fn with_budget(budget: usize) -> Self {
        Self {
            state: Mutex::new(ContextState::default()),
            woken: Mutex::new(false),
            signal: Condvar::new(),
            wake_hook: Mutex::new(None),
            metrics: Arc::new(BridgeMetrics::new()),
            dispatch_budget: budget.max(1),
        }
    }

    /// The process-wide default context, created on first use
    pub fn default_context() -> &'static Arc<MainContext> {
        &DEFAULT_CONTEXT
    }

    /// Counters shared with the bridge and listeners
    pub fn metrics(&self) -> &Arc<BridgeMetrics> {
        &self.metrics
    }

    /// Events a channel source may deliver per dispatch
    pub fn dispatch_budget(&self) -> usize {
        self.dispatch_budget
    }

    /// Attach a source and wake the context
    pub fn attach<S>(&self, source: S) -> SourceId
    where
        S: Source + 'static,
    {
        let priority = source.priority();
        let name = source.name().to_string();

        let id = {
            let mut state = self.state.lock();
            state.next_id += 1;
            let id = SourceId(state.next_id);
            state.sources.insert(
                id,
                Entry {
                    source: Some(Box::new(source)),
                    priority,
                    name: name.clone(),
                },
            );
            id
        };

        debug!(source_id = %id, name = %name, priority = priority, "Source attached");
        self.wakeup();
        id
    }

    /// Remove a source. Returns false if it was not attached.
    ///
    /// Removing a source from inside its own dispatch is allowed; it is
    /// dropped once the dispatch returns.
    pub fn remove(&self, id: SourceId) -> bool {
        let removed = self.state.lock().sources.remove(&id);
        match removed {
            Some(entry) => {
                debug!(source_id = %id, name = %entry.name, "Source removed");
                true
            }
            None => false,
        }
    }

    /// Whether a source is attached
    pub fn contains(&self, id: SourceId) -> bool {
        self.state.lock().sources.contains_key(&id)
    }

    /// Number of attached sources
    pub fn len(&self) -> usize {
        self.state.lock().sources.len()
    }

    /// Whether no sources are attached
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Install or clear the hook called on every `wakeup`
    pub fn set_wake_hook(&self, hook: Option<Waker>) {
        *self.wake_hook.lock() = hook;
    }

    /// Interrupt a blocking iteration and notify the wake hook, if any
    pub fn wakeup(&self) {
        {
            let mut woken = self.woken.lock();
            *woken = true;
            self.signal.notify_all();
        }

        let hook = self.wake_hook.lock().clone();
        if let Some(hook) = hook {
            hook();
        }
    }

    /// Whether any source is ready, without dispatching
    pub fn pending(&self) -> bool {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.sources.values_mut().any(|entry| match entry.source.as_mut() {
            Some(source) => source.prepare(now).0 || source.check(now),
            None => false,
        })
    }

    /// Time until the next source becomes ready. `Some(ZERO)` if one already
    /// is, `None` if no source has a deadline.
    pub fn next_deadline(&self) -> Option<Duration> {
        let (ready, timeout) = self.prepare_sources(Instant::now());
        if ready.is_empty() {
            timeout
        } else {
            Some(Duration::ZERO)
        }
    }

    /// Run one iteration: prepare, optionally wait, check, dispatch.
    ///
    /// Only the ready sources sharing the best priority are dispatched.
    /// With `may_block` and nothing ready, waits for the nearest source
    /// deadline or a `wakeup`. Returns whether anything was dispatched.
    pub fn iteration(&self, may_block: bool) -> bool {
        *self.woken.lock() = false;

        let (mut ready, timeout) = self.prepare_sources(Instant::now());
        if ready.is_empty() && may_block {
            self.wait(timeout);
        }

        let checked = self.check_sources(Instant::now(), &ready);
        ready.extend(checked);
        if ready.is_empty() {
            return false;
        }

        let best = ready.iter().map(|(_, priority)| *priority).min();
        ready.retain(|(_, priority)| Some(*priority) == best);
        ready.sort_by_key(|(id, _)| *id);

        trace!(count = ready.len(), "Dispatching ready sources");

        let mut dispatched = false;
        for (id, _) in ready {
            dispatched |= self.dispatch_source(id);
        }
        dispatched
    }

    fn prepare_sources(&self, now: Instant) -> (Vec<(SourceId, i32)>, Option<Duration>) {
        let mut ready = Vec::new();
        let mut timeout: Option<Duration> = None;

        let mut state = self.state.lock();
        for (id, entry) in state.sources.iter_mut() {
            if let Some(source) = entry.source.as_mut() {
                let (is_ready, wait) = source.prepare(now);
                if is_ready {
                    ready.push((*id, entry.priority));
                } else if let Some(wait) = wait {
                    timeout = Some(timeout.map_or(wait, |current| current.min(wait)));
                }
            }
        }

        (ready, timeout)
    }

    fn check_sources(&self, now: Instant, already: &[(SourceId, i32)]) -> Vec<(SourceId, i32)> {
        let mut ready = Vec::new();

        let mut state = self.state.lock();
        for (id, entry) in state.sources.iter_mut() {
            if already.iter().any(|(ready_id, _)| ready_id == id) {
                continue;
            }
            if let Some(source) = entry.source.as_mut() {
                if source.check(now) {
                    ready.push((*id, entry.priority));
                }
            }
        }

        ready
    }

    fn wait(&self, timeout: Option<Duration>) {
        let mut woken = self.woken.lock();
        match timeout {
            Some(timeout) if timeout.is_zero() => {}
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                while !*woken {
                    if self.signal.wait_until(&mut woken, deadline).timed_out() {
                        break;
                    }
                }
            }
            None => {
                while !*woken {
                    self.signal.wait(&mut woken);
                }
            }
        }
        *woken = false;
    }

    fn dispatch_source(&self, id: SourceId) -> bool {
        let taken = self
            .state
            .lock()
            .sources
            .get_mut(&id)
            .and_then(|entry| entry.source.take());

        // Removed earlier in this pass
        let mut source = match taken {
            Some(source) => source,
            None => return false,
        };

        let flow = source.dispatch();
        self.metrics.record_source_dispatch();

        let leftover = {
            let mut state = self.state.lock();
            match flow {
                ControlFlow::Continue => match state.sources.get_mut(&id) {
                    Some(entry) => {
                        entry.source = Some(source);
                        None
                    }
                    None => Some(source),
                },
                ControlFlow::Break => {
                    state.sources.remove(&id);
                    debug!(source_id = %id, "Source finished");
                    Some(source)
                }
            }
        };
        // Dropping a source may release listeners; never under the lock
        drop(leftover);
        true
    }
}

impl Default for MainContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foreign::{IdleSource, TimeoutSource, PRIORITY_DEFAULT, PRIORITY_HIGH};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Flag {
        name: &'static str,
        priority: i32,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    impl Source for Flag {
        fn prepare(&mut self, _now: Instant) -> (bool, Option<Duration>) {
            (true, None)
        }

        fn check(&mut self, _now: Instant) -> bool {
            true
        }

        fn dispatch(&mut self) -> ControlFlow {
            self.log.lock().push(self.name);
            ControlFlow::Break
        }

        fn priority(&self) -> i32 {
            self.priority
        }

        fn name(&self) -> &str {
            self.name
        }
    }

    #[test]
    fn test_empty_iteration() {
        let context = MainContext::new();
        assert!(!context.iteration(false));
        assert!(!context.pending());
        assert!(context.is_empty());
    }

    #[test]
    fn test_timeout_source_fires() {
        let context = MainContext::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let f = Arc::clone(&fired);
        context.attach(TimeoutSource::new(Duration::from_millis(20), move || {
            f.fetch_add(1, Ordering::SeqCst);
            ControlFlow::Continue
        }));

        assert!(!context.iteration(false));
        assert!(context.next_deadline().unwrap() <= Duration::from_millis(20));

        // Blocks until the deadline
        assert!(context.iteration(true));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(context.len(), 1);
    }

    #[test]
    fn test_break_removes_source() {
        let context = MainContext::new();
        let id = context.attach(IdleSource::new(|| ControlFlow::Break));

        assert!(context.contains(id));
        assert!(context.iteration(false));
        assert!(!context.contains(id));
        assert!(!context.iteration(false));
    }

    #[test]
    fn test_best_priority_dispatched_first() {
        let context = MainContext::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        context.attach(Flag {
            name: "default",
            priority: PRIORITY_DEFAULT,
            log: Arc::clone(&log),
        });
        context.attach(Flag {
            name: "high",
            priority: PRIORITY_HIGH,
            log: Arc::clone(&log),
        });

        assert!(context.iteration(false));
        assert_eq!(*log.lock(), vec!["high"]);

        assert!(context.iteration(false));
        assert_eq!(*log.lock(), vec!["high", "default"]);
    }

    #[test]
    fn test_remove_sibling_during_dispatch() {
        let context = Arc::new(MainContext::new());
        let victim = Arc::new(Mutex::new(None::<SourceId>));
        let victim_runs = Arc::new(AtomicUsize::new(0));

        let ctx = Arc::clone(&context);
        let v = Arc::clone(&victim);
        context.attach(IdleSource::new(move || {
            if let Some(id) = *v.lock() {
                ctx.remove(id);
            }
            ControlFlow::Continue
        }));

        let runs = Arc::clone(&victim_runs);
        let id = context.attach(IdleSource::new(move || {
            runs.fetch_add(1, Ordering::SeqCst);
            ControlFlow::Continue
        }));
        *victim.lock() = Some(id);

        assert!(context.iteration(false));
        assert_eq!(victim_runs.load(Ordering::SeqCst), 0);
        assert!(!context.contains(id));
        assert_eq!(context.len(), 1);
    }

    #[test]
    fn test_wakeup_interrupts_blocking_iteration() {
        let context = Arc::new(MainContext::new());

        let ctx = Arc::clone(&context);
        let attacher = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            ctx.attach(IdleSource::new(|| ControlFlow::Break));
        });

        assert!(context.iteration(true));
        attacher.join().unwrap();
    }

    #[test]
    fn test_wake_hook_called() {
        let context = MainContext::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&calls);
        context.set_wake_hook(Some(Arc::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        })));
        context.wakeup();
        context.attach(IdleSource::new(|| ControlFlow::Break));
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        context.set_wake_hook(None);
        context.wakeup();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_pending_does_not_dispatch() {
        let context = MainContext::new();
        let runs = Arc::new(AtomicUsize::new(0));

        let r = Arc::clone(&runs);
        context.attach(IdleSource::new(move || {
            r.fetch_add(1, Ordering::SeqCst);
            ControlFlow::Continue
        }));

        assert!(context.pending());
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert_eq!(context.next_deadline(), Some(Duration::ZERO));
    }
}
