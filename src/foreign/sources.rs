//! Built-in sources: timers, idle callbacks and listener channels.

use super::{ControlFlow, Source, PRIORITY_DEFAULT, PRIORITY_DEFAULT_IDLE};
use crate::metrics::BridgeMetrics;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tracing::debug;

/// Fires every `interval` until its callback returns `Break`
pub struct TimeoutSource {
    interval: Duration,
    deadline: Instant,
    priority: i32,
    callback: Box<dyn FnMut() -> ControlFlow + Send>,
}

impl TimeoutSource {
    /// First fires `interval` from now
    pub fn new<F>(interval: Duration, callback: F) -> Self
    where
        F: FnMut() -> ControlFlow + Send + 'static,
    {
        Self {
            interval,
            deadline: Instant::now() + interval,
            priority: PRIORITY_DEFAULT,
            callback: Box::new(callback),
        }
    }

    /// Override the priority
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

impl Source for TimeoutSource {
    fn prepare(&mut self, now: Instant) -> (bool, Option<Duration>) {
        if now >= self.deadline {
            (true, Some(Duration::ZERO))
        } else {
            (false, Some(self.deadline - now))
        }
    }

    fn check(&mut self, now: Instant) -> bool {
        now >= self.deadline
    }

    fn dispatch(&mut self) -> ControlFlow {
        self.deadline = Instant::now() + self.interval;
        (self.callback)()
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn name(&self) -> &str {
        "timeout"
    }
}

/// Always ready, at idle priority
pub struct IdleSource {
    callback: Box<dyn FnMut() -> ControlFlow + Send>,
}

impl IdleSource {
    /// Wrap a callback
    pub fn new<F>(callback: F) -> Self
    where
        F: FnMut() -> ControlFlow + Send + 'static,
    {
        Self {
            callback: Box::new(callback),
        }
    }
}

impl Source for IdleSource {
    fn prepare(&mut self, _now: Instant) -> (bool, Option<Duration>) {
        (true, None)
    }

    fn check(&mut self, _now: Instant) -> bool {
        true
    }

    fn dispatch(&mut self) -> ControlFlow {
        (self.callback)()
    }

    fn priority(&self) -> i32 {
        PRIORITY_DEFAULT_IDLE
    }

    fn name(&self) -> &str {
        "idle"
    }
}

/// Drains a bounded channel into a handler.
///
/// Each dispatch delivers at most `budget` events. Once every sender is gone
/// and the queue is empty the source removes itself. Clearing the active
/// flag stops delivery before the next event, even mid-dispatch.
pub struct ChannelSource<T> {
    receiver: mpsc::Receiver<T>,
    peeked: Option<T>,
    disconnected: bool,
    active: Arc<AtomicBool>,
    budget: usize,
    name: String,
    metrics: Arc<BridgeMetrics>,
    handler: Box<dyn FnMut(T) + Send>,
}

impl<T: Send + 'static> ChannelSource<T> {
    /// Create a source draining `receiver`
    pub fn new<F>(
        receiver: mpsc::Receiver<T>,
        budget: usize,
        metrics: Arc<BridgeMetrics>,
        handler: F,
    ) -> Self
    where
        F: FnMut(T) + Send + 'static,
    {
        Self {
            receiver,
            peeked: None,
            disconnected: false,
            active: Arc::new(AtomicBool::new(true)),
            budget: budget.max(1),
            name: "channel".to_string(),
            metrics,
            handler: Box::new(handler),
        }
    }

    /// Name used in logs
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Flag that keeps the handler live. Store `false` to revoke it.
    pub fn active_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.active)
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn revoke(&mut self) -> ControlFlow {
        self.receiver.close();
        self.peeked = None;
        debug!(name = %self.name, "Handler revoked, removing channel source");
        ControlFlow::Break
    }

    fn poll_ready(&mut self) -> bool {
        if self.peeked.is_some() || self.disconnected || !self.is_active() {
            return true;
        }
        match self.receiver.try_recv() {
            Ok(item) => {
                self.peeked = Some(item);
                true
            }
            Err(TryRecvError::Empty) => false,
            Err(TryRecvError::Disconnected) => {
                self.disconnected = true;
                true
            }
        }
    }
}

impl<T: Send + 'static> Source for ChannelSource<T> {
    fn prepare(&mut self, _now: Instant) -> (bool, Option<Duration>) {
        (self.poll_ready(), None)
    }

    fn check(&mut self, _now: Instant) -> bool {
        self.poll_ready()
    }

    fn dispatch(&mut self) -> ControlFlow {
        let mut delivered = 0;
        while delivered < self.budget {
            if !self.is_active() {
                return self.revoke();
            }
            let item = match self.peeked.take() {
                Some(item) => item,
                None => match self.receiver.try_recv() {
                    Ok(item) => item,
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        self.disconnected = true;
                        break;
                    }
                },
            };
            (self.handler)(item);
            self.metrics.record_event_dispatched();
            delivered += 1;
        }

        if self.disconnected && self.peeked.is_none() {
            debug!(name = %self.name, "All senders gone, removing channel source");
            ControlFlow::Break
        } else {
            ControlFlow::Continue
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}
