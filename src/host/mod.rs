//! The host side of the bridge.
//!
//! A host loop is single-threaded and cooperative. The bridge only needs two
//! things from it: a callback that runs once per iteration before the loop
//! waits for I/O, and a way to keep the loop from blocking. `HostLoop`
//! captures exactly that; `EventLoop` is the in-process implementation.

pub mod event_loop;

pub use event_loop::{EventLoop, LoopRemote, LoopThread, RunMode};

use std::sync::Arc;
use std::time::Duration;

/// Handle to a callback registered with a host loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(u64);

impl HandleId {
    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw numeric value
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for HandleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "handle#{}", self.0)
    }
}

/// Runs once per loop iteration before the loop waits.
///
/// The returned duration, if any, bounds how long the loop may block
/// afterwards. It only matters when no idle callback is registered.
pub type PrepareCallback = Box<dyn FnMut() -> Option<Duration> + Send>;

/// Runs once per loop iteration while registered. Its presence keeps the
/// loop from blocking.
pub type IdleCallback = Box<dyn FnMut() + Send>;

/// Wakes a host loop from any thread
pub type Waker = Arc<dyn Fn() + Send + Sync>;

/// The primitives a host loop must expose to the bridge
pub trait HostLoop: Send + Sync {
    /// Register a callback run once per iteration, before blocking for I/O
    fn add_prepare(&self, callback: PrepareCallback) -> HandleId;

    /// Unregister a prepare callback. Returns false if it was not registered.
    fn remove_prepare(&self, id: HandleId) -> bool;

    /// Register a perpetually ready callback
    fn add_idle(&self, callback: IdleCallback) -> HandleId;

    /// Unregister an idle callback. Returns false if it was not registered.
    fn remove_idle(&self, id: HandleId) -> bool;

    /// A handle that interrupts a blocking wait
    fn waker(&self) -> Waker;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_id_display() {
        let id = HandleId::new(7);
        assert_eq!(id.raw(), 7);
        assert_eq!(id.to_string(), "handle#7");
    }
}
