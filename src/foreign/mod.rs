//! The foreign event source.
//!
//! `MainContext` plays the role of a GLib main context: SDK callbacks are
//! attached to it as sources, and one `iteration` prepares, checks and
//! dispatches whatever is ready. The bridge runs non-blocking iterations from
//! inside the host loop.

pub mod context;
pub mod sources;

pub use context::{MainContext, SourceId};
pub use sources::{ChannelSource, IdleSource, TimeoutSource};

use std::time::{Duration, Instant};

/// Priority for sources that must run before everything else
pub const PRIORITY_HIGH: i32 = -100;

/// Priority for ordinary event sources
pub const PRIORITY_DEFAULT: i32 = 0;

/// Priority for idle sources; they only run when nothing else is ready
pub const PRIORITY_DEFAULT_IDLE: i32 = 200;

/// Whether a source stays attached after a dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlFlow {
    /// Keep the source attached
    Continue,
    /// Remove the source from its context
    Break,
}

/// An event source attached to a `MainContext`.
///
/// `prepare` and `check` run with the context locked and must not call back
/// into it. `dispatch` runs unlocked and may attach or remove sources.
pub trait Source: Send {
    /// Called before the context polls. Returns whether the source is
    /// already ready and, if not, how long until it will be.
    fn prepare(&mut self, now: Instant) -> (bool, Option<Duration>);

    /// Called after the context polled. Returns whether the source is ready.
    fn check(&mut self, now: Instant) -> bool;

    /// Deliver the pending event(s)
    fn dispatch(&mut self) -> ControlFlow;

    /// Lower values dispatch first
    fn priority(&self) -> i32 {
        PRIORITY_DEFAULT
    }

    /// Name used in logs
    fn name(&self) -> &str {
        "source"
    }
}
