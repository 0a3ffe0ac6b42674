//! # ARTIK Loop Bridge
//!
//! Bridges the event loop an SDK dispatches its callbacks on (the "main
//! context") into a host event loop, so that SDK events reach host
//! listeners only while the host loop is iterating.
//!
//! ## Architecture
//!
//! ```text
//! SDK callback thread(s)
//!     │
//!     │ TrampolineSender::send (bounded queue, wakes context)
//!     ▼
//! MainContext (foreign loop: sources, priorities, dispatch)
//!     ▲
//!     │ one non-blocking iteration per host tick
//!     │
//! LoopBridge (refcounted prepare + keep-alive registration)
//!     │
//!     ▼
//! Host loop (EventLoop / Node.js via N-API)
//! ```
//!
//! ## Features
//!
//! - **Refcounted attachment**: the context is polled exactly while at least
//!   one feature wrapper holds a reference
//! - **Safe callback delivery**: listeners run on the host loop thread, and
//!   events sent after unregistering are dropped silently
//! - **Two keep-alive strategies**: busy polling or wakeup-driven blocking
//! - **N-API bindings** behind the `napi` feature

#![warn(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod bridge;
pub mod config;
pub mod error;
pub mod feature;
pub mod foreign;
pub mod host;
pub mod metrics;
pub mod trampoline;

#[cfg(feature = "napi")]
pub mod node;

// Re-export commonly used types
pub use bridge::{BridgeGuard, BridgeStats, LoopBridge};
pub use config::{BridgeConfig, WakeStrategy};
pub use error::{BridgeError, ErrorCode, SdkError};
pub use feature::FeatureWrapper;
pub use foreign::{MainContext, SourceId};
pub use host::{EventLoop, HostLoop, RunMode};
pub use metrics::{BridgeMetrics, MetricsSnapshot};
pub use trampoline::{Delivery, Trampoline, TrampolineSender};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Install a global `tracing` subscriber. `RUST_LOG` takes precedence over
/// `filter`. Returns false if a subscriber was already installed.
pub fn init_logging(filter: &str) -> Result<bool, BridgeError> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(filter))
        .map_err(|e| {
            BridgeError::Config(config::ConfigError::InvalidValue {
                field: "log_filter".into(),
                reason: e.to_string(),
            })
        })?;

    Ok(tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .try_init()
        .is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(VERSION, "1.0.0");
    }

    #[test]
    fn test_init_logging_twice() {
        let _ = init_logging(config::DEFAULT_LOG_FILTER);
        assert!(!init_logging(config::DEFAULT_LOG_FILTER).unwrap());
    }
}
