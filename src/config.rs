//! Bridge configuration types and defaults.
//!
//! This module defines how the foreign main context is kept alive on the host
//! loop, how large listener queues are, and the default log filter.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default queue capacity per listener
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// Upper bound on queue capacity per listener
pub const MAX_CHANNEL_CAPACITY: usize = 64 * 1024;

/// Default number of events a listener receives per loop iteration
pub const DEFAULT_DISPATCH_BUDGET: usize = 32;

/// Default tracing filter directive
pub const DEFAULT_LOG_FILTER: &str = "artik_loop_bridge=info";

/// How the bridge keeps the host loop iterating while attached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WakeStrategy {
    /// Register an always-ready idle handle so the host loop never blocks
    #[default]
    BusyPoll,
    /// Let the host loop block and wake it whenever the main context has work
    Wakeup,
}

impl std::fmt::Display for WakeStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WakeStrategy::BusyPoll => write!(f, "busyPoll"),
            WakeStrategy::Wakeup => write!(f, "wakeup"),
        }
    }
}

impl std::str::FromStr for WakeStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "busyPoll" | "busy_poll" => Ok(WakeStrategy::BusyPoll),
            "wakeup" => Ok(WakeStrategy::Wakeup),
            other => Err(ConfigError::InvalidValue {
                field: "wake_strategy".into(),
                reason: format!("unknown strategy '{}'", other),
            }),
        }
    }
}

/// Configuration for the loop bridge
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeConfig {
    /// Keep-alive strategy (default: busy poll)
    #[serde(default)]
    pub wake_strategy: WakeStrategy,

    /// Queue capacity per listener (default: 64)
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Events delivered per listener per loop iteration (default: 32)
    #[serde(default = "default_dispatch_budget")]
    pub dispatch_budget: usize,

    /// Tracing filter installed by `install_logging` when `RUST_LOG` is unset
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            wake_strategy: WakeStrategy::default(),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            dispatch_budget: DEFAULT_DISPATCH_BUDGET,
            log_filter: DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

impl BridgeConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a JSON configuration. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: BridgeConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Set the keep-alive strategy
    pub fn with_wake_strategy(mut self, strategy: WakeStrategy) -> Self {
        self.wake_strategy = strategy;
        self
    }

    /// Set the per-listener queue capacity
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    /// Set the per-iteration dispatch budget
    pub fn with_dispatch_budget(mut self, budget: usize) -> Self {
        self.dispatch_budget = budget;
        self
    }

    /// Set the default log filter
    pub fn with_log_filter(mut self, filter: impl Into<String>) -> Self {
        self.log_filter = filter.into();
        self
    }

    /// Install the global tracing subscriber with `log_filter`.
    /// Returns false if a subscriber was already installed.
    pub fn install_logging(&self) -> Result<bool, crate::error::BridgeError> {
        crate::init_logging(&self.log_filter)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.channel_capacity == 0 || self.channel_capacity > MAX_CHANNEL_CAPACITY {
            return Err(ConfigError::InvalidValue {
                field: "channel_capacity".into(),
                reason: format!("must be between 1 and {}", MAX_CHANNEL_CAPACITY),
            });
        }

        if self.dispatch_budget == 0 {
            return Err(ConfigError::InvalidValue {
                field: "dispatch_budget".into(),
                reason: "must be greater than 0".into(),
            });
        }

        if self.log_filter.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "log_filter".into(),
                reason: "must not be empty".into(),
            });
        }

        Ok(())
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Invalid configuration value
    #[error("Invalid configuration value for {field}: {reason}")]
    InvalidValue {
        /// The field name
        field: String,
        /// The reason it's invalid
        reason: String,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

// Default value functions for serde
fn default_channel_capacity() -> usize {
    DEFAULT_CHANNEL_CAPACITY
}

fn default_dispatch_budget() -> usize {
    DEFAULT_DISPATCH_BUDGET
}

fn default_log_filter() -> String {
    DEFAULT_LOG_FILTER.to_string()
}
