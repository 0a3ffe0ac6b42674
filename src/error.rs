//! Error types for the loop bridge.
//!
//! The bridge bookkeeping itself never fails. Errors come from configuration,
//! from the Node.js boundary and from ARTIK SDK return codes that feature
//! wrappers translate into host errors.

use serde::{Deserialize, Serialize};

/// Raw ARTIK SDK return codes (`artik_error.h`).
pub mod sdk_codes {
    /// Success
    pub const S_OK: i32 = 0;
    /// Bad arguments
    pub const E_BAD_ARGS: i32 = -7000;
    /// Out of memory
    pub const E_NO_MEM: i32 = -7001;
    /// Operation not supported
    pub const E_NOT_SUPPORTED: i32 = -7002;
    /// Module not initialized
    pub const E_NOT_INITIALIZED: i32 = -7003;
    /// Invalid value
    pub const E_INVALID_VALUE: i32 = -7004;
    /// Access denied
    pub const E_ACCESS_DENIED: i32 = -7005;
    /// Resource busy
    pub const E_BUSY: i32 = -7006;
    /// Operation timed out
    pub const E_TIMEOUT: i32 = -7007;
    /// Overflow
    pub const E_OVERFLOW: i32 = -7008;
    /// Interrupted
    pub const E_INTERRUPTED: i32 = -7009;
    /// Try again later
    pub const E_TRY_AGAIN: i32 = -7010;
    /// Not connected
    pub const E_NOT_CONNECTED: i32 = -7011;
}

/// Error codes for categorizing errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Bad arguments passed to the SDK
    BadArgs,
    /// SDK ran out of memory
    NoMem,
    /// Operation not supported by the SDK or the board
    NotSupported,
    /// SDK module used before initialization
    NotInitialized,
    /// Value out of range
    InvalidValue,
    /// Access to the device was denied
    AccessDenied,
    /// Device or resource busy
    Busy,
    /// Operation timed out
    Timeout,
    /// Buffer or counter overflow
    Overflow,
    /// Operation interrupted
    Interrupted,
    /// Transient failure, retry
    TryAgain,
    /// Remote endpoint not connected
    NotConnected,
    /// Invalid bridge configuration
    InvalidConfig,
    /// Listener or loop already closed
    Closed,
    /// Internal error (bug or unknown SDK code)
    InternalError,
}

impl ErrorCode {
    /// Map a raw SDK return code. Returns `None` for `S_OK`.
    pub fn from_sdk(raw: i32) -> Option<Self> {
        use sdk_codes::*;

        let code = match raw {
            S_OK => return None,
            E_BAD_ARGS => ErrorCode::BadArgs,
            E_NO_MEM => ErrorCode::NoMem,
            E_NOT_SUPPORTED => ErrorCode::NotSupported,
            E_NOT_INITIALIZED => ErrorCode::NotInitialized,
            E_INVALID_VALUE => ErrorCode::InvalidValue,
            E_ACCESS_DENIED => ErrorCode::AccessDenied,
            E_BUSY => ErrorCode::Busy,
            E_TIMEOUT => ErrorCode::Timeout,
            E_OVERFLOW => ErrorCode::Overflow,
            E_INTERRUPTED => ErrorCode::Interrupted,
            E_TRY_AGAIN => ErrorCode::TryAgain,
            E_NOT_CONNECTED => ErrorCode::NotConnected,
            _ => ErrorCode::InternalError,
        };
        Some(code)
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCode::BadArgs => write!(f, "BAD_ARGS"),
            ErrorCode::NoMem => write!(f, "NO_MEM"),
            ErrorCode::NotSupported => write!(f, "NOT_SUPPORTED"),
            ErrorCode::NotInitialized => write!(f, "NOT_INITIALIZED"),
            ErrorCode::InvalidValue => write!(f, "INVALID_VALUE"),
            ErrorCode::AccessDenied => write!(f, "ACCESS_DENIED"),
            ErrorCode::Busy => write!(f, "BUSY"),
            ErrorCode::Timeout => write!(f, "TIMEOUT"),
            ErrorCode::Overflow => write!(f, "OVERFLOW"),
            ErrorCode::Interrupted => write!(f, "INTERRUPTED"),
            ErrorCode::TryAgain => write!(f, "TRY_AGAIN"),
            ErrorCode::NotConnected => write!(f, "NOT_CONNECTED"),
            ErrorCode::InvalidConfig => write!(f, "INVALID_CONFIG"),
            ErrorCode::Closed => write!(f, "CLOSED"),
            ErrorCode::InternalError => write!(f, "INTERNAL_ERROR"),
        }
    }
}

/// A failed SDK call, ready to be surfaced to the host as an exception
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "camelCase")]
#[error("[{code}] {operation} failed (sdk code {raw})")]
pub struct SdkError {
    /// Categorized error code
    pub code: ErrorCode,

    /// Raw SDK return code
    pub raw: i32,

    /// Operation that failed, e.g. `gpio.request`
    pub operation: String,
}

impl SdkError {
    /// Translate a raw SDK return code. `S_OK` yields `None`.
    pub fn from_code(raw: i32, operation: impl Into<String>) -> Option<Self> {
        ErrorCode::from_sdk(raw).map(|code| Self {
            code,
            raw,
            operation: operation.into(),
        })
    }
}

/// Check an SDK return code, turning anything but `S_OK` into an error.
pub fn check_sdk(raw: i32, operation: &str) -> Result<()> {
    match SdkError::from_code(raw, operation) {
        None => Ok(()),
        Some(err) => Err(BridgeError::Sdk(err)),
    }
}

/// Main error type for the bridge
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// SDK call failed
    #[error("SDK error: {0}")]
    Sdk(#[from] SdkError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Listener, feature or loop was already closed
    #[error("Closed: {0}")]
    Closed(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Error code reported to the host
    pub fn code(&self) -> ErrorCode {
        match self {
            BridgeError::Sdk(e) => e.code,
            BridgeError::Config(_) => ErrorCode::InvalidConfig,
            BridgeError::Closed(_) => ErrorCode::Closed,
            BridgeError::Io(_) => ErrorCode::InternalError,
        }
    }

    /// Reason string used when the error becomes a host exception
    pub fn to_host_reason(&self) -> String {
        match self {
            // SdkError already carries its code prefix
            BridgeError::Sdk(e) => e.to_string(),
            other => format!("[{}] {}", other.code(), other),
        }
    }
}

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_display() {
        assert_eq!(ErrorCode::BadArgs.to_string(), "BAD_ARGS");
        assert_eq!(ErrorCode::NotInitialized.to_string(), "NOT_INITIALIZED");
    }

    #[test]
    fn test_sdk_code_mapping() {
        assert_eq!(ErrorCode::from_sdk(sdk_codes::S_OK), None);
        assert_eq!(ErrorCode::from_sdk(sdk_codes::E_BUSY), Some(ErrorCode::Busy));
        assert_eq!(
            ErrorCode::from_sdk(sdk_codes::E_NOT_CONNECTED),
            Some(ErrorCode::NotConnected)
        );
        assert_eq!(ErrorCode::from_sdk(-42), Some(ErrorCode::InternalError));
    }

    #[test]
    fn test_check_sdk() {
        assert!(check_sdk(sdk_codes::S_OK, "gpio.request").is_ok());

        let err = check_sdk(sdk_codes::E_ACCESS_DENIED, "gpio.request").unwrap_err();
        assert_eq!(err.code(), ErrorCode::AccessDenied);
        assert_eq!(
            err.to_host_reason(),
            "[ACCESS_DENIED] gpio.request failed (sdk code -7005)"
        );
    }

    #[test]
    fn test_sdk_error_serialization() {
        let err = SdkError::from_code(sdk_codes::E_TIMEOUT, "mqtt.connect").unwrap();
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("\"code\":\"TIMEOUT\""));
        assert!(json.contains("\"operation\":\"mqtt.connect\""));
    }

    #[test]
    fn test_sdk_error_source_chain() {
        let err = SdkError::from_code(sdk_codes::E_NO_MEM, "i2c.read").unwrap();
        assert_eq!(err.to_string(), "[NO_MEM] i2c.read failed (sdk code -7001)");

        let wrapped = BridgeError::from(err);
        let source = std::error::Error::source(&wrapped).unwrap();
        assert_eq!(source.to_string(), "[NO_MEM] i2c.read failed (sdk code -7001)");
    }

    #[test]
    fn test_config_error_maps_to_invalid_config() {
        let err = BridgeError::from(crate::config::ConfigError::InvalidValue {
            field: "dispatch_budget".into(),
            reason: "must be greater than 0".into(),
        });
        assert_eq!(err.code(), ErrorCode::InvalidConfig);
        assert!(err.to_host_reason().starts_with("[INVALID_CONFIG] Configuration error:"));
    }

    #[test]
    fn test_host_reason_prefix() {
        let err = BridgeError::Closed("listener 'edge'".into());
        assert_eq!(err.to_host_reason(), "[CLOSED] Closed: listener 'edge'");
    }
}
