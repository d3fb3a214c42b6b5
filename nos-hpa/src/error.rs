//! Error handling for the huge-page shard

use core::fmt;
use alloc::string::{String, ToString};

/// Error type returned by shard operations and hooks
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Invalid argument
    InvalidArgument(String),
    /// Invalid state
    InvalidState(String),
    /// Out of memory (the mapper could not supply a unit)
    OutOfMemory,
    /// Configuration error
    ConfigError(String),
    /// Operation not supported by the platform
    NotSupported(String),
    /// An injected hook reported failure
    HookFailed(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidArgument(msg) => write!(f, "Invalid argument: {}", msg),
            Error::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            Error::OutOfMemory => write!(f, "Out of memory"),
            Error::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            Error::NotSupported(msg) => write!(f, "Not supported: {}", msg),
            Error::HookFailed(msg) => write!(f, "Hook failed: {}", msg),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

/// Result type for operations that can fail
pub type Result<T> = core::result::Result<T, Error>;

/// Creates a new invalid argument error
pub fn invalid_argument(msg: &str) -> Error {
    Error::InvalidArgument(msg.to_string())
}

/// Creates a new invalid state error
pub fn invalid_state(msg: &str) -> Error {
    Error::InvalidState(msg.to_string())
}

/// Creates a new out of memory error
pub fn out_of_memory() -> Error {
    Error::OutOfMemory
}

/// Creates a new config error
pub fn config_error(msg: &str) -> Error {
    Error::ConfigError(msg.to_string())
}

/// Creates a new not supported error
pub fn not_supported(msg: &str) -> Error {
    Error::NotSupported(msg.to_string())
}

/// Creates a new hook failure error
pub fn hook_failed(msg: &str) -> Error {
    Error::HookFailed(msg.to_string())
}
