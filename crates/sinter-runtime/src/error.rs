//! Runtime error types.

use thiserror::Error;

use crate::config::ConfigError;

/// Errors that can occur during runtime operations.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// `start` was called on a running runtime.
    #[error("Runtime is already running")]
    AlreadyRunning,

    /// `stop` was called on a runtime that is not running.
    #[error("Runtime is not running")]
    NotRunning,
}

/// Result type for runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;
