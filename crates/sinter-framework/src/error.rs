//! Error types for the Sinter framework.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;

use futures::FutureExt;
use thiserror::Error;

use sinter_core::BoxError;

/// Errors raised while building or invoking a plugin.
#[derive(Debug, Clone, Error)]
pub enum PluginError {
    /// A rule pattern failed to compile.
    #[error("invalid pattern '{pattern}': {reason}")]
    InvalidPattern {
        /// The offending pattern.
        pattern: String,
        /// Compiler message.
        reason: String,
    },

    /// `init` did not finish within the configured timeout.
    #[error("plugin '{plugin}' init timed out after {millis} ms")]
    InitTimeout {
        /// Plugin name.
        plugin: String,
        /// Timeout that elapsed.
        millis: u128,
    },

    /// `init` returned an error.
    #[error("plugin '{plugin}' init failed: {reason}")]
    InitFailed {
        /// Plugin name.
        plugin: String,
        /// Reason for failure.
        reason: String,
    },

    /// A plugin callback panicked.
    #[error("plugin callback panicked: {0}")]
    Panicked(String),
}

/// Errors raised while loading plugin sources.
#[derive(Debug, Error)]
pub enum LoadError {
    /// Reading the source failed.
    #[error("failed to read '{path}': {source}")]
    Io {
        /// Source path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The source could not be parsed.
    #[error("failed to parse '{path}': {reason}")]
    Parse {
        /// Source path.
        path: PathBuf,
        /// Parser message.
        reason: String,
    },

    /// The source declares a plugin kind nothing provides.
    #[error("plugin kind '{kind}' required by '{path}' is not in the catalog")]
    MissingDependency {
        /// Source path.
        path: PathBuf,
        /// Unresolved kind.
        kind: String,
    },

    /// The source produced no usable plugin.
    #[error("'{path}' exports no valid plugin")]
    NoValidExports {
        /// Source path.
        path: PathBuf,
    },

    /// A plugin could not be built.
    #[error(transparent)]
    Plugin(#[from] PluginError),
}

/// Result type for load operations.
pub type LoadResult<T> = Result<T, LoadError>;

/// Errors raised by the hot reload machinery.
#[derive(Debug, Error)]
pub enum ReloadError {
    /// A plugin directory could not be scanned.
    #[error("failed to scan plugin directory '{path}': {source}")]
    Scan {
        /// Directory path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Loading a changed source failed; the previous registration is kept.
    #[error(transparent)]
    Load(#[from] LoadError),

    /// The change channel closed while a watcher was still running.
    #[error("source change channel closed")]
    ChannelClosed,
}

/// Runs a plugin callback, turning panics into errors.
///
/// Every call into plugin code goes through this so that a misbehaving
/// plugin can only decline, never abort the surrounding dispatch loop.
pub(crate) async fn guarded<T, F>(fut: F) -> Result<T, BoxError>
where
    F: Future<Output = Result<T, BoxError>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(PluginError::Panicked(panic_message(panic.as_ref())).into()),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
