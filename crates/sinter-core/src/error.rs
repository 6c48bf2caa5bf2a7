//! Unified error types for the Sinter core.
//!
//! Framework-level errors (plugin loading, reload) live in `sinter-framework`.

use thiserror::Error;

/// Boxed error type used for everything that crosses a plugin boundary.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

// =============================================================================
// Core Errors
// =============================================================================

/// Errors raised by core primitives.
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    /// The event carries no reply transport.
    #[error("event '{event_id}' has no reply transport attached")]
    NoTransport {
        /// Id of the event that was asked to reply.
        event_id: String,
    },

    /// The reply transport rejected the message.
    #[error("failed to send reply: {0}")]
    SendFailed(String),

    /// A history subscriber failed.
    #[error("subscriber for '{category}' failed: {reason}")]
    Subscriber {
        /// Category the subscriber listened on.
        category: String,
        /// Reason for failure.
        reason: String,
    },
}

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;
