//! Sinter Runtime - orchestration layer for the Sinter dispatch engine.
//!
//! This crate provides:
//! - Layered configuration (`SinterConfig`, `ConfigLoader`)
//! - Logging setup (`LoggingBuilder`, `init_from_config`)
//! - The runtime itself (`SinterRuntime`): event intake, plugin loading,
//!   hot reload and periodic compaction
//!
//! ```rust,ignore
//! use sinter_runtime::SinterRuntime;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let runtime = SinterRuntime::builder().build()?;
//!     runtime.run().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod logging;
pub mod runtime;

pub use config::{ConfigError, ConfigLoader, ConfigResult, LoggingConfig, PluginsConfig, SinterConfig};
pub use error::{RuntimeError, RuntimeResult};
pub use logging::{LoggingBuilder, LoggingError, SpanEvents, init_from_config};
pub use runtime::{FAILURE_ACK, RuntimeBuilder, SinterRuntime};

// Re-export tracing for use by plugin crates
pub use tracing;
pub use tracing_subscriber;

/// Logging macros.
pub mod prelude {
    pub use tracing::{Level, debug, error, info, instrument, span, trace, warn};
}
