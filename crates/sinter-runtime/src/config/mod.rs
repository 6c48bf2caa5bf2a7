//! Configuration module for the Sinter runtime.
//!
//! Layered loading through figment (defaults, files, `SINTER_*` environment,
//! programmatic overrides) plus range validation.

pub mod error;
pub mod loader;
pub mod schema;
pub mod validation;

pub use error::{ConfigError, ConfigResult};
pub use loader::{ConfigLoader, Profile, load_config, load_config_from_file};
pub use schema::{
    LogFormat, LogLevel, LogOutput, LogRotation, LoggingConfig, PluginsConfig, RuntimeConfig,
    SinterConfig, SpanEventConfig,
};
pub use validation::validate_config;
