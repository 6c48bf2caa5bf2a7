//! # Sinter
//!
//! Event dispatch and plugin routing for chat bots.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐  raw   ┌────────────┐ Arc<Event> ┌────────────┐
//! │ Adapter  │───────▶│ Normalizer │───────────▶│ RuleRouter │──▶ extended tier
//! └──────────┘        └────────────┘     │      │            │──▶ precheck ─▶ accept ─▶ context
//!      ▲                                 ▼      │            │     ─▶ rules by priority ─▶ fallback
//!      │ reply                      EventBus    └────────────┘
//!      └──────────── ReplyTransport ◀──────────────── plugin handlers
//! ```
//!
//! - **sinter-core**: event model, normalization, TTL maps, history
//! - **sinter-framework**: plugins, policy, throttling, registry, router, hot reload
//! - **sinter-runtime**: configuration, logging, orchestration
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use sinter::prelude::*;
//!
//! #[derive(Default)]
//! struct Echo;
//!
//! #[async_trait]
//! impl Plugin for Echo {
//!     fn meta(&self) -> PluginMeta {
//!         PluginMeta::new("echo").rule(RuleSpec::new("^echo (.+)$", "echo"))
//!     }
//!
//!     async fn handle(&self, _handler: &str, ctx: &HandlerContext) -> Result<Outcome, BoxError> {
//!         ctx.reply(ctx.capture(1).unwrap_or_default()).await?;
//!         Ok(Outcome::Handled)
//!     }
//! }
//!
//! register_plugin!(ECHO, "example.echo", Echo);
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // plugins/echo.plugin.toml:
//!     //   [[plugin]]
//!     //   kind = "example.echo"
//!     SinterRuntime::builder().build()?.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Features
//!
//! - `toml-config` *(default)*: TOML configuration files
//! - `yaml-config`: YAML configuration files
//! - `json-log`: JSON log lines

pub use sinter_core as core;
pub use sinter_framework as framework;
pub use sinter_runtime as runtime;

/// Everything needed to write plugins and start a runtime.
///
/// ```rust,ignore
/// use sinter::prelude::*;
/// ```
pub mod prelude {
    pub use sinter_framework::prelude::*;

    pub use sinter_runtime::{SinterConfig, SinterRuntime};
}
