//! # Sinter Framework
//!
//! Plugin routing on top of [`sinter_core`].
//!
//! This layer provides:
//! - The [`Plugin`] contract and the linked [`PluginCatalog`]
//! - Rule compilation and event-type matching
//! - The [`DispatchPolicy`] port and a serde-configured [`StaticPolicy`]
//! - Per-scope cooldowns and message dedup ([`Throttle`])
//! - Priority-ordered named callbacks ([`HandlerRegistry`])
//! - The atomically swapped [`PluginRegistry`] and the [`RuleRouter`]
//! - Hot reload of plugin manifests ([`reload`])
//!
//! ```text
//! Arc<Event> ──▶ RuleRouter
//!                  ├─ extended tier      (no gating)
//!                  ├─ precheck           (policy + throttle)
//!                  ├─ accept ─▶ context ─▶ rules by priority ─▶ fallback
//!                  └─▶ handled: bool
//!
//! HotReloadSupervisor ──apply_source / remove_source──▶ PluginRegistry
//! ```

pub mod context_store;
pub mod error;
pub mod hooks;
pub mod plugin;
pub mod policy;
pub mod registry;
pub mod reload;
pub mod router;
pub mod rule;
pub mod task;
pub mod throttle;

#[doc(hidden)]
pub use linkme;

pub use async_trait::async_trait;

pub use context_store::{Continuation, ContextStore};
pub use error::{LoadError, LoadResult, PluginError, ReloadError};
pub use hooks::{HandlerOutcome, HandlerRegistry, HookCall, HookFn, HookSpec, hook_fn};
pub use plugin::catalog::{PLUGIN_CATALOG, PluginCatalog, PluginFactory};
pub use plugin::registration::{PluginDefinition, PluginRegistration, build_registration};
pub use plugin::{Accept, HandlerContext, HookDecl, Outcome, Plugin, PluginMeta, Priority};
pub use policy::{Cooldowns, DispatchPolicy, OpenPolicy, PolicyConfig, StaticPolicy};
pub use registry::{PluginRegistry, RegistrySnapshot, SwapSummary};
pub use reload::{HotReloadSupervisor, LoadReport, ManifestLoader, PluginLoader, PollingWatcher, SourceWatcher};
pub use router::{DispatchReport, Gate, Resolution, RuleRouter, StatsSnapshot};
pub use rule::{EventFilter, Permission, RuleSpec};
pub use task::{NoopScheduler, Scheduler, TaskDescriptor, TaskSpec};
pub use throttle::Throttle;

/// Everything a plugin author needs.
///
/// ```rust,ignore
/// use sinter_framework::prelude::*;
/// ```
pub mod prelude {
    pub use crate::async_trait;
    pub use crate::register_plugin;
    pub use crate::{
        Accept, EventFilter, HandlerContext, HandlerOutcome, HookCall, Outcome, Permission, Plugin,
        PluginMeta, RuleSpec, TaskSpec,
    };
    pub use serde_json::{Value, json};
    pub use sinter_core::{BoxError, Event};
}
