//! Building plugin registrations.
//!
//! A [`PluginDefinition`] says *which* catalog kind to instantiate and how to
//! override its declared [`PluginMeta`]. [`build_registration`] resolves the
//! factory, merges the overrides, compiles the rules and runs `init` under a
//! timeout, producing an immutable [`PluginRegistration`].

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use super::catalog::PluginFactory;
use super::{HookDecl, Plugin, PluginMeta, Priority};
use crate::error::{PluginError, guarded};
use crate::rule::{EventFilter, PatternCache, Rule, RuleSpec};
use crate::task::{TaskDescriptor, TaskSpec};

/// Default bound on plugin `init`.
pub const DEFAULT_INIT_TIMEOUT: Duration = Duration::from_secs(5);

/// One plugin entry of a manifest, or a programmatic registration request.
///
/// Every field except `kind` overrides the plugin's own metadata when set.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PluginDefinition {
    /// Catalog kind to instantiate.
    pub kind: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub event: Option<EventFilter>,
    #[serde(default)]
    pub bypass_throttle: Option<bool>,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default, rename = "fallback")]
    pub has_fallback: Option<bool>,
    #[serde(default, rename = "rule")]
    pub rules: Option<Vec<RuleSpec>>,
    #[serde(default, rename = "task")]
    pub tasks: Option<Vec<TaskSpec>>,
    #[serde(default, rename = "hook")]
    pub hooks: Option<Vec<HookDecl>>,
    /// Passed to `init` and exposed through the handler context.
    #[serde(default)]
    pub config: Value,
}

impl PluginDefinition {
    /// A definition that uses the plugin's metadata unchanged.
    pub fn of_kind(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            ..Default::default()
        }
    }

    fn apply(&self, mut meta: PluginMeta) -> PluginMeta {
        if let Some(name) = &self.name {
            meta.name = name.clone();
        }
        if let Some(priority) = self.priority {
            meta.priority = priority;
        }
        if let Some(event) = &self.event {
            meta.event = event.clone();
        }
        if let Some(bypass) = self.bypass_throttle {
            meta.bypass_throttle = bypass;
        }
        if let Some(namespace) = &self.namespace {
            meta.namespace = Some(namespace.clone());
        }
        if let Some(fallback) = self.has_fallback {
            meta.has_fallback = fallback;
        }
        if let Some(rules) = &self.rules {
            meta.rules = rules.clone();
        }
        if let Some(tasks) = &self.tasks {
            meta.tasks = tasks.clone();
        }
        if let Some(hooks) = &self.hooks {
            meta.hooks = hooks.clone();
        }
        meta
    }
}

/// A loaded, routable plugin.
pub struct PluginRegistration {
    /// Source group: manifest path relative to its plugin directory, or the
    /// catalog kind for programmatic registrations.
    pub key: Arc<str>,
    pub name: Arc<str>,
    pub kind: String,
    pub namespace: String,
    /// File the registration was loaded from.
    pub source: Option<PathBuf>,
    pub priority: Priority,
    pub bypass_throttle: bool,
    pub event: EventFilter,
    pub rules: Vec<Rule>,
    pub tasks: Vec<TaskDescriptor>,
    pub hooks: Vec<HookDecl>,
    pub has_fallback: bool,
    pub config: Arc<Value>,
    factory: PluginFactory,
}

impl PluginRegistration {
    /// Creates a fresh plugin instance.
    pub fn instantiate(&self) -> Box<dyn Plugin> {
        (self.factory)()
    }

    pub fn is_extended(&self) -> bool {
        self.priority.is_extended()
    }

    /// Returns `true` if `other` is the same plugin (same key and name).
    pub fn same_identity(&self, other: &PluginRegistration) -> bool {
        self.key == other.key && self.name == other.name
    }

    pub(crate) fn factory(&self) -> PluginFactory {
        Arc::clone(&self.factory)
    }
}

impl std::fmt::Debug for PluginRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistration")
            .field("key", &self.key)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("priority", &self.priority)
            .field("rules", &self.rules.len())
            .field("has_fallback", &self.has_fallback)
            .finish_non_exhaustive()
    }
}

/// Builds a registration for `definition` from `factory`.
///
/// `init` runs on a prototype instance and must finish within
/// `init_timeout`; a timeout, error or panic skips the plugin.
pub async fn build_registration(
    key: &str,
    source: Option<PathBuf>,
    definition: &PluginDefinition,
    factory: PluginFactory,
    patterns: &PatternCache,
    init_timeout: Duration,
) -> Result<PluginRegistration, PluginError> {
    let prototype = factory();
    let meta = definition.apply(prototype.meta());
    let rules = patterns.compile_rules(&meta.rules, &meta.event)?;

    match tokio::time::timeout(init_timeout, guarded(prototype.init(&definition.config))).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            return Err(PluginError::InitFailed {
                plugin: meta.name,
                reason: e.to_string(),
            });
        }
        Err(_) => {
            warn!(plugin = %meta.name, timeout_ms = init_timeout.as_millis(), "Plugin init timed out");
            return Err(PluginError::InitTimeout {
                plugin: meta.name,
                millis: init_timeout.as_millis(),
            });
        }
    }

    let tasks = meta
        .tasks
        .iter()
        .map(|t| TaskDescriptor::from_spec(key, t))
        .collect();
    debug!(
        key,
        plugin = %meta.name,
        priority = ?meta.priority,
        rules = rules.len(),
        "Plugin registration built"
    );

    Ok(PluginRegistration {
        key: Arc::from(key),
        name: Arc::from(meta.name.as_str()),
        kind: definition.kind.clone(),
        namespace: meta.namespace.unwrap_or_else(|| key.to_string()),
        source,
        priority: meta.priority,
        bypass_throttle: meta.bypass_throttle,
        event: meta.event,
        rules,
        tasks,
        hooks: meta.hooks,
        has_fallback: meta.has_fallback,
        config: Arc::new(definition.config.clone()),
        factory,
    })
}
