//! Plugin contract.
//!
//! A plugin is a type implementing [`Plugin`]. It describes itself through
//! [`PluginMeta`] (rules, tasks, hooks, tier and priority) and is created by
//! a [`PluginFactory`] looked up in the [`PluginCatalog`] by *kind*.
//!
//! # Instances
//!
//! ```text
//! load time:   factory() ──▶ prototype ──▶ meta() + init(config) ──▶ PluginRegistration
//! dispatch:    factory() ──▶ fresh instance per event ──▶ accept / continuations / handle / fallback
//! hooks:       factory() ──▶ fresh instance per call  ──▶ hook(handler, call)
//! ```
//!
//! Long-lived state belongs in the plugin's config or in shared handles the
//! factory captures, not in the per-event instance.
//!
//! # Example
//!
//! ```rust,ignore
//! use sinter_framework::prelude::*;
//!
//! #[derive(Default)]
//! struct Echo;
//!
//! #[async_trait]
//! impl Plugin for Echo {
//!     fn meta(&self) -> PluginMeta {
//!         PluginMeta::new("echo")
//!             .priority(100)
//!             .rule(RuleSpec::new(r"^#echo\s+(.+)$", "echo"))
//!     }
//!
//!     async fn handle(&self, handler: &str, ctx: &HandlerContext) -> Result<Outcome, BoxError> {
//!         match handler {
//!             "echo" => {
//!                 ctx.reply(ctx.capture(1).unwrap_or_default()).await?;
//!                 Ok(Outcome::Handled)
//!             }
//!             _ => Ok(Outcome::Declined),
//!         }
//!     }
//! }
//!
//! register_plugin!(ECHO, "echo", Echo);
//! ```
//!
//! [`PluginFactory`]: catalog::PluginFactory
//! [`PluginCatalog`]: catalog::PluginCatalog

pub mod catalog;
pub mod registration;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use sinter_core::{BoxError, CoreResult, Event};

use crate::context_store::{Continuation, ContextStore};
use crate::hooks::{DEFAULT_HOOK_PRIORITY, HandlerOutcome, HookCall};
use crate::rule::{EventFilter, RuleSpec};
use crate::task::TaskSpec;

/// Priority given to plugins that declare none.
pub const DEFAULT_PRIORITY: i32 = 5000;

// =============================================================================
// Outcomes
// =============================================================================

/// Result of the accept phase for one plugin.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Accept {
    /// Keep asking the next plugin.
    #[default]
    Continue,
    /// Stop the accept phase and move on to continuations and rules.
    Proceed,
    /// The plugin consumed the event; dispatch ends as handled.
    Stop,
}

/// Result of a rule handler, continuation or fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Handled,
    /// Not for this handler; keep trying.
    Declined,
}

impl From<bool> for Outcome {
    fn from(handled: bool) -> Self {
        if handled {
            Self::Handled
        } else {
            Self::Declined
        }
    }
}

impl Outcome {
    pub fn is_handled(self) -> bool {
        self == Self::Handled
    }
}

// =============================================================================
// Metadata
// =============================================================================

/// Dispatch tier and ordering of a plugin.
///
/// Serialized as an integer or the string `"extended"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    /// Priority tier; lower values run earlier.
    Value(i32),
    /// Extended tier; runs first on every matching event, ungated.
    Extended,
}

impl Default for Priority {
    fn default() -> Self {
        Self::Value(DEFAULT_PRIORITY)
    }
}

impl Priority {
    pub fn is_extended(self) -> bool {
        matches!(self, Self::Extended)
    }

    /// Sort key within a tier.
    pub fn value(self) -> i32 {
        match self {
            Self::Value(v) => v,
            Self::Extended => i32::MIN,
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum PriorityRepr {
    Value(i32),
    Named(String),
}

impl Serialize for Priority {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Value(v) => PriorityRepr::Value(*v),
            Self::Extended => PriorityRepr::Named("extended".to_string()),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Priority {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match PriorityRepr::deserialize(deserializer)? {
            PriorityRepr::Value(v) => Ok(Self::Value(v)),
            PriorityRepr::Named(s) if s.eq_ignore_ascii_case("extended") => Ok(Self::Extended),
            PriorityRepr::Named(s) => Err(serde::de::Error::custom(format!(
                "invalid priority '{s}', expected an integer or \"extended\""
            ))),
        }
    }
}

/// A hook the plugin registers into the
/// [`HandlerRegistry`](crate::hooks::HandlerRegistry).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookDecl {
    /// Registry key.
    pub key: String,
    /// Plugin handler passed to [`Plugin::hook`].
    #[serde(alias = "fnc")]
    pub handler: String,
    #[serde(default = "default_hook_priority")]
    pub priority: i32,
}

fn default_hook_priority() -> i32 {
    DEFAULT_HOOK_PRIORITY
}

/// Static description of a plugin.
#[derive(Debug, Clone, PartialEq)]
pub struct PluginMeta {
    /// Display name.
    pub name: String,
    /// Hook namespace; the registration key when absent.
    pub namespace: Option<String>,
    pub priority: Priority,
    /// Rule matches skip rate limiting.
    pub bypass_throttle: bool,
    /// Events the plugin wants at all; also the default for its rules.
    pub event: EventFilter,
    pub rules: Vec<RuleSpec>,
    pub tasks: Vec<TaskSpec>,
    pub hooks: Vec<HookDecl>,
    /// [`Plugin::fallback`] should be tried for unhandled events.
    pub has_fallback: bool,
}

impl PluginMeta {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: None,
            priority: Priority::default(),
            bypass_throttle: false,
            event: EventFilter::default(),
            rules: Vec::new(),
            tasks: Vec::new(),
            hooks: Vec::new(),
            has_fallback: false,
        }
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = Priority::Value(priority);
        self
    }

    /// Moves the plugin to the extended tier.
    pub fn extended(mut self) -> Self {
        self.priority = Priority::Extended;
        self
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn bypass_throttle(mut self) -> Self {
        self.bypass_throttle = true;
        self
    }

    pub fn event(mut self, filter: impl Into<EventFilter>) -> Self {
        self.event = filter.into();
        self
    }

    pub fn rule(mut self, rule: RuleSpec) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn task(mut self, task: TaskSpec) -> Self {
        self.tasks.push(task);
        self
    }

    /// Registers `handler` under the hook `key`.
    pub fn hook(mut self, key: impl Into<String>, handler: impl Into<String>, priority: i32) -> Self {
        self.hooks.push(HookDecl {
            key: key.into(),
            handler: handler.into(),
            priority,
        });
        self
    }

    pub fn fallback(mut self) -> Self {
        self.has_fallback = true;
        self
    }
}

// =============================================================================
// Handler context
// =============================================================================

/// Everything a plugin callback can see about the event it is handling.
#[derive(Clone)]
pub struct HandlerContext {
    event: Arc<Event>,
    plugin_key: Arc<str>,
    plugin_name: Arc<str>,
    text: Arc<str>,
    has_alias: bool,
    captures: Vec<Option<String>>,
    continuation: Option<Continuation>,
    config: Arc<Value>,
    contexts: Arc<ContextStore>,
}

impl HandlerContext {
    pub(crate) fn new(
        event: Arc<Event>,
        registration: &registration::PluginRegistration,
        text: Arc<str>,
        has_alias: bool,
        contexts: Arc<ContextStore>,
    ) -> Self {
        Self {
            event,
            plugin_key: Arc::clone(&registration.key),
            plugin_name: Arc::clone(&registration.name),
            text,
            has_alias,
            captures: Vec::new(),
            continuation: None,
            config: Arc::clone(&registration.config),
            contexts,
        }
    }

    pub(crate) fn with_captures(&self, captures: Vec<Option<String>>) -> Self {
        Self {
            captures,
            ..self.clone()
        }
    }

    pub(crate) fn with_continuation(&self, continuation: Continuation) -> Self {
        Self {
            continuation: Some(continuation),
            ..self.clone()
        }
    }

    pub fn event(&self) -> &Arc<Event> {
        &self.event
    }

    /// Registration key of the plugin (its source path or catalog kind).
    pub fn plugin_key(&self) -> &str {
        &self.plugin_key
    }

    pub fn plugin_name(&self) -> &str {
        &self.plugin_name
    }

    /// Matchable text with any leading bot alias stripped.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Returns `true` if the message addressed the bot by a name alias.
    pub fn has_alias(&self) -> bool {
        self.has_alias
    }

    /// Regex captures of the matched rule; index 0 is the whole match.
    pub fn captures(&self) -> &[Option<String>] {
        &self.captures
    }

    /// Returns capture group `index`, if it participated in the match.
    pub fn capture(&self, index: usize) -> Option<&str> {
        self.captures.get(index).and_then(|c| c.as_deref())
    }

    /// The continuation being resumed, inside a continuation handler.
    pub fn continuation(&self) -> Option<&Continuation> {
        self.continuation.as_ref()
    }

    /// Plugin configuration from its manifest.
    pub fn config(&self) -> &Value {
        &self.config
    }

    /// Replies through the event's transport.
    pub async fn reply(&self, message: &str) -> CoreResult<bool> {
        self.event.reply(message).await
    }

    /// Routes the sender's next event to `handler` within `ttl`.
    pub fn set_context(&self, handler: impl Into<String>, data: Value, ttl: Duration) {
        self.contexts.set(
            &self.plugin_key,
            &self.event,
            Continuation {
                handler: handler.into(),
                data,
            },
            ttl,
        );
    }

    /// Cancels a pending continuation for `handler`.
    pub fn clear_context(&self, handler: &str) -> bool {
        self.contexts.clear(&self.plugin_key, &self.event, handler)
    }

    /// Takes this plugin's pending continuations for the sender's session.
    pub fn take_continuations(&self) -> Vec<Continuation> {
        self.contexts.take(&self.plugin_key, &self.event)
    }
}

impl std::fmt::Debug for HandlerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerContext")
            .field("plugin", &self.plugin_name)
            .field("event_id", &self.event.id)
            .field("text", &self.text)
            .field("has_alias", &self.has_alias)
            .field("captures", &self.captures)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Plugin trait
// =============================================================================

/// A routable unit of bot behavior.
///
/// Only [`meta`](Plugin::meta) and [`handle`](Plugin::handle) are required.
/// Every callback may fail or panic; the router logs the failure and treats
/// it as a decline.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Describes the plugin. Called once per registration on a prototype.
    fn meta(&self) -> PluginMeta;

    /// One-time setup with the manifest config, bounded by the init timeout.
    async fn init(&self, _config: &Value) -> Result<(), BoxError> {
        Ok(())
    }

    /// Accept phase; see [`Accept`].
    async fn accept(&self, _ctx: &HandlerContext) -> Result<Accept, BoxError> {
        Ok(Accept::Continue)
    }

    /// Pending continuations for the event's session.
    ///
    /// The default takes whatever [`HandlerContext::set_context`] stored.
    async fn continuations(&self, ctx: &HandlerContext) -> Result<Vec<Continuation>, BoxError> {
        Ok(ctx.take_continuations())
    }

    /// Runs a named rule or continuation handler.
    async fn handle(&self, handler: &str, ctx: &HandlerContext) -> Result<Outcome, BoxError>;

    /// Default handler for events no rule handled.
    async fn fallback(&self, _ctx: &HandlerContext) -> Result<Outcome, BoxError> {
        Ok(Outcome::Declined)
    }

    /// Runs a named hook from the handler registry.
    async fn hook(&self, _handler: &str, _call: &HookCall) -> Result<HandlerOutcome, BoxError> {
        Ok(HandlerOutcome::Declined(None))
    }

    /// Runs a named scheduled task.
    async fn run_task(&self, handler: &str) -> Result<(), BoxError> {
        Err(format!("no task handler '{handler}'").into())
    }
}
