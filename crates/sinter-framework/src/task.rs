//! Scheduled task descriptors.
//!
//! Sinter does not run cron jobs. Plugins declare [`TaskSpec`]s, the registry
//! turns them into [`TaskDescriptor`]s on every load or swap, and hands the
//! full list to a [`Scheduler`] collaborator.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// A task as declared by a plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Display name; the handler name when absent.
    #[serde(default)]
    pub name: Option<String>,
    /// Cron expression, passed through uninterpreted.
    pub cron: String,
    /// Plugin task handler.
    #[serde(alias = "fnc")]
    pub handler: String,
    #[serde(default = "default_log")]
    pub log: bool,
}

fn default_log() -> bool {
    true
}

impl TaskSpec {
    pub fn new(cron: impl Into<String>, handler: impl Into<String>) -> Self {
        Self {
            name: None,
            cron: cron.into(),
            handler: handler.into(),
            log: true,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// A task bound to the plugin registration that declared it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskDescriptor {
    /// Registration key of the owning plugin.
    pub plugin: String,
    pub name: String,
    pub cron: String,
    pub handler: String,
    pub log: bool,
}

impl TaskDescriptor {
    pub(crate) fn from_spec(plugin: &str, spec: &TaskSpec) -> Self {
        Self {
            plugin: plugin.to_string(),
            name: spec.name.clone().unwrap_or_else(|| spec.handler.clone()),
            cron: spec.cron.clone(),
            handler: spec.handler.clone(),
            log: spec.log,
        }
    }
}

/// Receives the current task list after each registry change.
pub trait Scheduler: Send + Sync {
    /// Replaces the scheduled set with `tasks`.
    fn schedule(&self, tasks: &[TaskDescriptor]);
}

/// Shared scheduler handle.
pub type BoxedScheduler = Arc<dyn Scheduler>;

/// Scheduler that drops every task.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopScheduler;

impl Scheduler for NoopScheduler {
    fn schedule(&self, _tasks: &[TaskDescriptor]) {}
}
