//! The plugin registry.
//!
//! [`PluginRegistry`] owns the current [`RegistrySnapshot`] behind a
//! `RwLock<Arc<_>>`. Dispatch clones the `Arc` once and iterates a consistent
//! view; every mutation builds a complete new snapshot and swaps the
//! reference in one step, so a reader never sees a half-applied reload.
//!
//! ```text
//!  apply_source("a.plugin.toml", regs)
//!        │
//!        ▼
//!  clone list ─▶ replace same (key, name) in place ─▶ append new ─▶ drop stale
//!        │
//!        ▼
//!  stable sort tiers ─▶ derive tasks ─▶ swap Arc ─▶ re-register hooks
//! ```
//!
//! Registrations are grouped by *key*: all plugins loaded from one manifest
//! share the manifest's key and are replaced or removed together.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info};

use sinter_core::BoxError;

use crate::context_store::ContextStore;
use crate::error::guarded;
use crate::hooks::{HandlerRegistry, HookSpec, hook_fn};
use crate::plugin::registration::PluginRegistration;
use crate::task::{BoxedScheduler, NoopScheduler, TaskDescriptor};

/// An immutable view of every registered plugin.
#[derive(Debug, Default)]
pub struct RegistrySnapshot {
    /// Extended tier, stable-sorted by priority.
    pub extended: Vec<Arc<PluginRegistration>>,
    /// Priority tier, stable-sorted by priority.
    pub priority: Vec<Arc<PluginRegistration>>,
    /// Task descriptors of every plugin.
    pub tasks: Vec<TaskDescriptor>,
    /// Incremented on every swap.
    pub generation: u64,
}

impl RegistrySnapshot {
    fn build(mut plugins: Vec<Arc<PluginRegistration>>, generation: u64) -> Self {
        plugins.sort_by_key(|p| p.priority.value());
        let (extended, priority): (Vec<_>, Vec<_>) =
            plugins.into_iter().partition(|p| p.is_extended());
        let tasks = extended
            .iter()
            .chain(priority.iter())
            .flat_map(|p| p.tasks.iter().cloned())
            .collect();
        Self {
            extended,
            priority,
            tasks,
            generation,
        }
    }

    /// Every registration, extended tier first.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<PluginRegistration>> {
        self.extended.iter().chain(self.priority.iter())
    }

    pub fn len(&self) -> usize {
        self.extended.len() + self.priority.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Finds a registration by key and name.
    pub fn find(&self, key: &str, name: &str) -> Option<&Arc<PluginRegistration>> {
        self.iter().find(|p| &*p.key == key && &*p.name == name)
    }

    fn in_order(&self) -> Vec<Arc<PluginRegistration>> {
        self.iter().cloned().collect()
    }
}

/// Counts of one source swap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SwapSummary {
    pub replaced: usize,
    pub added: usize,
    pub removed: usize,
}

/// Shared, atomically swapped plugin registry.
pub struct PluginRegistry {
    current: RwLock<Arc<RegistrySnapshot>>,
    /// Serializes writers; readers never take it.
    write_lock: Mutex<()>,
    generation: AtomicU64,
    hooks: Arc<HandlerRegistry>,
    contexts: Arc<ContextStore>,
    scheduler: RwLock<BoxedScheduler>,
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new(Arc::new(HandlerRegistry::new()))
    }
}

impl PluginRegistry {
    /// Creates an empty registry that registers plugin hooks into `hooks`.
    pub fn new(hooks: Arc<HandlerRegistry>) -> Self {
        Self {
            current: RwLock::new(Arc::new(RegistrySnapshot::default())),
            write_lock: Mutex::new(()),
            generation: AtomicU64::new(0),
            hooks,
            contexts: Arc::new(ContextStore::new()),
            scheduler: RwLock::new(Arc::new(NoopScheduler)),
        }
    }

    /// Sets the scheduler that receives task descriptors after each swap.
    pub fn set_scheduler(&self, scheduler: BoxedScheduler) {
        *self.scheduler.write() = scheduler;
        let snapshot = self.snapshot();
        self.scheduler.read().schedule(&snapshot.tasks);
    }

    /// Returns the current snapshot.
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        Arc::clone(&self.current.read())
    }

    /// Number of swaps so far.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn hooks(&self) -> &Arc<HandlerRegistry> {
        &self.hooks
    }

    pub fn contexts(&self) -> &Arc<ContextStore> {
        &self.contexts
    }

    /// Replaces every registration under `key` with `registrations`.
    ///
    /// A registration with the same key and name as an existing one takes
    /// its list position; new ones are appended; existing ones not in
    /// `registrations` are dropped.
    pub fn apply_source(&self, key: &str, registrations: Vec<PluginRegistration>) -> SwapSummary {
        let _writer = self.write_lock.lock();
        let old = self.snapshot();
        let mut incoming: Vec<Option<Arc<PluginRegistration>>> =
            registrations.into_iter().map(|r| Some(Arc::new(r))).collect();

        let mut summary = SwapSummary::default();
        let mut stale = Vec::new();
        let mut list = Vec::with_capacity(old.len() + incoming.len());

        for existing in old.in_order() {
            if &*existing.key != key {
                list.push(existing);
                continue;
            }
            let replacement = incoming
                .iter_mut()
                .find(|r| r.as_ref().is_some_and(|r| r.same_identity(&existing)))
                .and_then(Option::take);
            match replacement {
                Some(new) => {
                    summary.replaced += 1;
                    stale.push(existing);
                    list.push(new);
                }
                None => {
                    summary.removed += 1;
                    stale.push(existing);
                }
            }
        }
        let added: Vec<_> = incoming.into_iter().flatten().collect();
        summary.added = added.len();
        list.extend(added.iter().cloned());

        self.swap(list);
        self.rebind_hooks(&stale, key);
        info!(
            key,
            replaced = summary.replaced,
            added = summary.added,
            removed = summary.removed,
            "Plugin source applied"
        );
        summary
    }

    /// Removes every registration under `key`. Returns how many were removed.
    pub fn remove_source(&self, key: &str) -> usize {
        let _writer = self.write_lock.lock();
        let old = self.snapshot();
        let (stale, kept): (Vec<_>, Vec<_>) =
            old.in_order().into_iter().partition(|p| &*p.key == key);
        if stale.is_empty() {
            return 0;
        }
        self.swap(kept);
        self.rebind_hooks(&stale, key);
        self.contexts.clear_plugin(key);
        info!(key, removed = stale.len(), "Plugin source removed");
        stale.len()
    }

    /// Keys of every registration source, in tier order.
    pub fn sources(&self) -> Vec<String> {
        let mut keys: Vec<String> = Vec::new();
        for reg in self.snapshot().iter() {
            if !keys.iter().any(|k| k == &*reg.key) {
                keys.push(reg.key.to_string());
            }
        }
        keys
    }

    /// Removes every plugin hook from the handler registry.
    pub fn dispose_hooks(&self) -> usize {
        self.snapshot()
            .iter()
            .map(|reg| self.hooks.del(&reg.namespace, ""))
            .sum()
    }

    /// Runs a scheduled task on a fresh instance of its plugin.
    pub async fn run_task(&self, task: &TaskDescriptor) -> Result<(), BoxError> {
        let snapshot = self.snapshot();
        let Some(reg) = snapshot.iter().find(|p| &*p.key == task.plugin && p.tasks.contains(task)) else {
            return Err(format!("no plugin '{}' owns task '{}'", task.plugin, task.name).into());
        };
        let plugin = reg.instantiate();
        let result = guarded(plugin.run_task(&task.handler)).await;
        if let Err(e) = &result {
            error!(plugin = %reg.name, task = %task.name, error = %e, "Task failed");
        }
        result
    }

    fn swap(&self, list: Vec<Arc<PluginRegistration>>) {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let snapshot = Arc::new(RegistrySnapshot::build(list, generation));
        *self.current.write() = Arc::clone(&snapshot);
        debug!(
            generation,
            extended = snapshot.extended.len(),
            priority = snapshot.priority.len(),
            "Registry swapped"
        );
        self.scheduler.read().schedule(&snapshot.tasks);
    }

    /// Re-registers the hooks of every namespace touched by a swap of `key`.
    ///
    /// A namespace can span sources; every live registration in a touched
    /// namespace gets its hooks re-added.
    fn rebind_hooks(&self, stale: &[Arc<PluginRegistration>], key: &str) {
        let snapshot = self.snapshot();
        let mut touched: Vec<&str> = Vec::new();
        let current = snapshot.iter().filter(|p| &*p.key == key);
        for reg in stale.iter().chain(current) {
            if !touched.contains(&&*reg.namespace) {
                touched.push(&reg.namespace);
            }
        }
        for namespace in &touched {
            self.hooks.del(namespace, "");
        }
        for reg in snapshot
            .iter()
            .filter(|p| touched.contains(&&*p.namespace))
        {
            for decl in &reg.hooks {
                let factory = reg.factory();
                let handler = decl.handler.clone();
                let callback = hook_fn(move |call| {
                    let plugin = factory();
                    let handler = handler.clone();
                    async move { plugin.hook(&handler, &call).await }
                });
                self.hooks.add(HookSpec {
                    namespace: reg.namespace.clone(),
                    key: decl.key.clone(),
                    callback,
                    context: (*reg.config).clone(),
                    priority: decl.priority,
                });
            }
        }
    }
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.snapshot();
        f.debug_struct("PluginRegistry")
            .field("generation", &snapshot.generation)
            .field("extended", &snapshot.extended.len())
            .field("priority", &snapshot.priority.len())
            .finish_non_exhaustive()
    }
}
