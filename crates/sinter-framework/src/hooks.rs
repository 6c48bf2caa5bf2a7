//! Priority-ordered named callbacks.
//!
//! [`HandlerRegistry`] is independent of chat rules. Plugins and embedders
//! register auxiliary lifecycle hooks under a string key; [`call`] runs the
//! records for a key in ascending priority order.
//!
//! Records under one key are kept sorted at all times: insertion finds its
//! position by binary search, placing a new record after any existing record
//! of equal priority.
//!
//! [`call`]: HandlerRegistry::call

use std::collections::HashMap;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, error, trace, warn};

use sinter_core::{BoxError, Event};

use crate::error::guarded;

/// Default hook priority.
pub const DEFAULT_HOOK_PRIORITY: i32 = 500;

/// Result of one hook invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerOutcome {
    /// The hook produced the final value.
    Handled(Value),
    /// The hook passed, optionally saying why.
    Declined(Option<String>),
}

impl HandlerOutcome {
    /// Declines with a reason.
    pub fn decline(reason: impl Into<String>) -> Self {
        Self::Declined(Some(reason.into()))
    }
}

/// Arguments handed to a hook callback.
#[derive(Debug, Clone)]
pub struct HookCall {
    /// Hook key being called.
    pub key: String,
    /// Event that triggered the call, if any.
    pub event: Option<Arc<Event>>,
    /// Caller arguments.
    pub args: Value,
    /// Context bound at registration time.
    pub context: Value,
}

/// Hook callback.
pub type HookFn =
    Arc<dyn Fn(HookCall) -> BoxFuture<'static, Result<HandlerOutcome, BoxError>> + Send + Sync>;

/// Boxes an async closure into a [`HookFn`].
pub fn hook_fn<F, Fut>(f: F) -> HookFn
where
    F: Fn(HookCall) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<HandlerOutcome, BoxError>> + Send + 'static,
{
    Arc::new(move |call| f(call).boxed())
}

/// A hook registration request.
#[derive(Clone)]
pub struct HookSpec {
    pub namespace: String,
    pub key: String,
    pub callback: HookFn,
    pub context: Value,
    pub priority: i32,
}

impl HookSpec {
    /// Creates a spec with the default priority and no bound context.
    pub fn new<F, Fut>(namespace: impl Into<String>, key: impl Into<String>, callback: F) -> Self
    where
        F: Fn(HookCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<HandlerOutcome, BoxError>> + Send + 'static,
    {
        Self {
            namespace: namespace.into(),
            key: key.into(),
            callback: hook_fn(callback),
            context: Value::Null,
            priority: DEFAULT_HOOK_PRIORITY,
        }
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Binds a value passed to every invocation.
    pub fn context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }
}

impl std::fmt::Debug for HookSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookSpec")
            .field("namespace", &self.namespace)
            .field("key", &self.key)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
struct HandlerRecord {
    namespace: String,
    priority: i32,
    callback: HookFn,
    context: Value,
}

/// Registry of priority-sorted hooks keyed by name.
#[derive(Default)]
pub struct HandlerRegistry {
    records: RwLock<HashMap<String, Vec<HandlerRecord>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a hook, replacing any existing one with the same
    /// namespace and key.
    ///
    /// Returns `false` if the key or namespace is empty.
    pub fn add(&self, spec: HookSpec) -> bool {
        if spec.key.is_empty() || spec.namespace.is_empty() {
            warn!(
                namespace = %spec.namespace,
                key = %spec.key,
                "Rejected hook with empty key or namespace"
            );
            return false;
        }

        let mut records = self.records.write();
        let list = records.entry(spec.key.clone()).or_default();
        list.retain(|r| r.namespace != spec.namespace);
        let pos = list.partition_point(|r| r.priority <= spec.priority);
        list.insert(
            pos,
            HandlerRecord {
                namespace: spec.namespace.clone(),
                priority: spec.priority,
                callback: spec.callback,
                context: spec.context,
            },
        );
        debug!(
            namespace = %spec.namespace,
            key = %spec.key,
            priority = spec.priority,
            position = pos,
            "Hook registered"
        );
        true
    }

    /// Removes hooks owned by `namespace`.
    ///
    /// An empty `key` removes the namespace's hooks under every key.
    /// Returns the number of records removed.
    pub fn del(&self, namespace: &str, key: &str) -> usize {
        let mut records = self.records.write();
        let mut removed = 0;
        let mut strip = |list: &mut Vec<HandlerRecord>| {
            let before = list.len();
            list.retain(|r| r.namespace != namespace);
            removed += before - list.len();
        };
        if key.is_empty() {
            records.values_mut().for_each(&mut strip);
        } else if let Some(list) = records.get_mut(key) {
            strip(list);
        }
        records.retain(|_, list| !list.is_empty());
        removed
    }

    /// Runs the hooks registered under `key` in priority order.
    ///
    /// Returns the first handled value. With `all_handlers` every hook runs
    /// and `None` is returned. Failing hooks are logged and count as declined.
    pub async fn call(
        &self,
        key: &str,
        event: Option<Arc<Event>>,
        args: Value,
        all_handlers: bool,
    ) -> Option<Value> {
        let snapshot: Vec<HandlerRecord> = self.records.read().get(key).cloned().unwrap_or_default();

        for record in snapshot {
            let call = HookCall {
                key: key.to_string(),
                event: event.clone(),
                args: args.clone(),
                context: record.context.clone(),
            };
            match guarded((record.callback)(call)).await {
                Ok(HandlerOutcome::Handled(value)) => {
                    if !all_handlers {
                        return Some(value);
                    }
                }
                Ok(HandlerOutcome::Declined(reason)) => {
                    trace!(namespace = %record.namespace, key, reason = ?reason, "Hook declined");
                }
                Err(e) => {
                    error!(namespace = %record.namespace, key, error = %e, "Hook failed");
                }
            }
        }
        None
    }

    /// Number of hooks registered under `key`.
    pub fn count(&self, key: &str) -> usize {
        self.records.read().get(key).map_or(0, Vec::len)
    }

    /// Returns `(namespace, priority)` for each hook under `key`, in call order.
    pub fn entries(&self, key: &str) -> Vec<(String, i32)> {
        self.records
            .read()
            .get(key)
            .map(|list| {
                list.iter()
                    .map(|r| (r.namespace.clone(), r.priority))
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let records = self.records.read();
        f.debug_map()
            .entries(records.iter().map(|(k, v)| (k, v.len())))
            .finish()
    }
}
