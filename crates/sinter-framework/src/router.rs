//! Two-tier event dispatch.
//!
//! [`RuleRouter::dispatch`] routes one event through the current registry
//! snapshot:
//!
//! ```text
//!  event ─▶ extended tier (ungated, every matching rule)
//!        ─▶ precheck: shutdown · self-authored · black/white lists · mute · dedup · cooldown
//!        ─▶ accept phase     (registration order; Continue / Proceed / Stop)
//!        ─▶ context phase    (pending continuations preempt rules)
//!        ─▶ rule phase       (priority buckets ascending, declaration order)
//!        ─▶ fallback         (plugins with a fallback, registration order)
//! ```
//!
//! Every plugin callback runs through a panic guard. A failing callback is
//! logged with the plugin and handler and counts as a decline; it never
//! aborts the dispatch.
//!
//! # Tower Service Integration
//!
//! `RuleRouter` implements `tower::Service<Arc<Event>>`, so middleware such
//! as timeouts or concurrency limits can wrap the whole dispatch:
//!
//! ```rust,ignore
//! use tower::ServiceBuilder;
//!
//! let service = ServiceBuilder::new()
//!     .concurrency_limit(64)
//!     .service(router.clone());
//! ```

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use tower::Service;
use tracing::{Instrument, debug, debug_span, error, info, trace};

use sinter_core::{Category, Event};

use crate::error::guarded;
use crate::plugin::registration::PluginRegistration;
use crate::plugin::{Accept, HandlerContext, Outcome, Plugin};
use crate::policy::{Cooldowns, DispatchPolicy};
use crate::registry::PluginRegistry;
use crate::rule::Grants;
use crate::throttle::Throttle;

// =============================================================================
// Report
// =============================================================================

/// Why the priority tier was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    Shutdown,
    SelfAuthored,
    Blocked,
    Muted,
    Duplicate,
    Cooldown,
}

/// Which stage of the priority tier settled the event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Nothing in the priority tier handled the event.
    Unhandled,
    /// PreCheck rejected the event.
    Gated(Gate),
    /// An accept hook returned [`Accept::Stop`].
    Accepted { plugin: String },
    /// A pending continuation consumed the event.
    Continuation { plugin: String, handler: String },
    /// A rule handler handled the event.
    Rule { plugin: String, handler: String },
    /// A fallback handled the event.
    Fallback { plugin: String },
}

/// Outcome of one dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    /// Any extended-tier rule or the priority tier handled the event.
    pub handled: bool,
    /// Extended-tier rule invocations that returned handled.
    pub extended_hits: usize,
    /// Plugin callbacks that failed or panicked.
    pub errors: usize,
    pub resolution: Resolution,
}

impl DispatchReport {
    fn new() -> Self {
        Self {
            handled: false,
            extended_hits: 0,
            errors: 0,
            resolution: Resolution::Unhandled,
        }
    }

    fn settle(&mut self, resolution: Resolution) {
        self.handled = true;
        self.resolution = resolution;
    }
}

/// Running dispatch counters.
#[derive(Debug, Default)]
pub struct RouterStats {
    dispatched: AtomicU64,
    handled: AtomicU64,
    gated: AtomicU64,
    errors: AtomicU64,
}

/// A point-in-time copy of [`RouterStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub dispatched: u64,
    pub handled: u64,
    pub gated: u64,
    pub errors: u64,
}

impl RouterStats {
    fn record(&self, report: &DispatchReport) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
        if report.handled {
            self.handled.fetch_add(1, Ordering::Relaxed);
        }
        if matches!(report.resolution, Resolution::Gated(_)) {
            self.gated.fetch_add(1, Ordering::Relaxed);
        }
        self.errors
            .fetch_add(report.errors as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            handled: self.handled.load(Ordering::Relaxed),
            gated: self.gated.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// Router
// =============================================================================

/// Routes events to plugin handlers.
///
/// Cheap to clone; clones share the registry, policy, throttle and stats.
#[derive(Clone)]
pub struct RuleRouter {
    registry: Arc<PluginRegistry>,
    policy: Arc<dyn DispatchPolicy>,
    throttle: Arc<Throttle>,
    stats: Arc<RouterStats>,
}

/// A plugin instance prepared for one dispatch.
struct Active {
    registration: Arc<PluginRegistration>,
    plugin: Box<dyn Plugin>,
    ctx: HandlerContext,
}

impl RuleRouter {
    pub fn new(
        registry: Arc<PluginRegistry>,
        policy: Arc<dyn DispatchPolicy>,
        throttle: Arc<Throttle>,
    ) -> Self {
        Self {
            registry,
            policy,
            throttle,
            stats: Arc::new(RouterStats::default()),
        }
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    pub fn throttle(&self) -> &Arc<Throttle> {
        &self.throttle
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Dispatches `event`, returning whether anything handled it.
    pub async fn dispatch(&self, event: Arc<Event>) -> bool {
        self.dispatch_report(event).await.handled
    }

    /// Dispatches `event` and reports what happened.
    pub async fn dispatch_report(&self, event: Arc<Event>) -> DispatchReport {
        let span = debug_span!(
            "dispatch",
            event_id = %event.id,
            event = %event.path(),
            bot = %event.bot_id
        );
        let report = self.run(event).instrument(span).await;
        self.stats.record(&report);
        report
    }

    async fn run(&self, event: Arc<Event>) -> DispatchReport {
        let snapshot = self.registry.snapshot();
        let mut report = DispatchReport::new();

        let (text, has_alias) = strip_alias(&event, &self.policy.bot_aliases(&event.bot_id));
        let text: Arc<str> = Arc::from(text);
        let grants = Grants {
            master: event.is_master || self.policy.is_master(&event),
            admin: self.policy.is_admin(&event),
        };
        let context = |reg: &Arc<PluginRegistration>| {
            HandlerContext::new(
                Arc::clone(&event),
                reg,
                Arc::clone(&text),
                has_alias,
                Arc::clone(self.registry.contexts()),
            )
        };

        // ── Extended tier ───────────────────────────────────────────────────
        for reg in snapshot.extended.iter().filter(|r| r.event.matches(&event)) {
            let plugin = reg.instantiate();
            let ctx = context(reg);
            for rule in reg.rules.iter().filter(|r| r.matches_event(&event)) {
                let Some(captures) = rule.captures(&text) else {
                    continue;
                };
                match guarded(plugin.handle(&rule.handler, &ctx.with_captures(captures))).await {
                    Ok(Outcome::Handled) => {
                        report.extended_hits += 1;
                        trace!(plugin = %reg.name, handler = %rule.handler, "Extended rule handled");
                    }
                    Ok(Outcome::Declined) => {}
                    Err(e) => {
                        report.errors += 1;
                        error!(plugin = %reg.name, handler = %rule.handler, error = %e, "Extended handler failed");
                    }
                }
            }
        }
        report.handled = report.extended_hits > 0;

        // ── PreCheck ────────────────────────────────────────────────────────
        let cooldowns = self.policy.cooldowns(&event);
        let active_regs: Vec<&Arc<PluginRegistration>> = snapshot
            .priority
            .iter()
            .filter(|r| self.policy.plugin_enabled(&event, &r.name) && r.event.matches(&event))
            .collect();

        let bypassed = event.is_special()
            || active_regs.iter().any(|r| {
                r.bypass_throttle
                    && r.rules
                        .iter()
                        .any(|rule| rule.matches_event(&event) && rule.captures(&text).is_some())
            });

        if let Some(gate) = self.precheck(&event, grants, bypassed, &cooldowns) {
            debug!(gate = ?gate, "Event gated");
            report.resolution = Resolution::Gated(gate);
            return report;
        }

        let active: Vec<Active> = active_regs
            .into_iter()
            .map(|reg| Active {
                registration: Arc::clone(reg),
                plugin: reg.instantiate(),
                ctx: context(reg),
            })
            .collect();

        // ── Accept phase ────────────────────────────────────────────────────
        for a in &active {
            match guarded(a.plugin.accept(&a.ctx)).await {
                Ok(Accept::Continue) => {}
                Ok(Accept::Proceed) => break,
                Ok(Accept::Stop) => {
                    debug!(plugin = %a.registration.name, "Accept hook consumed event");
                    report.settle(Resolution::Accepted {
                        plugin: a.registration.name.to_string(),
                    });
                    return report;
                }
                Err(e) => {
                    report.errors += 1;
                    error!(plugin = %a.registration.name, error = %e, "Accept hook failed");
                }
            }
        }

        // ── Context phase ───────────────────────────────────────────────────
        let mut resumed: Option<Resolution> = None;
        for a in &active {
            let continuations = match guarded(a.plugin.continuations(&a.ctx)).await {
                Ok(c) => c,
                Err(e) => {
                    report.errors += 1;
                    error!(plugin = %a.registration.name, error = %e, "Context hook failed");
                    continue;
                }
            };
            for continuation in continuations {
                let handler = continuation.handler.clone();
                let ctx = a.ctx.with_continuation(continuation);
                match guarded(a.plugin.handle(&handler, &ctx)).await {
                    Ok(Outcome::Handled) => {
                        debug!(plugin = %a.registration.name, handler = %handler, "Continuation handled");
                        resumed.get_or_insert(Resolution::Continuation {
                            plugin: a.registration.name.to_string(),
                            handler,
                        });
                    }
                    Ok(Outcome::Declined) => {}
                    Err(e) => {
                        report.errors += 1;
                        error!(plugin = %a.registration.name, handler = %handler, error = %e, "Continuation failed");
                    }
                }
            }
        }
        if let Some(resolution) = resumed {
            report.settle(resolution);
            return report;
        }

        // ── Rule phase ──────────────────────────────────────────────────────
        // `active` keeps the tier's stable priority order, so walking it in
        // sequence visits buckets ascending and plugins in registration order.
        for a in &active {
            let reg = &a.registration;
            for rule in &reg.rules {
                if !rule.matches_event(&event) {
                    continue;
                }
                let Some(captures) = rule.captures(&text) else {
                    continue;
                };
                if !rule.permission.permits(&event, grants) {
                    trace!(plugin = %reg.name, handler = %rule.handler, "Permission denied");
                    continue;
                }
                if rule.log {
                    info!(plugin = %reg.name, handler = %rule.handler, "{}", event.log_label);
                }
                match guarded(a.plugin.handle(&rule.handler, &a.ctx.with_captures(captures))).await {
                    Ok(Outcome::Handled) => {
                        if !reg.bypass_throttle {
                            self.throttle.mark_sent(&event, &cooldowns);
                        }
                        report.settle(Resolution::Rule {
                            plugin: reg.name.to_string(),
                            handler: rule.handler.clone(),
                        });
                        return report;
                    }
                    Ok(Outcome::Declined) => {}
                    Err(e) => {
                        report.errors += 1;
                        error!(plugin = %reg.name, handler = %rule.handler, error = %e, "Rule handler failed");
                    }
                }
            }
        }

        // ── Default fallback ────────────────────────────────────────────────
        for a in active.iter().filter(|a| a.registration.has_fallback) {
            match guarded(a.plugin.fallback(&a.ctx)).await {
                Ok(Outcome::Handled) => {
                    report.settle(Resolution::Fallback {
                        plugin: a.registration.name.to_string(),
                    });
                    return report;
                }
                Ok(Outcome::Declined) => {}
                Err(e) => {
                    report.errors += 1;
                    error!(plugin = %a.registration.name, error = %e, "Fallback failed");
                }
            }
        }

        trace!("No plugin handled event");
        report
    }

    fn precheck(
        &self,
        event: &Event,
        grants: Grants,
        bypassed: bool,
        cooldowns: &Cooldowns,
    ) -> Option<Gate> {
        if self.policy.is_shutdown(&event.bot_id) && !grants.master {
            return Some(Gate::Shutdown);
        }
        if event.is_self_authored() {
            return Some(Gate::SelfAuthored);
        }
        if !event.is_special() && self.policy.is_blocked(event) {
            return Some(Gate::Blocked);
        }
        if self.policy.is_group_muted(event) {
            return Some(Gate::Muted);
        }
        if !self.throttle.dedup(event) {
            return Some(Gate::Duplicate);
        }
        if !bypassed && !self.throttle.allow(event, cooldowns) {
            return Some(Gate::Cooldown);
        }
        None
    }
}

impl std::fmt::Debug for RuleRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleRouter")
            .field("registry", &self.registry)
            .field("stats", &self.stats.snapshot())
            .finish_non_exhaustive()
    }
}

/// Strips a leading bot alias from group message text.
///
/// Returns the matchable text and whether an alias was found.
pub fn strip_alias(event: &Event, aliases: &[String]) -> (String, bool) {
    if !event.is_group || event.category != Category::Message {
        return (event.text.clone(), false);
    }
    let text = event.text.trim_start();
    for alias in aliases.iter().filter(|a| !a.is_empty()) {
        if let Some(rest) = text.strip_prefix(alias.as_str()) {
            return (rest.trim_start().to_string(), true);
        }
    }
    (event.text.clone(), false)
}

// ============================================================================
// Tower Service Implementation for RuleRouter
// ============================================================================

impl Service<Arc<Event>> for RuleRouter {
    type Response = DispatchReport;
    type Error = Infallible;
    type Future =
        Pin<Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: Arc<Event>) -> Self::Future {
        let router = self.clone();
        Box::pin(async move { Ok(router.dispatch_report(event).await) })
    }
}
