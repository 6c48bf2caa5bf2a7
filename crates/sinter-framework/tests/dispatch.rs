use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tower::ServiceExt;

use sinter_core::Category;
use sinter_framework::plugin::registration::DEFAULT_INIT_TIMEOUT;
use sinter_framework::prelude::*;
use sinter_framework::rule::PatternCache;
use sinter_framework::{
    Gate, PluginDefinition, PluginFactory, PluginRegistry, PolicyConfig, Resolution, RuleRouter,
    StaticPolicy, Throttle, build_registration,
};

type Log = Arc<Mutex<Vec<String>>>;

#[derive(Clone, Copy)]
enum Act {
    Handle,
    Decline,
    Fail,
    Panic,
}

fn act(a: Act) -> Result<Outcome, BoxError> {
    match a {
        Act::Handle => Ok(Outcome::Handled),
        Act::Decline => Ok(Outcome::Declined),
        Act::Fail => Err("probe failure".into()),
        Act::Panic => panic!("probe panic"),
    }
}

/// Records every callback into a shared log.
#[derive(Clone)]
struct Probe {
    meta: PluginMeta,
    log: Log,
    acts: HashMap<String, Act>,
    accept: Accept,
    fallback: Act,
}

impl Probe {
    fn new(meta: PluginMeta, log: &Log) -> Self {
        Self {
            meta,
            log: Arc::clone(log),
            acts: HashMap::new(),
            accept: Accept::Continue,
            fallback: Act::Decline,
        }
    }

    fn act(mut self, handler: &str, a: Act) -> Self {
        self.acts.insert(handler.to_string(), a);
        self
    }

    fn accept(mut self, accept: Accept) -> Self {
        self.accept = accept;
        self
    }

    fn fallback(mut self, a: Act) -> Self {
        self.meta = self.meta.fallback();
        self.fallback = a;
        self
    }
}

#[async_trait]
impl Plugin for Probe {
    fn meta(&self) -> PluginMeta {
        self.meta.clone()
    }

    async fn accept(&self, ctx: &HandlerContext) -> Result<Accept, BoxError> {
        self.log.lock().push(format!("{}:accept", ctx.plugin_name()));
        Ok(self.accept)
    }

    async fn handle(&self, handler: &str, ctx: &HandlerContext) -> Result<Outcome, BoxError> {
        let alias = if ctx.has_alias() { "@alias" } else { "" };
        self.log
            .lock()
            .push(format!("{}:{}{}", ctx.plugin_name(), handler, alias));
        if handler == "ask" {
            ctx.set_context("answer", json!({ "question": 1 }), Duration::from_secs(60));
        }
        if handler == "answer" {
            let data = ctx.continuation().map(|c| c.data.clone());
            assert_eq!(data, Some(json!({ "question": 1 })));
        }
        act(self.acts.get(handler).copied().unwrap_or(Act::Handle))
    }

    async fn fallback(&self, ctx: &HandlerContext) -> Result<Outcome, BoxError> {
        self.log.lock().push(format!("{}:fallback", ctx.plugin_name()));
        act(self.fallback)
    }
}

struct Harness {
    registry: Arc<PluginRegistry>,
    policy: Arc<StaticPolicy>,
    router: RuleRouter,
    log: Log,
}

impl Harness {
    fn new(config: PolicyConfig) -> Self {
        let registry = Arc::new(PluginRegistry::default());
        let policy = Arc::new(StaticPolicy::new(config));
        let router = RuleRouter::new(
            Arc::clone(&registry),
            policy.clone(),
            Arc::new(Throttle::default()),
        );
        Self {
            registry,
            policy,
            router,
            log: Log::default(),
        }
    }

    async fn add(&self, probe: Probe) {
        let key = probe.meta.name.clone();
        let factory: PluginFactory = Arc::new(move || Box::new(probe.clone()) as Box<dyn Plugin>);
        let registration = build_registration(
            &key,
            None,
            &PluginDefinition::of_kind(key.as_str()),
            factory,
            &PatternCache::new(),
            DEFAULT_INIT_TIMEOUT,
        )
        .await
        .unwrap();
        self.registry.apply_source(&key, vec![registration]);
    }

    fn take_log(&self) -> Vec<String> {
        std::mem::take(&mut *self.log.lock())
    }

    /// Log entries other than accept calls.
    fn take_calls(&self) -> Vec<String> {
        self.take_log()
            .into_iter()
            .filter(|l| !l.ends_with(":accept"))
            .collect()
    }
}

fn group_message(user: &str, message_id: &str, text: &str) -> Arc<Event> {
    let mut e = Event::empty(Category::Message, Value::Null);
    e.id = message_id.to_string();
    e.bot_id = "bot".to_string();
    e.subtypes = vec!["group".to_string(), "normal".to_string()];
    e.user_id = Some(user.to_string());
    e.group_id = Some("g1".to_string());
    e.message_id = Some(message_id.to_string());
    e.text = text.to_string();
    e.is_group = true;
    Arc::new(e)
}

fn simple(name: &str, priority: i32, pattern: &str, handler: &str) -> PluginMeta {
    PluginMeta::new(name)
        .priority(priority)
        .rule(RuleSpec::new(pattern, handler))
}

#[tokio::test]
async fn test_lower_priority_rules_run_first() {
    let h = Harness::new(PolicyConfig::default());
    h.add(Probe::new(simple("late", 20, "^hi$", "greet"), &h.log).act("greet", Act::Decline))
        .await;
    h.add(Probe::new(simple("early", 10, "^hi$", "greet"), &h.log).act("greet", Act::Decline))
        .await;
    h.add(Probe::new(simple("tie", 20, "^hi$", "greet"), &h.log).act("greet", Act::Decline))
        .await;

    let report = h.router.dispatch_report(group_message("u1", "m1", "hi")).await;
    assert!(!report.handled);
    assert_eq!(report.resolution, Resolution::Unhandled);
    assert_eq!(h.take_calls(), vec!["early:greet", "late:greet", "tie:greet"]);
}

#[tokio::test]
async fn test_first_handled_rule_stops_dispatch() {
    let h = Harness::new(PolicyConfig::default());
    h.add(Probe::new(
        PluginMeta::new("multi")
            .priority(10)
            .rule(RuleSpec::new("^nope$", "skip"))
            .rule(RuleSpec::new("^hi$", "first").priority(1))
            .rule(RuleSpec::new("^h", "second").priority(2)),
        &h.log,
    ))
    .await;
    h.add(Probe::new(simple("other", 20, "^hi$", "greet"), &h.log))
        .await;

    let report = h.router.dispatch_report(group_message("u1", "m1", "hi")).await;
    assert!(report.handled);
    assert_eq!(
        report.resolution,
        Resolution::Rule {
            plugin: "multi".into(),
            handler: "first".into()
        }
    );
    assert_eq!(h.take_calls(), vec!["multi:first"]);
}

#[tokio::test]
async fn test_extended_tier_runs_when_gated() {
    let mut config = PolicyConfig::default();
    config.blacklist.users.insert("u1".to_string());
    let h = Harness::new(config);
    h.add(Probe::new(
        PluginMeta::new("audit").extended().rule(RuleSpec::any("record")),
        &h.log,
    ))
    .await;
    h.add(Probe::new(simple("echo", 10, ".*", "echo"), &h.log))
        .await;

    let report = h.router.dispatch_report(group_message("u1", "m1", "hello")).await;
    assert_eq!(report.resolution, Resolution::Gated(Gate::Blocked));
    assert_eq!(report.extended_hits, 1);
    assert!(report.handled);
    assert_eq!(h.take_log(), vec!["audit:record"]);

    let stats = h.router.stats();
    assert_eq!(stats.dispatched, 1);
    assert_eq!(stats.gated, 1);
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_messages_dispatch_once() {
    let h = Harness::new(PolicyConfig::default());
    h.add(Probe::new(simple("echo", 10, ".*", "echo"), &h.log))
        .await;

    assert!(h.router.dispatch(group_message("u1", "m1", "hi")).await);
    let report = h.router.dispatch_report(group_message("u1", "m1", "hi")).await;
    assert_eq!(report.resolution, Resolution::Gated(Gate::Duplicate));
    assert_eq!(h.take_calls().len(), 1);

    tokio::time::advance(Duration::from_secs(6)).await;
    assert!(h.router.dispatch(group_message("u1", "m1", "hi")).await);
    assert_eq!(h.take_calls().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_user_cooldown_allows_one_reply() {
    let mut config = PolicyConfig::default();
    config.cooldowns.user_ms = 1_000;
    let h = Harness::new(config);
    h.add(Probe::new(simple("echo", 10, ".*", "echo"), &h.log))
        .await;

    let mut handled = 0;
    for i in 0..5 {
        if h.router.dispatch(group_message("u1", &format!("m{i}"), "hi")).await {
            handled += 1;
        }
    }
    assert_eq!(handled, 1);

    // Another user in the same group is not affected.
    assert!(h.router.dispatch(group_message("u2", "x1", "hi")).await);

    tokio::time::advance(Duration::from_millis(1_001)).await;
    assert!(h.router.dispatch(group_message("u1", "m9", "hi")).await);
}

#[tokio::test(start_paused = true)]
async fn test_bypass_throttle_plugin_skips_cooldown() {
    let mut config = PolicyConfig::default();
    config.cooldowns.group_ms = 10_000;
    let h = Harness::new(config);
    h.add(Probe::new(simple("echo", 10, "^echo$", "echo"), &h.log))
        .await;
    h.add(Probe::new(simple("urgent", 20, "^help$", "help").bypass_throttle(), &h.log))
        .await;

    assert!(h.router.dispatch(group_message("u1", "m1", "echo")).await);
    let report = h.router.dispatch_report(group_message("u1", "m2", "echo")).await;
    assert_eq!(report.resolution, Resolution::Gated(Gate::Cooldown));

    assert!(h.router.dispatch(group_message("u1", "m3", "help")).await);
    assert!(h.router.dispatch(group_message("u1", "m4", "help")).await);
}

#[tokio::test]
async fn test_accept_stop_consumes_event() {
    let h = Harness::new(PolicyConfig::default());
    h.add(Probe::new(simple("gate", 10, ".*", "never"), &h.log).accept(Accept::Stop))
        .await;
    h.add(Probe::new(simple("echo", 20, ".*", "echo"), &h.log))
        .await;

    let report = h.router.dispatch_report(group_message("u1", "m1", "hi")).await;
    assert_eq!(
        report.resolution,
        Resolution::Accepted {
            plugin: "gate".into()
        }
    );
    assert_eq!(h.take_log(), vec!["gate:accept"]);
}

#[tokio::test]
async fn test_accept_proceed_ends_accept_phase() {
    let h = Harness::new(PolicyConfig::default());
    h.add(Probe::new(simple("first", 10, "^x$", "x"), &h.log).accept(Accept::Proceed))
        .await;
    h.add(Probe::new(simple("second", 20, ".*", "echo"), &h.log).accept(Accept::Stop))
        .await;

    assert!(h.router.dispatch(group_message("u1", "m1", "hi")).await);
    assert_eq!(h.take_log(), vec!["first:accept", "second:echo"]);
}

#[tokio::test]
async fn test_continuation_preempts_rules() {
    let h = Harness::new(PolicyConfig::default());
    h.add(Probe::new(
        PluginMeta::new("quiz")
            .priority(10)
            .rule(RuleSpec::new("^quiz$", "ask")),
        &h.log,
    ))
    .await;
    h.add(Probe::new(simple("echo", 20, ".*", "echo"), &h.log))
        .await;

    assert!(h.router.dispatch(group_message("u1", "m1", "quiz")).await);
    assert_eq!(h.take_calls(), vec!["quiz:ask"]);

    // Another sender has no pending continuation.
    assert!(h.router.dispatch(group_message("u2", "m2", "42")).await);
    assert_eq!(h.take_calls(), vec!["echo:echo"]);

    let report = h.router.dispatch_report(group_message("u1", "m3", "42")).await;
    assert_eq!(
        report.resolution,
        Resolution::Continuation {
            plugin: "quiz".into(),
            handler: "answer".into()
        }
    );
    assert_eq!(h.take_calls(), vec!["quiz:answer"]);

    // Consumed.
    assert!(h.router.dispatch(group_message("u1", "m4", "42")).await);
    assert_eq!(h.take_calls(), vec!["echo:echo"]);
}

#[tokio::test]
async fn test_fallback_runs_when_no_rule_handles() {
    let h = Harness::new(PolicyConfig::default());
    h.add(Probe::new(simple("decline", 10, ".*", "d"), &h.log)
        .act("d", Act::Decline)
        .fallback(Act::Decline))
    .await;
    h.add(Probe::new(simple("chat", 20, "^never$", "n"), &h.log).fallback(Act::Handle))
        .await;

    let report = h.router.dispatch_report(group_message("u1", "m1", "hello")).await;
    assert_eq!(
        report.resolution,
        Resolution::Fallback {
            plugin: "chat".into()
        }
    );
    assert_eq!(
        h.take_calls(),
        vec!["decline:d", "decline:fallback", "chat:fallback"]
    );
}

#[tokio::test]
async fn test_failures_count_as_declines() {
    let h = Harness::new(PolicyConfig::default());
    h.add(Probe::new(simple("fails", 10, ".*", "f"), &h.log).act("f", Act::Fail))
        .await;
    h.add(Probe::new(simple("panics", 20, ".*", "p"), &h.log).act("p", Act::Panic))
        .await;
    h.add(Probe::new(simple("works", 30, ".*", "w"), &h.log))
        .await;

    let report = h.router.dispatch_report(group_message("u1", "m1", "hi")).await;
    assert!(report.handled);
    assert_eq!(report.errors, 2);
    assert_eq!(
        report.resolution,
        Resolution::Rule {
            plugin: "works".into(),
            handler: "w".into()
        }
    );
    assert_eq!(h.router.stats().errors, 2);
}

#[tokio::test]
async fn test_rule_permission() {
    let mut config = PolicyConfig::default();
    config.masters.insert("boss".to_string());
    let h = Harness::new(config);
    h.add(Probe::new(
        PluginMeta::new("admin")
            .priority(10)
            .rule(RuleSpec::new("^restart$", "restart").permission(Permission::Master)),
        &h.log,
    ))
    .await;

    assert!(!h.router.dispatch(group_message("u1", "m1", "restart")).await);
    assert!(h.router.dispatch(group_message("boss", "m2", "restart")).await);
    assert_eq!(h.take_calls(), vec!["admin:restart"]);
}

#[tokio::test]
async fn test_shutdown_admits_only_masters() {
    let mut config = PolicyConfig::default();
    config.masters.insert("boss".to_string());
    let h = Harness::new(config);
    h.add(Probe::new(simple("echo", 10, ".*", "echo"), &h.log))
        .await;
    h.policy.set_shutdown("bot", true);

    let report = h.router.dispatch_report(group_message("u1", "m1", "hi")).await;
    assert_eq!(report.resolution, Resolution::Gated(Gate::Shutdown));
    assert!(h.router.dispatch(group_message("boss", "m2", "hi")).await);

    h.policy.set_shutdown("bot", false);
    assert!(h.router.dispatch(group_message("u1", "m3", "hi")).await);
}

#[tokio::test]
async fn test_self_authored_and_muted_events_are_gated() {
    let h = Harness::new(PolicyConfig::default());
    h.add(Probe::new(simple("echo", 10, ".*", "echo"), &h.log))
        .await;

    let report = h.router.dispatch_report(group_message("bot", "m1", "hi")).await;
    assert_eq!(report.resolution, Resolution::Gated(Gate::SelfAuthored));

    h.policy.set_group_muted("g1", true);
    let report = h.router.dispatch_report(group_message("u1", "m2", "hi")).await;
    assert_eq!(report.resolution, Resolution::Gated(Gate::Muted));
    assert!(h.take_calls().is_empty());
}

#[tokio::test]
async fn test_group_plugin_toggles() {
    let mut config = PolicyConfig::default();
    config
        .groups
        .entry("g1".to_string())
        .or_default()
        .disable
        .push("echo".to_string());
    let h = Harness::new(config);
    h.add(Probe::new(simple("echo", 10, ".*", "echo"), &h.log))
        .await;
    h.add(Probe::new(simple("other", 20, ".*", "other"), &h.log))
        .await;

    assert!(h.router.dispatch(group_message("u1", "m1", "hi")).await);
    assert_eq!(h.take_calls(), vec!["other:other"]);
}

#[tokio::test]
async fn test_bot_alias_is_stripped() {
    let mut config = PolicyConfig::default();
    config
        .aliases
        .insert("*".to_string(), vec!["sinter".to_string()]);
    let h = Harness::new(config);
    h.add(Probe::new(simple("help", 10, "^help$", "help"), &h.log))
        .await;

    assert!(h.router.dispatch(group_message("u1", "m1", "sinter help")).await);
    assert!(h.router.dispatch(group_message("u1", "m2", "help")).await);
    assert_eq!(h.take_calls(), vec!["help:help@alias", "help:help"]);
}

#[tokio::test]
async fn test_event_filter_limits_plugin() {
    let h = Harness::new(PolicyConfig::default());
    h.add(Probe::new(
        PluginMeta::new("notices")
            .priority(10)
            .event("notice")
            .rule(RuleSpec::any("notice")),
        &h.log,
    ))
    .await;

    assert!(!h.router.dispatch(group_message("u1", "m1", "hi")).await);

    let mut notice = Event::empty(Category::Notice, Value::Null);
    notice.bot_id = "bot".to_string();
    notice.subtypes = vec!["group_increase".to_string()];
    notice.user_id = Some("u1".to_string());
    assert!(h.router.dispatch(Arc::new(notice)).await);
    assert_eq!(h.take_calls(), vec!["notices:notice"]);
}

#[tokio::test]
async fn test_router_as_tower_service() {
    let h = Harness::new(PolicyConfig::default());
    h.add(Probe::new(simple("echo", 10, ".*", "echo"), &h.log))
        .await;

    let report = h
        .router
        .clone()
        .oneshot(group_message("u1", "m1", "hi"))
        .await
        .unwrap();
    assert!(report.handled);
}
