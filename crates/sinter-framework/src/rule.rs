//! Rules, event-type matching and permissions.
//!
//! A [`Rule`] binds an event-type filter, an optional regex and a permission
//! level to one named plugin handler. Rules are declared as [`RuleSpec`]s
//! (in code or in a plugin manifest) and compiled once through a
//! [`PatternCache`].
//!
//! # Event-type matching
//!
//! A pattern is tested against the event path and then against each declared
//! alias of the event:
//!
//! ```text
//! pattern            path                     result
//! ─────────────────  ───────────────────────  ──────
//! "" / "*"           anything                 match
//! message.group      message.group            match   (exact)
//! message            message.group.normal     match   (leading segment)
//! message.group      message.group.normal     match   (dot-boundary prefix)
//! message.*          message.group            match   (strictly under prefix)
//! message.*          message                  no match
//! message.group      message.groups           no match
//! message            device.message           match   (declared alias)
//! ```

use std::collections::HashMap;

use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};

use sinter_core::{Event, SenderRole};

use crate::error::PluginError;

/// Default event filter for rules and plugins that declare none.
pub const DEFAULT_EVENT: &str = "message";

// =============================================================================
// Event-type matching
// =============================================================================

/// Returns `true` if `pattern` selects an event with `path` and `aliases`.
pub fn event_type_matches(pattern: &str, path: &str, aliases: &[String]) -> bool {
    let pattern = pattern.trim();
    if pattern.is_empty() || pattern == "*" {
        return true;
    }
    path_matches(pattern, path) || aliases.iter().any(|alias| path_matches(pattern, alias))
}

fn path_matches(pattern: &str, path: &str) -> bool {
    if let Some(prefix) = pattern.strip_suffix(".*") {
        return is_strictly_under(prefix, path);
    }
    pattern == path || is_strictly_under(pattern, path)
}

/// `prefix` is a proper dot-boundary prefix of `path`.
fn is_strictly_under(prefix: &str, path: &str) -> bool {
    path.len() > prefix.len() + 1
        && path.starts_with(prefix)
        && path.as_bytes()[prefix.len()] == b'.'
}

/// One or many event-type patterns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventFilter {
    One(String),
    Many(Vec<String>),
}

impl Default for EventFilter {
    fn default() -> Self {
        Self::One(DEFAULT_EVENT.to_string())
    }
}

impl EventFilter {
    /// Returns the patterns as a slice-like list.
    pub fn patterns(&self) -> Vec<String> {
        match self {
            Self::One(p) => vec![p.clone()],
            Self::Many(ps) => ps.clone(),
        }
    }

    /// Returns `true` if any pattern selects `event`.
    ///
    /// An empty list selects everything.
    pub fn matches(&self, event: &Event) -> bool {
        let path = event.path();
        match self {
            Self::One(p) => event_type_matches(p, &path, &event.aliases),
            Self::Many(ps) => {
                ps.is_empty() || ps.iter().any(|p| event_type_matches(p, &path, &event.aliases))
            }
        }
    }
}

impl From<&str> for EventFilter {
    fn from(pattern: &str) -> Self {
        Self::One(pattern.to_string())
    }
}

impl From<Vec<&str>> for EventFilter {
    fn from(patterns: Vec<&str>) -> Self {
        Self::Many(patterns.into_iter().map(String::from).collect())
    }
}

// =============================================================================
// Permission
// =============================================================================

/// Required caller level for a rule.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    #[default]
    All,
    Admin,
    Owner,
    Master,
}

/// Caller privileges resolved for one event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Grants {
    /// The sender is a bot master.
    pub master: bool,
    /// The sender is listed as a bot admin.
    pub admin: bool,
}

impl Permission {
    /// Returns `true` if the sender of `event` satisfies this level.
    ///
    /// Special events always pass, and a master satisfies every level.
    /// `Owner` and `Admin` only gate group events.
    pub fn permits(self, event: &Event, grants: Grants) -> bool {
        if event.is_special() || grants.master || event.is_master {
            return true;
        }
        match self {
            Self::All => true,
            Self::Master => false,
            Self::Owner | Self::Admin if !event.is_group => true,
            Self::Owner => event.sender_role == SenderRole::Owner,
            Self::Admin => {
                grants.admin || matches!(event.sender_role, SenderRole::Owner | SenderRole::Admin)
            }
        }
    }
}

// =============================================================================
// Rule declaration and compilation
// =============================================================================

/// A rule as declared by a plugin or manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSpec {
    /// Regex tested against the event text. Absent matches everything.
    #[serde(default, alias = "reg")]
    pub pattern: Option<String>,
    /// Plugin handler to invoke.
    #[serde(alias = "fnc")]
    pub handler: String,
    /// Event-type filter; inherits the plugin filter when absent.
    #[serde(default)]
    pub event: Option<EventFilter>,
    /// Ordering within the plugin; lower first, declaration order on ties.
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub permission: Permission,
    /// Log each invocation at info level.
    #[serde(default = "default_log")]
    pub log: bool,
}

fn default_log() -> bool {
    true
}

impl RuleSpec {
    /// Creates a rule for `handler` matching `pattern`.
    pub fn new(pattern: impl Into<String>, handler: impl Into<String>) -> Self {
        Self {
            pattern: Some(pattern.into()),
            handler: handler.into(),
            event: None,
            priority: None,
            permission: Permission::All,
            log: true,
        }
    }

    /// Creates a rule that matches every text.
    pub fn any(handler: impl Into<String>) -> Self {
        Self {
            pattern: None,
            ..Self::new("", handler)
        }
    }

    /// Sets the event filter.
    pub fn event(mut self, filter: impl Into<EventFilter>) -> Self {
        self.event = Some(filter.into());
        self
    }

    /// Sets the required permission.
    pub fn permission(mut self, permission: Permission) -> Self {
        self.permission = permission;
        self
    }

    /// Sets the rule priority.
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Disables per-invocation info logging.
    pub fn quiet(mut self) -> Self {
        self.log = false;
        self
    }
}

/// A compiled rule.
#[derive(Debug, Clone)]
pub struct Rule {
    pub events: EventFilter,
    pub matcher: Option<Regex>,
    pub handler: String,
    pub priority: i32,
    pub permission: Permission,
    pub log: bool,
}

impl Rule {
    /// Returns `true` if the rule's event filter selects `event`.
    pub fn matches_event(&self, event: &Event) -> bool {
        self.events.matches(event)
    }

    /// Tests `text` against the regex, returning the capture groups.
    ///
    /// Group 0 is the whole match. A rule without a regex matches with no
    /// captures.
    pub fn captures(&self, text: &str) -> Option<Vec<Option<String>>> {
        match &self.matcher {
            None => Some(Vec::new()),
            Some(re) => re.captures(text).map(|caps| {
                caps.iter()
                    .map(|m| m.map(|m| m.as_str().to_string()))
                    .collect()
            }),
        }
    }
}

/// Compiles regexes once per distinct pattern string.
#[derive(Debug, Default)]
pub struct PatternCache {
    compiled: Mutex<HashMap<String, Regex>>,
}

impl PatternCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the compiled regex for `pattern`, compiling it on first use.
    pub fn get(&self, pattern: &str) -> Result<Regex, PluginError> {
        let mut compiled = self.compiled.lock();
        if let Some(re) = compiled.get(pattern) {
            return Ok(re.clone());
        }
        let re = Regex::new(pattern).map_err(|e| PluginError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;
        compiled.insert(pattern.to_string(), re.clone());
        Ok(re)
    }

    /// Number of cached patterns.
    pub fn len(&self) -> usize {
        self.compiled.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.compiled.lock().is_empty()
    }

    /// Forgets every compiled pattern.
    pub fn clear(&self) {
        self.compiled.lock().clear();
    }

    /// Compiles `specs` into rules sorted by rule priority.
    ///
    /// Rules without their own event filter inherit `default_event`. The sort
    /// is stable, so equal priorities keep declaration order.
    pub fn compile_rules(
        &self,
        specs: &[RuleSpec],
        default_event: &EventFilter,
    ) -> Result<Vec<Rule>, PluginError> {
        let mut rules = specs
            .iter()
            .map(|spec| {
                let matcher = match spec.pattern.as_deref() {
                    Some(p) if !p.is_empty() => Some(self.get(p)?),
                    _ => None,
                };
                Ok(Rule {
                    events: spec.event.clone().unwrap_or_else(|| default_event.clone()),
                    matcher,
                    handler: spec.handler.clone(),
                    priority: spec.priority.unwrap_or(0),
                    permission: spec.permission,
                    log: spec.log,
                })
            })
            .collect::<Result<Vec<_>, PluginError>>()?;
        rules.sort_by_key(|r| r.priority);
        Ok(rules)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use sinter_core::{Category, EventSource};

    fn no_alias(pattern: &str, path: &str) -> bool {
        event_type_matches(pattern, path, &[])
    }

    #[test]
    fn test_group_normal_matching() {
        let path = "message.group.normal";
        assert!(no_alias("message.group", path));
        assert!(no_alias("message.*", path));
        assert!(no_alias("message", path));
        assert!(no_alias("message.group.normal", path));
        assert!(no_alias("*", path));
        assert!(no_alias("", path));

        assert!(!no_alias("private", path));
        assert!(!no_alias("message.groupextra", path));
        assert!(!no_alias("notice.group", path));
        assert!(!no_alias("message.private", path));
    }

    #[test]
    fn test_wildcard_requires_deeper_segment() {
        assert!(!no_alias("message.*", "message"));
        assert!(no_alias("message.*", "message.private"));
        assert!(!no_alias("message.group", "message.groups"));
    }

    #[test]
    fn test_device_aliases() {
        let aliases = vec!["message".to_string(), "message.group".to_string()];
        assert!(event_type_matches("message", "device.message", &aliases));
        assert!(event_type_matches("message.group", "device.message", &aliases));
        assert!(event_type_matches("device", "device.message", &aliases));
        assert!(!event_type_matches("message.private", "device.message", &aliases));
    }

    fn group_event(role: SenderRole) -> Event {
        let mut e = Event::empty(Category::Message, Value::Null);
        e.subtypes = vec!["group".into(), "normal".into()];
        e.is_group = true;
        e.sender_role = role;
        e
    }

    #[test]
    fn test_permission_levels() {
        let none = Grants::default();
        let member = group_event(SenderRole::Member);
        let admin = group_event(SenderRole::Admin);
        let owner = group_event(SenderRole::Owner);

        assert!(Permission::All.permits(&member, none));
        assert!(!Permission::Admin.permits(&member, none));
        assert!(Permission::Admin.permits(&admin, none));
        assert!(Permission::Admin.permits(&owner, none));
        assert!(!Permission::Owner.permits(&admin, none));
        assert!(Permission::Owner.permits(&owner, none));
        assert!(!Permission::Master.permits(&owner, none));

        let master = Grants {
            master: true,
            admin: false,
        };
        assert!(Permission::Master.permits(&member, master));
        assert!(Permission::Owner.permits(&member, master));

        let mut private = group_event(SenderRole::Member);
        private.is_group = false;
        assert!(Permission::Owner.permits(&private, none));
        assert!(Permission::Admin.permits(&private, none));
        assert!(!Permission::Master.permits(&private, none));
    }

    #[test]
    fn test_special_events_always_permitted() {
        let mut e = group_event(SenderRole::Member);
        e.source = EventSource::Stdin;
        assert!(Permission::Master.permits(&e, Grants::default()));
    }

    #[test]
    fn test_compile_rules_sorts_stably_and_inherits_event() {
        let cache = PatternCache::new();
        let specs = vec![
            RuleSpec::new("^b$", "second").priority(10),
            RuleSpec::new("^a$", "first").priority(-1),
            RuleSpec::any("third").priority(10).event("notice"),
        ];
        let rules = cache.compile_rules(&specs, &EventFilter::default()).unwrap();
        let handlers: Vec<&str> = rules.iter().map(|r| r.handler.as_str()).collect();
        assert_eq!(handlers, vec!["first", "second", "third"]);
        assert_eq!(rules[0].events, EventFilter::One("message".into()));
        assert_eq!(rules[2].events, EventFilter::One("notice".into()));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_invalid_pattern_is_reported() {
        let cache = PatternCache::new();
        let err = cache
            .compile_rules(&[RuleSpec::new("(", "h")], &EventFilter::default())
            .unwrap_err();
        assert!(matches!(err, PluginError::InvalidPattern { .. }));
    }

    #[test]
    fn test_captures() {
        let cache = PatternCache::new();
        let rules = cache
            .compile_rules(&[RuleSpec::new(r"^#?roll\s*(\d+)?$", "roll")], &EventFilter::default())
            .unwrap();
        let caps = rules[0].captures("#roll 20").unwrap();
        assert_eq!(caps[1].as_deref(), Some("20"));
        assert!(rules[0].captures("nope").is_none());
    }

    #[test]
    fn test_manifest_rule_aliases() {
        let spec: RuleSpec = serde_json::from_value(serde_json::json!({
            "reg": "^hi$",
            "fnc": "greet",
            "event": ["message.group", "message.private"],
            "permission": "admin"
        }))
        .unwrap();
        assert_eq!(spec.pattern.as_deref(), Some("^hi$"));
        assert_eq!(spec.handler, "greet");
        assert_eq!(spec.permission, Permission::Admin);
        assert!(spec.log);
        assert!(matches!(spec.event, Some(EventFilter::Many(ref v)) if v.len() == 2));
    }
}
