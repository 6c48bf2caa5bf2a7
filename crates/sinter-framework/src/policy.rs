//! Dispatch policy port.
//!
//! The router never owns bot configuration. Everything it needs to gate an
//! event (shutdown flags, cooldowns, black/white lists, privileged ids, bot
//! name aliases, per-group plugin toggles and mute state) is read through
//! [`DispatchPolicy`]. [`StaticPolicy`] is the serde-configurable
//! implementation used by the runtime.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use sinter_core::Event;

// =============================================================================
// Cooldowns
// =============================================================================

/// Cooldown lengths per throttle scope, in milliseconds. Zero disables a scope.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Cooldowns {
    /// Whole-group cooldown after the bot replies.
    pub group_ms: u64,
    /// Per (group, user) cooldown.
    pub user_ms: u64,
    /// Per device cooldown.
    pub device_ms: u64,
}

impl Cooldowns {
    pub fn group(&self) -> Duration {
        Duration::from_millis(self.group_ms)
    }

    pub fn user(&self) -> Duration {
        Duration::from_millis(self.user_ms)
    }

    pub fn device(&self) -> Duration {
        Duration::from_millis(self.device_ms)
    }

    /// Returns `true` if every scope is disabled.
    pub fn is_disabled(&self) -> bool {
        self.group_ms == 0 && self.user_ms == 0 && self.device_ms == 0
    }
}

// =============================================================================
// Port
// =============================================================================

/// Configuration lookups the router performs while gating an event.
///
/// Every method has a permissive default so tests and embedders only
/// override what they need.
pub trait DispatchPolicy: Send + Sync {
    /// Returns `true` if the bot has been told to stop answering.
    fn is_shutdown(&self, _bot_id: &str) -> bool {
        false
    }

    /// Cooldowns that apply to `event`.
    fn cooldowns(&self, _event: &Event) -> Cooldowns {
        Cooldowns::default()
    }

    /// Returns `true` if black/white lists reject the sender.
    fn is_blocked(&self, _event: &Event) -> bool {
        false
    }

    /// Returns `true` if the sender is a configured master.
    fn is_master(&self, _event: &Event) -> bool {
        false
    }

    /// Returns `true` if the sender is a configured bot admin.
    fn is_admin(&self, _event: &Event) -> bool {
        false
    }

    /// Name aliases the bot answers to in groups (`"bot, do x"`).
    fn bot_aliases(&self, _bot_id: &str) -> Vec<String> {
        Vec::new()
    }

    /// Returns `false` if the plugin is switched off where `event` happened.
    fn plugin_enabled(&self, _event: &Event, _plugin: &str) -> bool {
        true
    }

    /// Returns `true` if the bot is muted in the event's group.
    fn is_group_muted(&self, _event: &Event) -> bool {
        false
    }
}

/// Policy that gates nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct OpenPolicy;

impl DispatchPolicy for OpenPolicy {}

// =============================================================================
// Static policy
// =============================================================================

/// User and group id lists.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdList {
    pub users: HashSet<String>,
    pub groups: HashSet<String>,
}

/// Per-group overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupPolicy {
    /// When non-empty, only these plugins run in the group.
    pub enable: Vec<String>,
    /// Plugins that never run in the group.
    pub disable: Vec<String>,
    /// The bot is muted and must stay silent.
    pub muted: bool,
    /// Replaces the global cooldowns.
    pub cooldowns: Option<Cooldowns>,
}

/// Serializable dispatch policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub cooldowns: Cooldowns,
    /// Bots that are shut down.
    pub shutdown: HashSet<String>,
    pub masters: HashSet<String>,
    pub admins: HashSet<String>,
    pub blacklist: IdList,
    /// Empty lists admit everyone.
    pub whitelist: IdList,
    /// Bot id to name aliases; `"*"` applies to every bot.
    pub aliases: HashMap<String, Vec<String>>,
    /// Group id to overrides.
    pub groups: HashMap<String, GroupPolicy>,
}

/// [`DispatchPolicy`] backed by a [`PolicyConfig`] that can be changed at
/// runtime.
#[derive(Debug, Default)]
pub struct StaticPolicy {
    config: RwLock<PolicyConfig>,
}

impl StaticPolicy {
    pub fn new(config: PolicyConfig) -> Self {
        Self {
            config: RwLock::new(config),
        }
    }

    /// Returns a copy of the current configuration.
    pub fn config(&self) -> PolicyConfig {
        self.config.read().clone()
    }

    /// Replaces the whole configuration.
    pub fn replace(&self, config: PolicyConfig) {
        *self.config.write() = config;
    }

    /// Shuts a bot down or brings it back.
    pub fn set_shutdown(&self, bot_id: &str, shutdown: bool) {
        let mut config = self.config.write();
        if shutdown {
            config.shutdown.insert(bot_id.to_string());
        } else {
            config.shutdown.remove(bot_id);
        }
    }

    /// Marks the bot muted in a group.
    pub fn set_group_muted(&self, group_id: &str, muted: bool) {
        self.config
            .write()
            .groups
            .entry(group_id.to_string())
            .or_default()
            .muted = muted;
    }

    fn group_policy<T>(&self, event: &Event, f: impl FnOnce(&GroupPolicy) -> T) -> Option<T> {
        let group = event.group_id.as_deref()?;
        self.config.read().groups.get(group).map(f)
    }
}

impl DispatchPolicy for StaticPolicy {
    fn is_shutdown(&self, bot_id: &str) -> bool {
        self.config.read().shutdown.contains(bot_id)
    }

    fn cooldowns(&self, event: &Event) -> Cooldowns {
        self.group_policy(event, |g| g.cooldowns)
            .flatten()
            .unwrap_or(self.config.read().cooldowns)
    }

    fn is_blocked(&self, event: &Event) -> bool {
        if self.is_master(event) {
            return false;
        }
        let config = self.config.read();
        let user = event.user_id.as_deref();
        let group = event.group_id.as_deref();

        if user.is_some_and(|u| config.blacklist.users.contains(u))
            || group.is_some_and(|g| config.blacklist.groups.contains(g))
        {
            return true;
        }
        if !config.whitelist.users.is_empty()
            && !user.is_some_and(|u| config.whitelist.users.contains(u))
        {
            return true;
        }
        if let Some(g) = group {
            if !config.whitelist.groups.is_empty() && !config.whitelist.groups.contains(g) {
                return true;
            }
        }
        false
    }

    fn is_master(&self, event: &Event) -> bool {
        event
            .user_id
            .as_deref()
            .is_some_and(|u| self.config.read().masters.contains(u))
    }

    fn is_admin(&self, event: &Event) -> bool {
        event
            .user_id
            .as_deref()
            .is_some_and(|u| self.config.read().admins.contains(u))
    }

    fn bot_aliases(&self, bot_id: &str) -> Vec<String> {
        let config = self.config.read();
        config
            .aliases
            .get(bot_id)
            .or_else(|| config.aliases.get("*"))
            .cloned()
            .unwrap_or_default()
    }

    fn plugin_enabled(&self, event: &Event, plugin: &str) -> bool {
        self.group_policy(event, |g| {
            if g.disable.iter().any(|p| p == plugin) {
                return false;
            }
            g.enable.is_empty() || g.enable.iter().any(|p| p == plugin)
        })
        .unwrap_or(true)
    }

    fn is_group_muted(&self, event: &Event) -> bool {
        self.group_policy(event, |g| g.muted).unwrap_or(false)
    }
}
