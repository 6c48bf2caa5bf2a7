//! Canonical event model.
//!
//! Every raw adapter payload is turned into exactly one [`Event`] by the
//! [`EventNormalizer`](crate::normalize::EventNormalizer). Events are shared
//! as `Arc<Event>` and are never mutated once dispatch begins; the reply
//! transport is attached with [`Event::with_transport`] beforehand.
//!
//! # Event paths
//!
//! An event's *path* joins its category with the resolved subtype segments:
//!
//! ```text
//! post_type=message, message_type=group, sub_type=normal  →  message.group.normal
//! post_type=notice,  notice_type=group_increase            →  notice.group_increase
//! post_type=device,  event_type=message (group scoped)     →  device.message
//!                                        aliases: message, message.group
//! ```

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{BoxError, CoreError, CoreResult};

// =============================================================================
// Classification
// =============================================================================

/// Where an event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    /// A chat-platform protocol adapter.
    Adapter,
    /// A connected device (console, hardware client).
    Device,
    /// The host's standard input.
    Stdin,
}

/// Top-level event category, read from `post_type`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Category {
    Message,
    Notice,
    Request,
    MetaEvent,
    Device,
    Stdin,
    /// Any other `post_type`, kept verbatim (empty when absent).
    Other(String),
}

impl Category {
    /// Parses a `post_type` value.
    pub fn from_post_type(post_type: &str) -> Self {
        match post_type {
            "message" => Self::Message,
            "notice" => Self::Notice,
            "request" => Self::Request,
            "meta_event" => Self::MetaEvent,
            "device" => Self::Device,
            "stdin" => Self::Stdin,
            other => Self::Other(other.to_string()),
        }
    }

    /// Returns the category name used as the first path segment.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Message => "message",
            Self::Notice => "notice",
            Self::Request => "request",
            Self::MetaEvent => "meta_event",
            Self::Device => "device",
            Self::Stdin => "stdin",
            Self::Other(s) if s.is_empty() => "unknown",
            Self::Other(s) => s,
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Group membership role of the sender.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SenderRole {
    Owner,
    Admin,
    Member,
    #[default]
    Unknown,
}

impl SenderRole {
    /// Parses the `sender.role` field of a raw payload.
    pub fn parse(role: &str) -> Self {
        match role {
            "owner" => Self::Owner,
            "admin" => Self::Admin,
            "member" => Self::Member,
            _ => Self::Unknown,
        }
    }
}

// =============================================================================
// Content
// =============================================================================

/// One raw message segment (`{"type": ..., "data": {...}}`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    /// Segment type (`text`, `image`, `at`, ...).
    #[serde(rename = "type")]
    pub kind: String,
    /// Segment payload.
    #[serde(default)]
    pub data: Value,
}

/// A media attachment collected from the segment list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRef {
    /// Segment type the media came from (`image`, `record`, `video`, `file`).
    pub kind: String,
    /// URL or file reference.
    pub url: String,
}

// =============================================================================
// Reply transport port
// =============================================================================

/// Capability object attached to an event for sending replies.
///
/// The router never interprets the result beyond its truthiness, which only
/// feeds statistics.
#[async_trait]
pub trait ReplyTransport: Send + Sync {
    /// Sends `message` in reply to `event`.
    async fn send(&self, event: &Event, message: &str) -> Result<bool, BoxError>;
}

/// Shared reply transport handle.
pub type BoxedTransport = Arc<dyn ReplyTransport>;

// =============================================================================
// Event
// =============================================================================

/// The canonical, normalized representation of one inbound occurrence.
#[derive(Clone)]
pub struct Event {
    /// Adapter-supplied message id, or a digest of the payload.
    pub id: String,
    /// Identity of the bot that received the event.
    pub bot_id: String,
    pub source: EventSource,
    pub category: Category,
    /// Resolved subtype segments, empty ones skipped.
    pub subtypes: Vec<String>,
    /// Composite paths this event also answers to.
    pub aliases: Vec<String>,
    pub user_id: Option<String>,
    pub group_id: Option<String>,
    pub device_id: Option<String>,
    pub message_id: Option<String>,
    pub sender_role: SenderRole,
    pub sender_name: Option<String>,
    /// Matchable plain text.
    pub text: String,
    pub segments: Vec<Segment>,
    pub media: Vec<MediaRef>,
    pub at_list: Vec<String>,
    pub at_bot: bool,
    /// Unix timestamp of the occurrence.
    pub time: i64,
    pub is_group: bool,
    pub is_private: bool,
    pub is_master: bool,
    /// Short human-readable label for log lines.
    pub log_label: String,
    /// The payload the event was built from.
    pub raw: Arc<Value>,
    transport: Option<BoxedTransport>,
}

impl Event {
    /// Returns the dotted event path (`message.group.normal`).
    pub fn path(&self) -> String {
        let mut path = self.category.as_str().to_string();
        for segment in &self.subtypes {
            path.push('.');
            path.push_str(segment);
        }
        path
    }

    /// Returns `true` for device events.
    pub fn is_device(&self) -> bool {
        self.source == EventSource::Device
    }

    /// Returns `true` for device and stdin events.
    ///
    /// Special events bypass rate limiting and permission checks.
    pub fn is_special(&self) -> bool {
        matches!(self.source, EventSource::Device | EventSource::Stdin)
    }

    /// Returns `true` when the bot authored this event itself.
    pub fn is_self_authored(&self) -> bool {
        self.user_id.as_deref() == Some(self.bot_id.as_str())
    }

    /// Attaches the reply transport. Must happen before dispatch.
    pub fn with_transport(mut self, transport: BoxedTransport) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Returns the attached reply transport, if any.
    pub fn transport(&self) -> Option<&BoxedTransport> {
        self.transport.as_ref()
    }

    /// Sends a reply through the attached transport.
    pub async fn reply(&self, message: &str) -> CoreResult<bool> {
        let Some(transport) = &self.transport else {
            return Err(CoreError::NoTransport {
                event_id: self.id.clone(),
            });
        };
        transport
            .send(self, message)
            .await
            .map_err(|e| CoreError::SendFailed(e.to_string()))
    }

    /// Creates an event with every field defaulted.
    ///
    /// The normalizer fills the rest; this is also the degraded form used for
    /// unparseable payloads.
    pub fn empty(category: Category, raw: Value) -> Self {
        Self {
            id: String::new(),
            bot_id: String::new(),
            source: EventSource::Adapter,
            category,
            subtypes: Vec::new(),
            aliases: Vec::new(),
            user_id: None,
            group_id: None,
            device_id: None,
            message_id: None,
            sender_role: SenderRole::Unknown,
            sender_name: None,
            text: String::new(),
            segments: Vec::new(),
            media: Vec::new(),
            at_list: Vec::new(),
            at_bot: false,
            time: 0,
            is_group: false,
            is_private: false,
            is_master: false,
            log_label: String::new(),
            raw: Arc::new(raw),
            transport: None,
        }
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("id", &self.id)
            .field("bot_id", &self.bot_id)
            .field("path", &self.path())
            .field("user_id", &self.user_id)
            .field("group_id", &self.group_id)
            .field("text", &self.text)
            .field("has_transport", &self.transport.is_some())
            .finish_non_exhaustive()
    }
}
