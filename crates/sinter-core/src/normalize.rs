//! Raw payload normalization.
//!
//! The [`EventNormalizer`] inspects `post_type` and the category-specific
//! subtype fields in a raw JSON payload and builds a canonical [`Event`].
//! Normalization never fails: malformed or partial payloads degrade to
//! best-effort defaults.
//!
//! # Category → field table
//!
//! | Category     | Subtype fields (in order)        |
//! |--------------|----------------------------------|
//! | `message`    | `message_type`, `sub_type`       |
//! | `notice`     | `notice_type`, `sub_type`        |
//! | `request`    | `request_type`, `sub_type`       |
//! | `meta_event` | `meta_event_type`, `sub_type`    |
//! | `device`     | `event_type`, `sub_type`         |
//! | `stdin`      | `message_type`                   |
//! | other        | `sub_type`                       |

use std::collections::HashSet;

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::event::{Category, Event, EventSource, MediaRef, Segment, SenderRole};

/// Segment types whose `url`/`file` is collected as media.
const MEDIA_SEGMENTS: [&str; 4] = ["image", "record", "video", "file"];

/// Keys probed, in order, when turning a JSON card segment into text.
const CARD_TEXT_KEYS: [&str; 3] = ["prompt", "desc", "title"];

/// Returns the subtype field list for a category.
fn subtype_fields(category: &Category) -> &'static [&'static str] {
    match category {
        Category::Message => &["message_type", "sub_type"],
        Category::Notice => &["notice_type", "sub_type"],
        Category::Request => &["request_type", "sub_type"],
        Category::MetaEvent => &["meta_event_type", "sub_type"],
        Category::Device => &["event_type", "sub_type"],
        Category::Stdin => &["message_type"],
        Category::Other(_) => &["sub_type"],
    }
}

/// Reads an identifier that adapters send either as a number or a string.
fn id_field(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn str_field<'a>(raw: &'a Value, key: &str) -> &'a str {
    raw.get(key).and_then(Value::as_str).unwrap_or("")
}

/// Turns raw payloads into canonical events.
///
/// The normalizer is stateless apart from the master id set it was built
/// with, so the same input always yields the same event.
#[derive(Debug, Clone, Default)]
pub struct EventNormalizer {
    masters: HashSet<String>,
}

impl EventNormalizer {
    /// Creates a normalizer with no master ids.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a normalizer that flags events from the given users as master.
    pub fn with_masters<I, S>(masters: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            masters: masters.into_iter().map(Into::into).collect(),
        }
    }

    /// Normalizes a raw JSON string, degrading to an `unknown` event when the
    /// input is not valid JSON.
    pub fn normalize_str(&self, raw: &str) -> Event {
        match serde_json::from_str::<Value>(raw) {
            Ok(value) => self.normalize(&value),
            Err(e) => {
                tracing::debug!(error = %e, "Unparseable payload, emitting unknown event");
                let mut event = Event::empty(
                    Category::Other(String::new()),
                    Value::String(raw.to_string()),
                );
                event.id = synthesize_id(&event.raw);
                event.text = raw.to_string();
                event.log_label = "[unknown]".to_string();
                event
            }
        }
    }

    /// Normalizes a raw JSON payload.
    pub fn normalize(&self, raw: &Value) -> Event {
        let category = Category::from_post_type(str_field(raw, "post_type"));
        let mut event = Event::empty(category.clone(), raw.clone());

        event.source = match category {
            Category::Device => EventSource::Device,
            Category::Stdin => EventSource::Stdin,
            _ => EventSource::Adapter,
        };
        event.subtypes = subtype_fields(&category)
            .iter()
            .map(|field| str_field(raw, field))
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();

        // Identity
        event.bot_id = id_field(raw.get("self_id")).unwrap_or_default();
        let sender = raw.get("sender");
        event.user_id =
            id_field(raw.get("user_id")).or_else(|| id_field(sender.and_then(|s| s.get("user_id"))));
        event.group_id = id_field(raw.get("group_id"));
        event.device_id = id_field(raw.get("device_id"));
        event.message_id = id_field(raw.get("message_id"));
        event.sender_role = sender
            .and_then(|s| s.get("role"))
            .and_then(Value::as_str)
            .map(SenderRole::parse)
            .unwrap_or_default();
        event.sender_name = sender
            .and_then(|s| s.get("card").and_then(Value::as_str).filter(|c| !c.is_empty()))
            .or_else(|| sender.and_then(|s| s.get("nickname")).and_then(Value::as_str))
            .map(String::from);
        event.time = raw.get("time").and_then(Value::as_i64).unwrap_or(0);

        // Content
        self.extract_content(raw, &mut event);

        // Derived flags
        let message_type = str_field(raw, "message_type");
        event.is_group = event.group_id.is_some() || message_type == "group";
        event.is_private = message_type == "private";
        event.is_master = event.is_special()
            || event
                .user_id
                .as_ref()
                .is_some_and(|u| self.masters.contains(u));

        if category == Category::Device && event.subtypes.first().is_some_and(|s| s == "message") {
            event.aliases.push("message".to_string());
            if event.is_group {
                event.aliases.push("message.group".to_string());
            }
        }

        event.id = event
            .message_id
            .clone()
            .unwrap_or_else(|| synthesize_id(&event.raw));
        event.log_label = log_label(&event);
        event
    }

    fn extract_content(&self, raw: &Value, event: &mut Event) {
        let segments: Vec<Segment> = match raw.get("message") {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|item| serde_json::from_value(item.clone()).ok())
                .collect(),
            _ => Vec::new(),
        };

        let mut text = String::new();
        for segment in &segments {
            match segment.kind.as_str() {
                "text" => {
                    if let Some(t) = segment.data.get("text").and_then(Value::as_str) {
                        text.push_str(t);
                    }
                }
                "json" => text.push_str(&card_text(&segment.data)),
                "xml" => {
                    if let Some(x) = segment.data.get("data").and_then(Value::as_str) {
                        text.push_str(x);
                    }
                }
                "at" => {
                    if let Some(target) = id_field(segment.data.get("qq")) {
                        if target == event.bot_id {
                            event.at_bot = true;
                        }
                        event.at_list.push(target);
                    }
                }
                kind if MEDIA_SEGMENTS.contains(&kind) => {
                    let url = segment
                        .data
                        .get("url")
                        .and_then(Value::as_str)
                        .or_else(|| segment.data.get("file").and_then(Value::as_str));
                    if let Some(url) = url {
                        event.media.push(MediaRef {
                            kind: kind.to_string(),
                            url: url.to_string(),
                        });
                    }
                }
                _ => {}
            }
        }

        if segments.is_empty() {
            text = raw
                .get("message")
                .and_then(Value::as_str)
                .or_else(|| raw.get("raw_message").and_then(Value::as_str))
                .or_else(|| raw.get("text").and_then(Value::as_str))
                .unwrap_or("")
                .to_string();
        }

        event.text = text.trim().to_string();
        event.segments = segments;
    }
}

/// Converts a structured card segment into matchable text.
fn card_text(data: &Value) -> String {
    let payload = match data.get("data") {
        Some(Value::String(s)) => serde_json::from_str::<Value>(s).unwrap_or(Value::String(s.clone())),
        Some(other) => other.clone(),
        None => return String::new(),
    };
    if let Value::String(s) = &payload {
        return s.clone();
    }
    CARD_TEXT_KEYS
        .iter()
        .find_map(|key| payload.get(*key).and_then(Value::as_str).filter(|s| !s.is_empty()))
        .map(String::from)
        .unwrap_or_else(|| payload.to_string())
}

/// Derives a deterministic id from the payload digest.
fn synthesize_id(raw: &Value) -> String {
    let bytes = serde_json::to_vec(raw).unwrap_or_default();
    let digest = Sha256::digest(&bytes);
    format!("evt-{}", hex::encode(&digest[..12]))
}

fn log_label(event: &Event) -> String {
    let user = event.user_id.as_deref().unwrap_or("-");
    match (&event.group_id, &event.device_id) {
        _ if event.source == EventSource::Stdin => "[stdin]".to_string(),
        (_, Some(device)) if event.is_device() => format!("[device:{device}]"),
        (Some(group), _) => format!("[group:{group} user:{user}]"),
        _ if event.is_private => format!("[private user:{user}]"),
        _ => format!("[{} user:{user}]", event.category),
    }
}
