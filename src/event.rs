//! OneBot v11 event and message model.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A OneBot v11 message-id: either the integer form used by groups/private
/// chats, or the string form guild events carry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageId {
    Integer(i64),
    Str(String),
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageId::Integer(v) => write!(f, "{v}"),
            MessageId::Str(v) => write!(f, "{v}"),
        }
    }
}

/// A single message segment (`{"type": "...", "data": {...}}`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageSegment {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: HashMap<String, String>,
}

impl MessageSegment {
    pub fn text(content: impl Into<String>) -> Self {
        let mut data = HashMap::new();
        data.insert("text".to_string(), content.into());
        Self {
            kind: "text".to_string(),
            data,
        }
    }

    pub fn at(qq: impl Into<String>) -> Self {
        let mut data = HashMap::new();
        data.insert("qq".to_string(), qq.into());
        Self {
            kind: "at".to_string(),
            data,
        }
    }
}

/// An ordered list of message segments.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Message(pub Vec<MessageSegment>);

impl Message {
    pub fn extract_plain_text(&self) -> String {
        self.0
            .iter()
            .filter(|seg| seg.kind == "text")
            .filter_map(|seg| seg.data.get("text"))
            .cloned()
            .collect::<Vec<_>>()
            .join("")
    }

    pub fn first_text_mut(&mut self) -> Option<&mut String> {
        self.0
            .iter_mut()
            .find(|seg| seg.kind == "text")
            .and_then(|seg| seg.data.get_mut("text"))
    }

    pub fn has_segment(&self, kind: &str) -> bool {
        self.0.iter().any(|seg| seg.kind == kind)
    }

    pub fn take_leading_at(&mut self, self_id: i64) -> bool {
        if let Some(first) = self.0.first() {
            if first.kind == "at" {
                let is_self = first
                    .data
                    .get("qq")
                    .and_then(|qq| qq.parse::<i64>().ok())
                    .map(|qq| qq == self_id)
                    .unwrap_or(false);
                if is_self {
                    self.0.remove(0);
                    return true;
                }
            }
        }
        false
    }
}

/// Sender metadata attached to message events.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Sender {
    pub user_id: Option<i64>,
    #[serde(default)]
    pub nickname: String,
    #[serde(default)]
    pub card: String,
    #[serde(default)]
    pub role: String,
}

/// A normalized OneBot v11 event.
///
/// Deserialized from the raw JSON with `serde`, with the full tree kept
/// alongside in `raw` for untyped field access the typed struct doesn't
/// cover.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub time: i64,
    pub self_id: i64,
    pub post_type: String,

    #[serde(default)]
    pub message_type: String,
    #[serde(default)]
    pub notice_type: String,
    #[serde(default)]
    pub request_type: String,
    #[serde(default)]
    pub meta_event_type: String,

    #[serde(default)]
    pub sub_type: String,

    #[serde(default)]
    pub user_id: i64,
    pub group_id: Option<i64>,
    pub guild_id: Option<String>,
    pub channel_id: Option<String>,
    pub target_id: Option<i64>,
    pub tiny_id: Option<String>,

    #[serde(skip)]
    pub message_id: Option<MessageId>,
    #[serde(default)]
    pub raw_message: String,
    #[serde(default)]
    pub message: Message,
    pub sender: Option<Sender>,

    /// Populated by the pipeline, never present in the wire payload.
    #[serde(skip)]
    pub detail_type: String,
    #[serde(skip)]
    pub is_to_me: bool,

    /// The full untyped JSON tree, for rule code that needs a field this
    /// struct doesn't surface.
    #[serde(skip)]
    pub raw: serde_json::Value,
}

impl Event {
    /// Parse an inbound payload. Does not perform pipeline normalization
    /// (guild id synthesis, `is_to_me` derivation) — see `pipeline::normalize`.
    pub fn from_slice(payload: &[u8]) -> Result<Self, crate::error::PipelineError> {
        let raw: serde_json::Value = serde_json::from_slice(payload)?;
        let mut event: Event = serde_json::from_slice(payload)?;
        event.raw = raw;
        Ok(event)
    }

    pub fn is_message(&self) -> bool {
        self.post_type == "message"
    }

    pub fn is_notice(&self) -> bool {
        self.post_type == "notice"
    }

    pub fn is_private(&self) -> bool {
        self.detail_type == "private"
    }

    pub fn is_group(&self) -> bool {
        self.detail_type == "group"
    }

    pub fn is_guild(&self) -> bool {
        self.detail_type == "guild"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_plain_text_concatenates_text_segments() {
        let msg = Message(vec![
            MessageSegment::text("hello "),
            MessageSegment::at("123"),
            MessageSegment::text("world"),
        ]);
        assert_eq!(msg.extract_plain_text(), "hello world");
    }

    #[test]
    fn take_leading_at_removes_self_mention_only() {
        let mut msg = Message(vec![MessageSegment::at("10"), MessageSegment::text("hi")]);
        assert!(!msg.take_leading_at(20));
        assert_eq!(msg.0.len(), 2);
        assert!(msg.take_leading_at(10));
        assert_eq!(msg.0.len(), 1);
    }
}
