//! Event ingestion and normalization.
//!
//! Ports `bot.go::processEventAsync` / `preprocessMessageEvent` /
//! `preprocessNoticeEvent`: decode, synthesize guild group/user ids via
//! CRC-64/ISO when the wire message id isn't an integer, and derive
//! `is_to_me`.

use crate::config::Config;
use crate::error::PipelineError;
use crate::event::{Event, Message, MessageId};
use crc::{Crc, CRC_64_GO_ISO};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Same table as Go's `crc64.MakeTable(crc64.ISO)`, reused for both
/// guild-group-id and guild-user-id synthesis.
static CRC64_ISO: Crc<u64> = Crc::<u64>::new(&CRC_64_GO_ISO);

fn synthesize_id(parts: &[&[u8]]) -> i64 {
    let crc = &CRC64_ISO;
    let mut digest = crc.digest();
    for part in parts {
        digest.update(part);
    }
    let masked = digest.finalize() & 0x7fff_ffff_ffff_ffff;
    let masked = if masked <= 0xffff_ffff {
        masked | 0x1_0000_0000
    } else {
        masked
    };
    masked as i64
}

/// Raw CRC-64/ISO checksum of `bytes`, cast straight to `i64` with no
/// masking — the fallback `rules.go::ReplyRule` uses to compare a
/// string reply id against an integer target, distinct from
/// [`synthesize_id`]'s packed id-space encoding.
pub(crate) fn hash_reply_id(bytes: &str) -> i64 {
    CRC64_ISO.checksum(bytes.as_bytes()) as i64
}

/// Ring-buffer or direct ingestion of raw inbound payloads, each paired
/// with the caller to reply through.
pub enum IngestionMode {
    Direct,
    Ring { len: usize },
}

/// 5-minute TTL map from an inbound message id to the outbound message
/// ids it triggered, mirroring `bot.go`'s `ttl.NewCache[...]`.
pub struct TriggeredMessages {
    entries: Mutex<HashMap<MessageId, (Instant, Vec<MessageId>)>>,
    ttl: Duration,
}

impl TriggeredMessages {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl: Duration::from_secs(300),
        }
    }

    pub async fn record(&self, inbound: MessageId, outbound: MessageId) {
        let mut entries = self.entries.lock().await;
        sweep(&mut entries, self.ttl);
        entries
            .entry(inbound)
            .or_insert_with(|| (Instant::now(), Vec::new()))
            .1
            .push(outbound);
    }

    pub async fn get(&self, inbound: &MessageId) -> Vec<MessageId> {
        let mut entries = self.entries.lock().await;
        sweep(&mut entries, self.ttl);
        entries.get(inbound).map(|(_, v)| v.clone()).unwrap_or_default()
    }
}

impl Default for TriggeredMessages {
    fn default() -> Self {
        Self::new()
    }
}

fn sweep(entries: &mut HashMap<MessageId, (Instant, Vec<MessageId>)>, ttl: Duration) {
    let now = Instant::now();
    entries.retain(|_, (inserted, _)| now.duration_since(*inserted) < ttl);
}

/// Decodes a raw payload and fully normalizes it: guild id synthesis,
/// `detail_type` assignment, `@self`/nickname stripping, `is_to_me`
/// derivation. Mirrors `processEventAsync` end to end for a single event.
pub fn normalize(payload: &[u8], config: &Config) -> Result<Event, PipelineError> {
    let mut event = Event::from_slice(payload)?;

    assign_message_id(&mut event);
    assign_detail_type(&mut event);

    match event.post_type.as_str() {
        "message" => preprocess_message(&mut event, config),
        "notice" => preprocess_notice(&mut event),
        _ => {}
    }

    Ok(event)
}

fn assign_message_id(event: &mut Event) {
    let raw = event.raw.get("message_id");
    let as_int = raw.and_then(|v| v.as_i64());
    if let Some(i) = as_int {
        event.message_id = Some(MessageId::Integer(i));
        return;
    }
    let as_str = raw.and_then(|v| v.as_str()).map(|s| s.to_string());
    if let Some(s) = as_str {
        event.message_id = Some(MessageId::Str(s));
        if event.detail_type_is_guild_like() {
            synthesize_guild_ids(event);
        }
    }
}

impl Event {
    fn detail_type_is_guild_like(&self) -> bool {
        self.guild_id.is_some() && self.channel_id.is_some()
    }
}

fn synthesize_guild_ids(event: &mut Event) {
    if let (Some(guild), Some(channel)) = (&event.guild_id, &event.channel_id) {
        event.group_id = Some(synthesize_id(&[guild.as_bytes(), channel.as_bytes()]));
    }
    if let Some(tiny) = &event.tiny_id {
        let synthesized = synthesize_id(&[tiny.as_bytes()]);
        event.user_id = synthesized;
        if let Some(sender) = event.sender.as_mut() {
            sender.user_id = Some(synthesized);
        }
    }
}

fn assign_detail_type(event: &mut Event) {
    event.detail_type = match event.post_type.as_str() {
        "message" => event.message_type.clone(),
        "notice" => event.notice_type.clone(),
        "request" => event.request_type.clone(),
        "meta_event" => event.meta_event_type.clone(),
        other => other.to_string(),
    };
    if event.detail_type_is_guild_like() {
        event.detail_type = "guild".to_string();
    }
}

fn preprocess_message(event: &mut Event, config: &Config) {
    trim_first_text_leading(&mut event.message);

    if event.detail_type == "private" {
        event.is_to_me = true;
    } else {
        let took_at = event.message.take_leading_at(event.self_id);
        if took_at {
            event.is_to_me = true;
        } else if let Some(stripped) = strip_nickname_prefix(&mut event.message, &config.nickname) {
            event.is_to_me = stripped;
        }
    }

    // "Trim Again!" — the original trims a second time, unconditionally,
    // after the at/nickname stripping above may have shifted the text.
    trim_first_text_leading(&mut event.message);
}

fn trim_first_text_leading(message: &mut Message) {
    if let Some(text) = message.first_text_mut() {
        *text = text.trim_start().to_string();
    }
}

fn strip_nickname_prefix(message: &mut Message, nicknames: &[String]) -> Option<bool> {
    let text = message.first_text_mut()?;
    for nick in nicknames {
        if let Some(rest) = text.strip_prefix(nick.as_str()) {
            *text = rest.to_string();
            return Some(true);
        }
    }
    None
}

fn preprocess_notice(event: &mut Event) {
    event.is_to_me = if matches!(event.sub_type.as_str(), "poke" | "lucky_king") {
        event.target_id == Some(event.self_id)
    } else {
        event.user_id == event.self_id
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::MessageSegment;

    fn test_event(detail_type: &str, segments: Vec<MessageSegment>) -> Event {
        Event {
            time: 0,
            self_id: 1,
            post_type: "message".into(),
            message_type: detail_type.into(),
            notice_type: String::new(),
            request_type: String::new(),
            meta_event_type: String::new(),
            sub_type: String::new(),
            user_id: 42,
            group_id: if detail_type == "group" { Some(7) } else { None },
            guild_id: None,
            channel_id: None,
            target_id: None,
            tiny_id: None,
            message_id: None,
            raw_message: String::new(),
            message: Message(segments),
            sender: None,
            detail_type: detail_type.into(),
            is_to_me: false,
            raw: serde_json::Value::Null,
        }
    }

    #[test]
    fn preprocess_message_strips_leading_at_in_group_but_not_private() {
        let config = Config::default();

        let mut group_event = test_event("group", vec![MessageSegment::at("1"), MessageSegment::text(" hi")]);
        preprocess_message(&mut group_event, &config);
        assert!(group_event.is_to_me);
        assert!(!group_event.message.has_segment("at"));
        assert_eq!(group_event.message.extract_plain_text(), "hi");

        let mut private_event = test_event("private", vec![MessageSegment::at("1"), MessageSegment::text(" hi")]);
        preprocess_message(&mut private_event, &config);
        assert!(private_event.is_to_me);
        assert!(private_event.message.has_segment("at"));
    }

    #[test]
    fn synthesize_id_is_deterministic_and_positive() {
        let a = synthesize_id(&[b"guild1", b"channel1"]);
        let b = synthesize_id(&[b"guild1", b"channel1"]);
        let c = synthesize_id(&[b"guild2", b"channel1"]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a > 0);
        assert!(c > 0);
    }

    #[tokio::test]
    async fn triggered_messages_round_trip() {
        let map = TriggeredMessages::new();
        let inbound = MessageId::Integer(1);
        map.record(inbound.clone(), MessageId::Integer(100)).await;
        map.record(inbound.clone(), MessageId::Integer(101)).await;
        let got = map.get(&inbound).await;
        assert_eq!(got, vec![MessageId::Integer(100), MessageId::Integer(101)]);
    }
}
