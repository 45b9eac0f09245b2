//! The rule library: closures that inspect a [`Ctx`] and decide whether a
//! matcher's handler should run, optionally stashing parsed data into
//! `ctx.state` for the handler to read back.
//!
//! Semantics are ported from `examples/original_source/rules.go`.

use crate::config::Config;
use crate::context::{Ctx, StateValue};
use crate::driver::ApiRequest;
use futures::future::BoxFuture;
use regex::Regex;
use std::sync::Arc;

/// A rule: given the context, decide (possibly asynchronously) whether
/// to continue down this matcher's rule chain.
pub type Rule = Arc<dyn Fn(Arc<Ctx>) -> BoxFuture<'static, bool> + Send + Sync>;

/// A handler: the terminal action a matcher runs once all its rules pass.
pub type Handler = Arc<dyn Fn(Arc<Ctx>) -> BoxFuture<'static, ()> + Send + Sync>;

fn rule(f: impl Fn(Arc<Ctx>) -> BoxFuture<'static, bool> + Send + Sync + 'static) -> Rule {
    Arc::new(f)
}

/// Builds a `Rule` from an arbitrary closure. Prefer the named factories
/// below; this exists for call sites (engine pre/mid-handlers) that need
/// a one-off rule not worth a dedicated factory.
pub fn custom(f: impl Fn(Arc<Ctx>) -> BoxFuture<'static, bool> + Send + Sync + 'static) -> Rule {
    rule(f)
}

pub fn handler(f: impl Fn(Arc<Ctx>) -> BoxFuture<'static, ()> + Send + Sync + 'static) -> Handler {
    Arc::new(f)
}

/// Matches only events of the given post type (`"message"`, `"notice"`,
/// `"request"`, `"meta_event"`).
pub fn type_(post_type: impl Into<String>) -> Rule {
    let post_type = post_type.into();
    rule(move |ctx| {
        let post_type = post_type.clone();
        Box::pin(async move { ctx.event.post_type == post_type })
    })
}

pub fn only_to_me() -> Rule {
    rule(|ctx| Box::pin(async move { ctx.event.is_to_me }))
}

pub fn only_private() -> Rule {
    rule(|ctx| Box::pin(async move { ctx.event.is_private() }))
}

pub fn only_group() -> Rule {
    rule(|ctx| Box::pin(async move { ctx.event.is_group() }))
}

pub fn only_guild() -> Rule {
    rule(|ctx| Box::pin(async move { ctx.event.is_guild() }))
}

pub fn only_public() -> Rule {
    rule(|ctx| Box::pin(async move { !ctx.event.is_private() }))
}

pub fn check_user(ids: Vec<i64>) -> Rule {
    rule(move |ctx| {
        let ids = ids.clone();
        Box::pin(async move { ids.contains(&ctx.event.user_id) })
    })
}

pub fn check_group(ids: Vec<i64>) -> Rule {
    rule(move |ctx| {
        let ids = ids.clone();
        Box::pin(async move { ctx.event.group_id.map(|g| ids.contains(&g)).unwrap_or(false) })
    })
}

pub fn has_picture() -> Rule {
    rule(|ctx| Box::pin(async move { ctx.event.message.has_segment("image") }))
}

/// Matches when the *first* segment is text starting with `prefix`
/// (segments elsewhere in the message never satisfy this, unlike a
/// whole-message-text scan); writes `ctx.state["prefix"]` and
/// `ctx.state["args"]` (remainder left-trimmed, concatenated with any
/// later segments' plain text). Ports `rules.go::PrefixRule`.
pub fn prefix(prefix: impl Into<String>) -> Rule {
    let prefix = prefix.into();
    rule(move |ctx| {
        let prefix = prefix.clone();
        Box::pin(async move {
            let segments = &ctx.event.message.0;
            let Some(first) = segments.first() else {
                return false;
            };
            if first.kind != "text" {
                return false;
            }
            let Some(first_text) = first.data.get("text") else {
                return false;
            };
            match first_text.strip_prefix(prefix.as_str()) {
                Some(rest) => {
                    let mut arg = rest.trim_start().to_string();
                    if segments.len() > 1 {
                        arg.push_str(&crate::event::Message(segments[1..].to_vec()).extract_plain_text());
                    }
                    ctx_state_set(&ctx, "prefix", StateValue::Text(prefix.clone()));
                    ctx_state_set(&ctx, "args", StateValue::Text(arg));
                    true
                }
                None => false,
            }
        })
    })
}

/// Mirror of [`prefix`] on the *last* text segment: writes
/// `ctx.state["suffix"]` and `ctx.state["args"]` (remainder
/// right-trimmed, with any earlier segments' plain text prepended in
/// message order). Ports `rules.go::SuffixRule`.
pub fn suffix(suffix: impl Into<String>) -> Rule {
    let suffix = suffix.into();
    rule(move |ctx| {
        let suffix = suffix.clone();
        Box::pin(async move {
            let segments = &ctx.event.message.0;
            let Some(last) = segments.last() else {
                return false;
            };
            if last.kind != "text" {
                return false;
            }
            let Some(last_text) = last.data.get("text") else {
                return false;
            };
            match last_text.strip_suffix(suffix.as_str()) {
                Some(rest) => {
                    let mut arg = String::new();
                    if segments.len() > 1 {
                        arg.push_str(
                            &crate::event::Message(segments[..segments.len() - 1].to_vec()).extract_plain_text(),
                        );
                    }
                    arg.push_str(rest.trim_end());
                    ctx_state_set(&ctx, "suffix", StateValue::Text(suffix.clone()));
                    ctx_state_set(&ctx, "args", StateValue::Text(arg));
                    true
                }
                None => false,
            }
        })
    })
}

/// Matches `<command_prefix><name> ...` style input (e.g. `/echo hi`);
/// stores the trimmed remainder in `ctx.state["args"]`. `command_prefix`
/// should come from `Config::command_prefix`. Ports `rules.go::CommandRule`.
pub fn command(command_prefix: impl Into<String>, name: impl Into<String>) -> Rule {
    let command_prefix = command_prefix.into();
    let name = name.into();
    rule(move |ctx| {
        let command_prefix = command_prefix.clone();
        let name = name.clone();
        Box::pin(async move {
            let segments = &ctx.event.message.0;
            let Some(first) = segments.first() else {
                return false;
            };
            if first.kind != "text" {
                return false;
            }
            let Some(first_text) = first.data.get("text") else {
                return false;
            };
            let Some(cmd_text) = first_text.strip_prefix(command_prefix.as_str()) else {
                return false;
            };
            match cmd_text.strip_prefix(name.as_str()) {
                Some(rest) => {
                    let mut arg = rest.trim_start().to_string();
                    if segments.len() > 1 {
                        arg.push_str(&crate::event::Message(segments[1..].to_vec()).extract_plain_text());
                    }
                    ctx_state_set(&ctx, "args", StateValue::Text(arg));
                    true
                }
                None => false,
            }
        })
    })
}

/// Matches a compiled regex against the plain text; captures are stored
/// as `ctx.state["regex_matched"]` (a list, index 0 is the whole match).
pub fn regex(pattern: &str) -> Result<Rule, regex::Error> {
    let re = Regex::new(pattern)?;
    Ok(rule(move |ctx| {
        let re = re.clone();
        Box::pin(async move {
            let text = ctx.extract_plain_text();
            match re.captures(&text) {
                Some(caps) => {
                    let groups: Vec<Option<String>> =
                        caps.iter().map(|m| m.map(|m| m.as_str().to_string())).collect();
                    ctx_state_set(&ctx, "regex_matched", StateValue::Regex(groups));
                    true
                }
                None => false,
            }
        })
    }))
}

pub fn keyword(words: Vec<String>) -> Rule {
    rule(move |ctx| {
        let words = words.clone();
        Box::pin(async move {
            let text = ctx.extract_plain_text();
            let hit: Vec<String> = words.into_iter().filter(|w| text.contains(w.as_str())).collect();
            if hit.is_empty() {
                false
            } else {
                ctx_state_set(&ctx, "keyword", StateValue::TextList(hit));
                true
            }
        })
    })
}

pub fn full_match(options: Vec<String>) -> Rule {
    rule(move |ctx| {
        let options = options.clone();
        Box::pin(async move {
            let text = ctx.extract_plain_text();
            if options.iter().any(|o| o == &text) {
                ctx_state_set(&ctx, "matched", StateValue::Text(text));
                true
            } else {
                false
            }
        })
    })
}

/// Matches when the message's first segment is a `reply` targeting
/// `target`: its `id` is compared as a parsed integer first, falling
/// back to a raw CRC-64/ISO checksum of the id string. Ports
/// `rules.go::ReplyRule`.
pub fn reply(target: crate::event::MessageId) -> Rule {
    rule(move |ctx| {
        let target = target.clone();
        Box::pin(async move {
            let Some(first) = ctx.event.message.0.first() else {
                return false;
            };
            if first.kind != "reply" {
                return false;
            }
            let Some(id) = first.data.get("id") else {
                return false;
            };
            if let Ok(parsed) = id.parse::<i64>() {
                return crate::event::MessageId::Integer(parsed) == target;
            }
            crate::event::MessageId::Integer(crate::pipeline::hash_reply_id(id)) == target
        })
    })
}

pub fn superuser_permission(config: Config) -> Rule {
    rule(move |ctx| {
        let superuser = config.is_superuser(ctx.event.user_id);
        Box::pin(async move { superuser })
    })
}

pub fn admin_permission() -> Rule {
    rule(|ctx| {
        Box::pin(async move {
            ctx.event
                .sender
                .as_ref()
                .map(|s| s.role == "admin" || s.role == "owner")
                .unwrap_or(false)
        })
    })
}

pub fn owner_permission() -> Rule {
    rule(|ctx| Box::pin(async move { ctx.event.sender.as_ref().map(|s| s.role == "owner").unwrap_or(false) }))
}

/// Superuser, admin, or owner — ports `rules.go::UserOrGrpAdmin`.
pub fn user_or_group_admin(config: Config) -> Rule {
    rule(move |ctx| {
        let is_su = config.is_superuser(ctx.event.user_id);
        let is_admin = ctx
            .event
            .sender
            .as_ref()
            .map(|s| s.role == "admin" || s.role == "owner")
            .unwrap_or(false);
        Box::pin(async move { is_su || is_admin })
    })
}

/// Permission level, low to high: member < admin < owner < superuser.
fn permission_level(config: &Config, user_id: i64, role: &str) -> u8 {
    if config.is_superuser(user_id) {
        3
    } else if role == "owner" {
        2
    } else if role == "admin" {
        1
    } else {
        0
    }
}

/// True when the acting sender outranks `target`, breaking
/// superuser-vs-superuser ties by `Config::first_superuser`'s scan order
/// (see `SPEC_FULL.md` §9). Ports `rules.go::GroupHigherPermission`.
pub fn group_higher_permission(config: Config, target_role: impl Fn(&Ctx) -> (i64, String) + Send + Sync + 'static) -> Rule {
    rule(move |ctx| {
        let config = config.clone();
        let (target_id, target_role_str) = target_role(&ctx);
        let sender_id = ctx.event.user_id;
        let sender_role = ctx.event.sender.as_ref().map(|s| s.role.clone()).unwrap_or_default();
        Box::pin(async move {
            if sender_id == target_id {
                return false;
            }
            let sender_level = permission_level(&config, sender_id, &sender_role);
            let target_level = permission_level(&config, target_id, &target_role_str);
            if sender_level == 3 && target_level == 3 {
                return config.first_superuser(&[sender_id, target_id]) == Some(sender_id);
            }
            sender_level > target_level
        })
    })
}

/// Prompts for a picture if the current event doesn't carry one, then
/// waits up to 120 seconds for the next matching message from the same
/// session. Ports `rules.go::MustProvidePicture`.
pub fn must_provide_picture(registry: Arc<crate::matcher::MatcherRegistry>) -> Rule {
    rule(move |ctx| {
        let registry = registry.clone();
        Box::pin(async move {
            if ctx.event.message.has_segment("image") {
                return true;
            }

            let prompt = ApiRequest::new(
                "send_msg",
                serde_json::json!({
                    "message_type": if ctx.event.is_private() { "private" } else { "group" },
                    "user_id": ctx.event.user_id,
                    "group_id": ctx.event.group_id,
                    "message": "请发送一张图片",
                }),
            );
            if ctx.call_api(prompt).await.is_err() {
                return false;
            }

            let group_id = ctx.event.group_id;
            let user_id = ctx.event.user_id;
            let waiter = crate::future_event::wait_for(&registry, "message", 999, true, move |next_ctx| {
                let same_session = next_ctx.event.user_id == user_id && next_ctx.event.group_id == group_id;
                same_session && next_ctx.event.message.has_segment("image")
            });

            match tokio::time::timeout(std::time::Duration::from_secs(120), waiter).await {
                Ok(Ok(next)) => {
                    if let Some(v) = next.get_state("image_url") {
                        ctx_state_set(&ctx, "image_url", v);
                    }
                    true
                }
                _ => false,
            }
        })
    })
}

/// Parses `ctx.state["args"]` (as left by [`command`]/[`prefix`]) as a
/// shell-quoted argument line and binds it into `T` via `clap`. A parse
/// failure — bad quoting or a flag `T` doesn't recognize — fails the rule
/// rather than the matcher's chain, matching `shell.Parse` followed by
/// `flag.FlagSet.Parse`'s early `return` on error in
/// `examples/original_source/example/command/main.go`. On success the
/// bound value is stashed at `ctx.state["shell"]` as JSON, readable back
/// with `Ctx::get_shell`.
pub fn shell<T>() -> Rule
where
    T: clap::Parser + serde::Serialize + Send + Sync + 'static,
{
    rule(|ctx| {
        Box::pin(async move {
            let args = ctx
                .get_state("args")
                .and_then(|v| v.as_text().map(|s| s.to_string()))
                .unwrap_or_default();
            let tokens = match shell_words::split(&args) {
                Ok(tokens) => tokens,
                Err(_) => return false,
            };
            let argv = std::iter::once("shell".to_string()).chain(tokens);
            let parsed = match <T as clap::Parser>::try_parse_from(argv) {
                Ok(parsed) => parsed,
                Err(_) => return false,
            };
            match serde_json::to_value(&parsed) {
                Ok(json) => {
                    ctx_state_set(&ctx, "shell", StateValue::Json(json));
                    true
                }
                Err(_) => false,
            }
        })
    })
}

fn ctx_state_set(ctx: &Arc<Ctx>, key: &str, value: StateValue) {
    ctx.set_state(key, value);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::ApiCallerDyn;
    use crate::event::Event;
    use crate::matcher::{Matcher, TypeRule};

    struct NullCaller;
    impl crate::driver::ApiCaller for NullCaller {
        async fn call_api(&self, _request: ApiRequest) -> crate::error::Result<crate::driver::ApiResponse> {
            Ok(crate::driver::ApiResponse::default())
        }
    }

    fn test_ctx(text: &str) -> Arc<Ctx> {
        let mut event = Event {
            time: 0,
            self_id: 1,
            post_type: "message".into(),
            message_type: "private".into(),
            notice_type: String::new(),
            request_type: String::new(),
            meta_event_type: String::new(),
            sub_type: String::new(),
            user_id: 42,
            group_id: None,
            guild_id: None,
            channel_id: None,
            target_id: None,
            tiny_id: None,
            message_id: None,
            raw_message: text.into(),
            message: crate::event::Message(vec![crate::event::MessageSegment::text(text)]),
            sender: None,
            detail_type: "private".into(),
            is_to_me: true,
            raw: serde_json::Value::Null,
        };
        event.detail_type = "private".into();
        let caller: Arc<dyn ApiCallerDyn> = Arc::new(NullCaller);
        let matcher = Arc::new(Matcher::new(TypeRule::Message, vec![], None));
        Arc::new(Ctx::new(event, caller, matcher))
    }

    #[tokio::test]
    async fn command_rule_matches_and_strips_prefix() {
        let r = command("/", "echo");
        let ctx = test_ctx("/echo hi there");
        assert!(r(ctx.clone()).await);
        let args = ctx.get_state("args").unwrap();
        assert_eq!(args.as_text(), Some("hi there"));
    }

    #[tokio::test]
    async fn command_rule_rejects_other_text() {
        let r = command("/", "echo");
        let ctx = test_ctx("hello");
        assert!(!r(ctx).await);
    }

    #[tokio::test]
    async fn command_rule_honors_configured_prefix() {
        let r = command("!", "echo");
        let ctx = test_ctx("/echo hi");
        assert!(!r(ctx.clone()).await);
        let ctx2 = test_ctx("!echo hi");
        assert!(r(ctx2).await);
    }

    #[tokio::test]
    async fn prefix_rule_ignores_leading_non_text_segment() {
        let mut event = Event {
            time: 0,
            self_id: 1,
            post_type: "message".into(),
            message_type: "private".into(),
            notice_type: String::new(),
            request_type: String::new(),
            meta_event_type: String::new(),
            sub_type: String::new(),
            user_id: 42,
            group_id: None,
            guild_id: None,
            channel_id: None,
            target_id: None,
            tiny_id: None,
            message_id: None,
            raw_message: String::new(),
            message: crate::event::Message(vec![
                crate::event::MessageSegment::at("1"),
                crate::event::MessageSegment::text("/x hi"),
            ]),
            sender: None,
            detail_type: "private".into(),
            is_to_me: true,
            raw: serde_json::Value::Null,
        };
        event.detail_type = "private".into();
        let caller: Arc<dyn ApiCallerDyn> = Arc::new(NullCaller);
        let matcher = Arc::new(Matcher::new(TypeRule::Message, vec![], None));
        let ctx = Arc::new(Ctx::new(event, caller, matcher));

        assert!(!prefix("/")(ctx).await);
    }

    #[tokio::test]
    async fn prefix_rule_sets_prefix_and_args_keys() {
        let ctx = test_ctx("/x hi");
        assert!(prefix("/")(ctx.clone()).await);
        assert_eq!(ctx.get_state("prefix").unwrap().as_text(), Some("/"));
        assert_eq!(ctx.get_state("args").unwrap().as_text(), Some("x hi"));
    }

    #[tokio::test]
    async fn suffix_rule_sets_suffix_and_args_keys() {
        let ctx = test_ctx("hi!");
        assert!(suffix("!")(ctx.clone()).await);
        assert_eq!(ctx.get_state("suffix").unwrap().as_text(), Some("!"));
        assert_eq!(ctx.get_state("args").unwrap().as_text(), Some("hi"));
    }

    #[tokio::test]
    async fn only_private_matches_private_events() {
        let ctx = test_ctx("hi");
        assert!(only_private()(ctx).await);
    }

    #[tokio::test]
    async fn reply_rule_matches_only_targeted_message() {
        let reply_segment = crate::event::MessageSegment {
            kind: "reply".to_string(),
            data: std::collections::HashMap::from([("id".to_string(), "123".to_string())]),
        };
        let mut event = Event {
            time: 0,
            self_id: 1,
            post_type: "message".into(),
            message_type: "private".into(),
            notice_type: String::new(),
            request_type: String::new(),
            meta_event_type: String::new(),
            sub_type: String::new(),
            user_id: 42,
            group_id: None,
            guild_id: None,
            channel_id: None,
            target_id: None,
            tiny_id: None,
            message_id: None,
            raw_message: String::new(),
            message: crate::event::Message(vec![reply_segment, crate::event::MessageSegment::text("hi")]),
            sender: None,
            detail_type: "private".into(),
            is_to_me: true,
            raw: serde_json::Value::Null,
        };
        event.detail_type = "private".into();
        let caller: Arc<dyn ApiCallerDyn> = Arc::new(NullCaller);
        let matcher = Arc::new(Matcher::new(TypeRule::Message, vec![], None));
        let ctx = Arc::new(Ctx::new(event, caller, matcher));

        assert!(reply(crate::event::MessageId::Integer(123))(ctx.clone()).await);
        assert!(!reply(crate::event::MessageId::Integer(456))(ctx).await);
    }

    #[derive(clap::Parser, serde::Serialize, serde::Deserialize)]
    #[command(name = "github")]
    struct GithubArgs {
        #[arg(short = 'o', default_value = "wdvxdr1123")]
        owner: String,
        #[arg(short = 'r', default_value = "ZeroBot")]
        repo: String,
    }

    #[tokio::test]
    async fn shell_rule_binds_flags_from_args_state() {
        let ctx = test_ctx("/github -o torvalds -r linux");
        assert!(command("/", "github")(ctx.clone()).await);
        assert!(shell::<GithubArgs>()(ctx.clone()).await);
        let parsed: GithubArgs = ctx.get_shell().unwrap();
        assert_eq!(parsed.owner, "torvalds");
        assert_eq!(parsed.repo, "linux");
    }

    #[tokio::test]
    async fn shell_rule_fails_on_unknown_flag() {
        let ctx = test_ctx("/github --nonsense");
        assert!(command("/", "github")(ctx.clone()).await);
        assert!(!shell::<GithubArgs>()(ctx).await);
    }
}
