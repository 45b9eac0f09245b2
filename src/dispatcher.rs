//! Per-event dispatch: scans the matcher snapshot, runs each candidate's
//! pre→rules→mid→handler→post chain with a panic-isolated deadline race.
//!
//! Ports `examples/original_source/bot.go`'s `processMatchers`,
//! `gorule`/`gohandler`, and `processRule`/`processHandler`.

use crate::context::Ctx;
use crate::driver::{ApiCallerDyn, CapturingApiCaller};
use crate::engine::Registrar;
use crate::event::Event;
use crate::matcher::{Matcher, MatcherRegistry};
use crate::pipeline::TriggeredMessages;
use crate::rule::{Handler, Rule};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

/// Runs one event through the full matcher snapshot.
pub async fn dispatch(
    event: Event,
    caller: Arc<dyn ApiCallerDyn>,
    registry: &MatcherRegistry,
    registrar: &Registrar,
    triggered: Arc<TriggeredMessages>,
    deadline: Duration,
) {
    let caller: Arc<dyn ApiCallerDyn> = if let Some(mid) = event.message_id.clone() {
        Arc::new(CapturingApiCaller::new(caller, triggered, mid))
    } else {
        caller
    };

    let snapshot = registry.snapshot();
    for matcher in snapshot.iter() {
        if !matcher.r#type.matches(&event.post_type) {
            continue;
        }

        let engine = matcher
            .engine
            .as_ref()
            .and_then(|name| registrar.get(name));

        let ctx = Arc::new(Ctx::new(event.clone(), caller.clone(), matcher.clone()));

        let (matched, abort) = run_matcher(&ctx, matcher, engine.as_deref(), deadline).await;

        if matched && matcher.is_temp() {
            registry.delete(matcher.id);
        }

        if matched && (matcher.is_block() || ctx.wants_block()) {
            break;
        }

        if abort {
            break;
        }
    }
}

/// Runs a single matcher's full chain against an already-built `Ctx`.
/// Returns `(matched, abort_dispatch)`: `matched` is whether the
/// matcher's rules (and therefore its handler) ran; `abort_dispatch` is
/// set when the matcher's own rules rejected the event and the matcher
/// is flagged [`Matcher::breaks_on_false`], in which case the snapshot
/// scan stops entirely instead of moving on to the next matcher.
async fn run_matcher(
    ctx: &Arc<Ctx>,
    matcher: &Arc<Matcher>,
    engine: Option<&crate::engine::Engine>,
    deadline: Duration,
) -> (bool, bool) {
    if let Some(engine) = engine {
        for rule in engine.pre_handlers() {
            if !run_rule(ctx.clone(), rule, deadline).await {
                return (false, false);
            }
        }
    }

    for rule in &matcher.rules {
        if !run_rule(ctx.clone(), rule.clone(), deadline).await {
            return (false, matcher.breaks_on_false());
        }
    }

    if let Some(engine) = engine {
        for rule in engine.mid_handlers() {
            if !run_rule(ctx.clone(), rule, deadline).await {
                return (false, false);
            }
        }
    }

    if let Some(handler) = matcher.handler.clone() {
        run_handler(ctx.clone(), handler, deadline).await;
    }

    if let Some(engine) = engine {
        for handler in engine.post_handlers() {
            run_handler(ctx.clone(), handler, deadline).await;
        }
    }

    (true, false)
}

/// Races a rule's own task against the deadline. A panic is logged and
/// treated as `false`, matching `processRule`'s `recover()` + "treat as
/// failed" behavior. A rule that sets `ctx.no_timeout()` resets the timer
/// instead of aborting, matching `t.Reset(BotConfig.MaxProcessTime)`.
async fn run_rule(ctx: Arc<Ctx>, rule: Rule, deadline: Duration) -> bool {
    let ctx_for_timeout = ctx.clone();
    let task = tokio::spawn(async move { rule(ctx).await });
    race(task, deadline, ctx_for_timeout, "rule").await.unwrap_or(false)
}

/// Same race as `run_rule`, but a handler has no success value to
/// propagate — a panic or deadline just ends this matcher's chain.
async fn run_handler(ctx: Arc<Ctx>, handler: Handler, deadline: Duration) {
    let ctx_for_timeout = ctx.clone();
    let task = tokio::spawn(async move { handler(ctx).await });
    let _ = race(task, deadline, ctx_for_timeout, "handler").await;
}

/// Shared race loop: spawn the task, then select between its completion
/// and a resettable sleep. On elapse with `NoTimeout` set on `ctx`, reset
/// the sleep and keep waiting instead of aborting.
async fn race<T: Send + 'static>(
    mut task: tokio::task::JoinHandle<T>,
    deadline: Duration,
    ctx: Arc<Ctx>,
    kind: &'static str,
) -> Option<T> {
    let mut sleep = Box::pin(tokio::time::sleep(deadline));
    loop {
        tokio::select! {
            result = &mut task => {
                return match result {
                    Ok(v) => Some(v),
                    Err(join_err) => {
                        error!(kind, error = %join_err, "execute {} panicked", kind);
                        None
                    }
                };
            }
            _ = &mut sleep => {
                if ctx.wants_no_timeout() {
                    sleep.set(tokio::time::sleep(deadline));
                    continue;
                }
                warn!(kind, "处理达到最大时延, 退出");
                task.abort();
                return None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::driver::{ApiCaller, ApiRequest, ApiResponse};
    use crate::engine::{Registrar, ServiceOptions};
    use crate::event::{Message, MessageId, MessageSegment};
    use std::sync::Mutex as StdMutex;

    struct RecordingCaller {
        calls: Arc<StdMutex<Vec<ApiRequest>>>,
    }

    impl ApiCaller for RecordingCaller {
        async fn call_api(&self, request: ApiRequest) -> crate::error::Result<ApiResponse> {
            self.calls.lock().unwrap().push(request.clone());
            Ok(ApiResponse {
                status: "ok".into(),
                retcode: 0,
                data: serde_json::json!({ "message_id": 999 }),
            })
        }
    }

    fn private_event(text: &str) -> Event {
        Event {
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
            message_id: Some(MessageId::Integer(1)),
            raw_message: text.into(),
            message: Message(vec![MessageSegment::text(text)]),
            sender: None,
            detail_type: "private".into(),
            is_to_me: true,
            raw: serde_json::Value::Null,
        }
    }

    #[tokio::test]
    async fn echo_command_sends_reply_and_runs_handler() {
        let registry = MatcherRegistry::new();
        let registrar = Registrar::new();
        let engine = registrar.register(
            "echo-test",
            ServiceOptions {
                public_data_folder: Some("EchoTest".into()),
                ..Default::default()
            },
        );

        let calls: Arc<StdMutex<Vec<ApiRequest>>> = Arc::new(StdMutex::new(Vec::new()));
        let calls_for_handler = calls.clone();

        let handler = crate::rule::handler(move |ctx| {
            let calls = calls_for_handler.clone();
            Box::pin(async move {
                let arg = ctx
                    .get_state("args")
                    .and_then(|v| v.as_text().map(|s| s.to_string()))
                    .unwrap_or_default();
                let req = ApiRequest::new(
                    "send_private_msg",
                    serde_json::json!({ "user_id": ctx.event.user_id, "message": arg }),
                );
                let _ = ctx.call_api(req.clone()).await;
                calls.lock().unwrap().push(req);
            })
        });

        let matcher = engine.on_command(&registry, "echo", vec![]);
        let matcher = Arc::new(
            Matcher::new(matcher.r#type, matcher.rules.clone(), matcher.engine.clone()).with_handler(handler),
        );
        matcher.set_priority(engine.priority);
        registry.delete_by_engine("echo-test");
        registry.store(matcher);

        let caller: Arc<dyn ApiCallerDyn> = Arc::new(RecordingCaller { calls: calls.clone() });
        let triggered = Arc::new(TriggeredMessages::new());

        dispatch(
            private_event("/echo hi"),
            caller,
            &registry,
            &registrar,
            triggered,
            Duration::from_secs(5),
        )
        .await;

        let recorded = calls.lock().unwrap();
        assert!(recorded
            .iter()
            .any(|r| r.action == "send_private_msg" && r.params["message"] == "hi"));

        let _ = std::fs::remove_dir_all(&engine.data_folder);
        let _ = Config::default();
    }

    #[tokio::test]
    async fn block_stops_later_matchers_from_running() {
        let registry = MatcherRegistry::new();
        let registrar = Registrar::new();
        let engine = registrar.register(
            "block-test",
            ServiceOptions {
                public_data_folder: Some("BlockTest".into()),
                default_block: true,
                ..Default::default()
            },
        );

        let hit_count = Arc::new(StdMutex::new(0u32));
        let hit_count_a = hit_count.clone();
        let hit_count_b = hit_count.clone();

        let first = engine.on_full_match(
            &registry,
            vec!["hi".to_string()],
            vec![],
        );
        let first = Arc::new(Matcher::new(first.r#type, first.rules.clone(), first.engine.clone()).with_handler(
            crate::rule::handler(move |_ctx| {
                let hit_count = hit_count_a.clone();
                Box::pin(async move {
                    *hit_count.lock().unwrap() += 1;
                })
            }),
        ));
        first.set_priority(1);
        first.set_block(true);

        let second = engine.on_full_match(&registry, vec!["hi".to_string()], vec![]);
        let second = Arc::new(
            Matcher::new(second.r#type, second.rules.clone(), second.engine.clone()).with_handler(
                crate::rule::handler(move |_ctx| {
                    let hit_count = hit_count_b.clone();
                    Box::pin(async move {
                        *hit_count.lock().unwrap() += 1;
                    })
                }),
            ),
        );
        second.set_priority(2);

        registry.delete_by_engine("block-test");
        registry.store(first);
        registry.store(second);

        let caller: Arc<dyn ApiCallerDyn> = Arc::new(RecordingCaller {
            calls: Arc::new(StdMutex::new(Vec::new())),
        });
        let triggered = Arc::new(TriggeredMessages::new());

        dispatch(
            private_event("hi"),
            caller,
            &registry,
            &registrar,
            triggered,
            Duration::from_secs(5),
        )
        .await;

        assert_eq!(*hit_count.lock().unwrap(), 1);
        let _ = std::fs::remove_dir_all(&engine.data_folder);
    }

    #[tokio::test]
    async fn break_on_rule_miss_stops_later_matchers_from_running() {
        let registry = MatcherRegistry::new();
        let registrar = Registrar::new();
        let engine = registrar.register(
            "break-test",
            ServiceOptions {
                public_data_folder: Some("BreakTest".into()),
                ..Default::default()
            },
        );

        let hit_count = Arc::new(StdMutex::new(0u32));
        let hit_count_b = hit_count.clone();

        let first = engine.on_full_match(&registry, vec!["bye".to_string()], vec![]);
        let first = Arc::new(Matcher::new(first.r#type, first.rules.clone(), first.engine.clone()));
        first.set_priority(1);
        first.set_break(true);

        let second = engine.on_full_match(&registry, vec!["hi".to_string()], vec![]);
        let second = Arc::new(
            Matcher::new(second.r#type, second.rules.clone(), second.engine.clone()).with_handler(
                crate::rule::handler(move |_ctx| {
                    let hit_count = hit_count_b.clone();
                    Box::pin(async move {
                        *hit_count.lock().unwrap() += 1;
                    })
                }),
            ),
        );
        second.set_priority(2);

        registry.delete_by_engine("break-test");
        registry.store(first);
        registry.store(second);

        let caller: Arc<dyn ApiCallerDyn> = Arc::new(RecordingCaller {
            calls: Arc::new(StdMutex::new(Vec::new())),
        });
        let triggered = Arc::new(TriggeredMessages::new());

        dispatch(
            private_event("hi"),
            caller,
            &registry,
            &registrar,
            triggered,
            Duration::from_secs(5),
        )
        .await;

        assert_eq!(*hit_count.lock().unwrap(), 0);
        let _ = std::fs::remove_dir_all(&engine.data_folder);
    }
}
