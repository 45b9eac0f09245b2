//! A minimal plugin exercising the runtime end to end: registers an
//! `echo` command that replies with its argument. Not part of the crate's
//! public API — a worked example, mirroring the shape of
//! `examples/original_source/example/command/main.go`.

use corebot::config::Config;
use corebot::engine::ServiceOptions;
use corebot::matcher::Matcher;
use corebot::rule;
use corebot::Runtime;
use std::sync::Arc;

#[tokio::main]
async fn main() -> corebot::Result<()> {
    tracing_subscriber::fmt::init();

    let config = Config::builder()
        .nickname(["bot"])
        .super_users([10000])
        .db_path("demos-echo.db")
        .build();

    let runtime = Arc::new(Runtime::new(config).await?);
    let engine = runtime
        .register(
            "echo",
            ServiceOptions {
                brief: Some("echoes back whatever you say".into()),
                public_data_folder: Some("Echo".into()),
                ..Default::default()
            },
        )
        .await?;

    let handler = rule::handler(|ctx| {
        Box::pin(async move {
            let arg = ctx
                .get_state("args")
                .and_then(|v| v.as_text().map(|s| s.to_string()))
                .unwrap_or_default();
            let _ = ctx
                .call_api(corebot::driver::ApiRequest::new(
                    "send_msg",
                    serde_json::json!({
                        "message_type": if ctx.event.is_private() { "private" } else { "group" },
                        "user_id": ctx.event.user_id,
                        "group_id": ctx.event.group_id,
                        "message": arg,
                    }),
                ))
                .await;
        })
    });

    let bare = engine.on_command(&runtime.registry, "echo", vec![]);
    let wired = Arc::new(
        Matcher::new(bare.r#type, bare.rules.clone(), bare.engine.clone()).with_handler(handler),
    );
    wired.set_priority(engine.priority);
    runtime.registry.delete(bare.id);
    runtime.registry.store(wired);

    println!("registered {} matcher(s) under service {:?}", runtime.registry.len(), engine.service);
    Ok(())
}
