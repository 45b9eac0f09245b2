//! One-shot future-event waiting: register a temporary matcher and
//! resolve a channel the first time it fires.
//!
//! Ports `examples/original_source/iface.go`'s `FutureEvent` declaration
//! and its use at `rules.go::MustProvidePicture`.

use crate::context::Ctx;
use crate::matcher::{Matcher, MatcherRegistry, TypeRule};
use std::sync::Arc;
use tokio::sync::oneshot;

/// Registers a temporary matcher (`temp = once`) on `registry` that
/// resolves once an event matching `predicate` is dispatched to it.
///
/// Awaiting the returned future is equivalent to the original's
/// `NewFutureEvent(...).Next()`; the caller is expected to additionally
/// race it against a deadline with `tokio::time::timeout`, since dropping
/// this future doesn't remove the now-temp matcher until it fires once
/// (same lifecycle as the Go original: a future-event matcher just sits
/// in the registry until it matches).
pub fn wait_for(
    registry: &MatcherRegistry,
    post_type: &str,
    priority: i64,
    once: bool,
    predicate: impl Fn(&Ctx) -> bool + Send + Sync + 'static,
) -> oneshot::Receiver<Arc<Ctx>> {
    let type_rule = match post_type {
        "message" => TypeRule::Message,
        "notice" => TypeRule::Notice,
        "request" => TypeRule::Request,
        _ => TypeRule::MetaEvent,
    };

    let (tx, rx) = oneshot::channel();
    let predicate = Arc::new(predicate);

    let filter: crate::rule::Rule = {
        let predicate = predicate.clone();
        Arc::new(move |ctx: Arc<Ctx>| {
            let predicate = predicate.clone();
            Box::pin(async move { predicate(&ctx) }) as futures::future::BoxFuture<'static, bool>
        })
    };

    let tx = std::sync::Mutex::new(Some(tx));
    let deliver = crate::rule::handler(move |ctx| {
        if let Some(tx) = tx.lock().unwrap().take() {
            let _ = tx.send(ctx);
        }
        Box::pin(async {})
    });

    let matcher = Arc::new(Matcher::new(type_rule, vec![filter], None).with_handler(deliver));
    matcher.set_priority(priority);
    matcher.set_temp(once);
    registry.store(matcher);

    rx
}
