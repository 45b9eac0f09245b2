//! Per-dispatch context threaded through rules and handlers.

use crate::driver::{ApiCallerDyn, ApiRequest, ApiResponse};
use crate::event::Event;
use crate::matcher::Matcher;
use std::collections::HashMap;
use std::sync::Arc;

/// A value a rule can stash in [`State`] for downstream rules/handlers to
/// read back. Replaces Go's `any`-typed `State map[string]any`.
#[derive(Debug, Clone)]
pub enum StateValue {
    Text(String),
    TextList(Vec<String>),
    Regex(Vec<Option<String>>),
    Json(serde_json::Value),
}

impl StateValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            StateValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_text_list(&self) -> Option<&[String]> {
        match self {
            StateValue::TextList(v) => Some(v),
            _ => None,
        }
    }
}

pub type State = HashMap<String, StateValue>;

/// Everything a rule or handler needs: the normalized event, the
/// in-flight matcher's mutable scratch state, and a caller to act back
/// through (already wrapped with outbound-capture by the dispatcher).
///
/// Rules receive `Arc<Ctx>` (several may run concurrently as tasks
/// racing a deadline), so `state` is behind a `Mutex` rather than a bare
/// field.
pub struct Ctx {
    pub event: Event,
    state: std::sync::Mutex<State>,
    pub caller: Arc<dyn ApiCallerDyn>,
    pub matcher: Arc<Matcher>,
    no_timeout: std::sync::atomic::AtomicBool,
    block: std::sync::atomic::AtomicBool,
}

impl Ctx {
    pub fn new(event: Event, caller: Arc<dyn ApiCallerDyn>, matcher: Arc<Matcher>) -> Self {
        Self {
            event,
            state: std::sync::Mutex::new(State::new()),
            caller,
            matcher,
            no_timeout: std::sync::atomic::AtomicBool::new(false),
            block: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub async fn call_api(&self, request: ApiRequest) -> crate::error::Result<ApiResponse> {
        self.caller.call_api(request).await
    }

    pub fn extract_plain_text(&self) -> String {
        self.event.message.extract_plain_text()
    }

    pub fn set_state(&self, key: impl Into<String>, value: StateValue) {
        self.state.lock().unwrap().insert(key.into(), value);
    }

    pub fn get_state(&self, key: &str) -> Option<StateValue> {
        self.state.lock().unwrap().get(key).cloned()
    }

    pub fn state_snapshot(&self) -> State {
        self.state.lock().unwrap().clone()
    }

    /// Reads back a value stashed as JSON by [`crate::rule::shell`].
    pub fn get_shell<T: serde::de::DeserializeOwned>(&self) -> Option<T> {
        match self.get_state("shell") {
            Some(StateValue::Json(v)) => serde_json::from_value(v).ok(),
            _ => None,
        }
    }

    /// Resets the dispatcher's deadline timer instead of letting it abort
    /// this matcher's chain. Call from a long-running handler.
    pub fn no_timeout(&self) {
        self.no_timeout.store(true, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn wants_no_timeout(&self) -> bool {
        self.no_timeout.load(std::sync::atomic::Ordering::Relaxed)
    }

    /// Stops the registry scan after this matcher finishes, regardless of
    /// the matcher's own `block` flag.
    pub fn block(&self) {
        self.block.store(true, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn wants_block(&self) -> bool {
        self.block.load(std::sync::atomic::Ordering::Relaxed)
    }
}
