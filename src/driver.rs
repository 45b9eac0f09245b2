//! Driver and API-caller contracts.
//!
//! Mirrors the static-trait / dyn-companion split used throughout this
//! crate's teacher for adapter traits: `async fn` in a trait isn't
//! object-safe, so a boxed-future companion trait plus a blanket impl
//! lets callers hold `Arc<dyn ApiCallerDyn>` while implementors still
//! write plain `async fn`.

use crate::error::Result;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// A single OneBot API request.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub action: String,
    pub params: Value,
}

impl ApiRequest {
    pub fn new(action: impl Into<String>, params: Value) -> Self {
        Self {
            action: action.into(),
            params,
        }
    }
}

/// A OneBot API response.
#[derive(Debug, Clone, Default)]
pub struct ApiResponse {
    pub status: String,
    pub retcode: i64,
    pub data: Value,
}

impl ApiResponse {
    pub fn message_id(&self) -> Option<crate::event::MessageId> {
        let field = self.data.get("message_id")?;
        if let Some(i) = field.as_i64() {
            return Some(crate::event::MessageId::Integer(i));
        }
        field.as_str().map(|s| crate::event::MessageId::Str(s.to_string()))
    }

    pub fn get(&self, pointer: &str) -> Option<&Value> {
        self.data.pointer(pointer)
    }
}

/// Static, type-safe API-caller trait. Implement this for a transport.
pub trait ApiCaller: Send + Sync + 'static {
    fn call_api(&self, request: ApiRequest) -> impl Future<Output = Result<ApiResponse>> + Send;
}

/// Object-safe companion to [`ApiCaller`], for storing heterogeneous
/// callers behind `Arc<dyn ApiCallerDyn>`.
pub trait ApiCallerDyn: Send + Sync + 'static {
    fn call_api<'a>(&'a self, request: ApiRequest) -> Pin<Box<dyn Future<Output = Result<ApiResponse>> + Send + 'a>>;
}

impl<T: ApiCaller> ApiCallerDyn for T {
    fn call_api<'a>(&'a self, request: ApiRequest) -> Pin<Box<dyn Future<Output = Result<ApiResponse>> + Send + 'a>> {
        Box::pin(ApiCaller::call_api(self, request))
    }
}

/// Sink a driver submits raw inbound payloads into, paired with the
/// caller that should be used to reply to events read from this driver.
#[derive(Clone)]
pub struct EventSink {
    sender: tokio::sync::mpsc::UnboundedSender<(Vec<u8>, Arc<dyn ApiCallerDyn>)>,
}

impl EventSink {
    pub fn new() -> (Self, tokio::sync::mpsc::UnboundedReceiver<(Vec<u8>, Arc<dyn ApiCallerDyn>)>) {
        let (sender, receiver) = tokio::sync::mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    pub fn submit(&self, payload: Vec<u8>, caller: Arc<dyn ApiCallerDyn>) {
        let _ = self.sender.send((payload, caller));
    }
}

/// Static, type-safe driver trait. A driver owns a transport connection
/// and feeds raw event payloads into an [`EventSink`].
pub trait Driver: Send + Sync + 'static {
    fn connect(&self) -> impl Future<Output = Result<()>> + Send;
    fn listen(&self, sink: EventSink) -> impl Future<Output = Result<()>> + Send;
}

/// Object-safe companion to [`Driver`].
pub trait DriverDyn: Send + Sync + 'static {
    fn connect<'a>(&'a self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;
    fn listen<'a>(&'a self, sink: EventSink) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;
}

impl<T: Driver> DriverDyn for T {
    fn connect<'a>(&'a self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(Driver::connect(self))
    }

    fn listen<'a>(&'a self, sink: EventSink) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(Driver::listen(self, sink))
    }
}

/// An outbound-call interceptor that records `message_id`s returned by
/// successful calls into the runtime's triggered-message TTL map, keyed
/// by the inbound message that caused this call chain to run.
pub struct CapturingApiCaller {
    inner: Arc<dyn ApiCallerDyn>,
    triggered: Arc<crate::pipeline::TriggeredMessages>,
    inbound: crate::event::MessageId,
}

impl CapturingApiCaller {
    pub fn new(
        inner: Arc<dyn ApiCallerDyn>,
        triggered: Arc<crate::pipeline::TriggeredMessages>,
        inbound: crate::event::MessageId,
    ) -> Self {
        Self {
            inner,
            triggered,
            inbound,
        }
    }
}

impl ApiCaller for CapturingApiCaller {
    async fn call_api(&self, request: ApiRequest) -> Result<ApiResponse> {
        let response = self.inner.call_api(request).await?;
        if let Some(mid) = response.message_id() {
            self.triggered.record(self.inbound.clone(), mid).await;
        }
        Ok(response)
    }
}
