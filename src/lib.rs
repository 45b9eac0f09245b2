//! Core event-dispatch and plugin-control runtime for OneBot v11 bots.
//!
//! A [`Runtime`] owns the matcher registry, the engine registrar, and the
//! control manager — the single-value restructuring of what the original
//! implementation kept as several independent package-level globals (see
//! `DESIGN.md`).

pub mod config;
pub mod context;
pub mod control;
pub mod dispatcher;
pub mod driver;
pub mod engine;
pub mod error;
pub mod event;
pub mod future_event;
pub mod matcher;
pub mod pipeline;
pub mod rule;

pub use error::{Error, Result};

use crate::config::Config;
use crate::control::ControlManager;
use crate::driver::{ApiCallerDyn, DriverDyn, EventSink};
use crate::engine::{Engine, Registrar, ServiceOptions};
use crate::matcher::MatcherRegistry;
use crate::pipeline::TriggeredMessages;
use std::sync::Arc;
use tracing::{info, warn};

/// The runtime's owned state: matcher registry, service registrar,
/// control manager, config, and the triggered-message TTL map.
pub struct Runtime {
    pub registry: Arc<MatcherRegistry>,
    pub registrar: Arc<Registrar>,
    pub control: Arc<ControlManager>,
    pub config: Config,
    triggered: Arc<TriggeredMessages>,
    drivers: std::sync::Mutex<Vec<Arc<dyn DriverDyn>>>,
}

impl Runtime {
    pub async fn new(config: Config) -> Result<Self> {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .connect(&format!("sqlite://{}?mode=rwc", config.db_path.display()))
            .await?;
        let control = ControlManager::new(pool).await?;
        Ok(Self {
            registry: Arc::new(MatcherRegistry::new()),
            registrar: Arc::new(Registrar::new()),
            control: Arc::new(control),
            config,
            triggered: Arc::new(TriggeredMessages::new()),
            drivers: std::sync::Mutex::new(Vec::new()),
        })
    }

    /// Registers a service engine and its control-layer tables in one
    /// step (`newEngine` + `NewControl` in the original).
    pub async fn register(&self, service: impl Into<String>, mut options: ServiceOptions) -> Result<Arc<Engine>> {
        let service = service.into();
        self.control
            .register_service(&service, options.default_disable)
            .await?;
        if options.command_prefix.is_none() {
            options.command_prefix = Some(self.config.command_prefix.clone());
        }
        let engine = self.registrar.register(&service, options);

        engine.use_pre_handler(rule::custom(move |ctx: Arc<context::Ctx>| {
            Box::pin(async move { ctx.event.user_id != ctx.event.self_id || !ctx.event.is_message() })
        }));

        let control_for_gate = self.control.clone();
        let gate_service = engine.service.clone();
        engine.use_pre_handler(rule::custom(move |ctx: Arc<context::Ctx>| {
            let control = control_for_gate.clone();
            let service = gate_service.clone();
            Box::pin(async move {
                let gid = ctx.event.group_id.unwrap_or(0);
                let enabled = control.is_enabled(&service, gid).await.unwrap_or(true);
                let banned = control
                    .is_banned(&service, ctx.event.user_id, gid)
                    .await
                    .unwrap_or(false);
                enabled && !banned
            })
        }));

        Ok(engine)
    }

    pub fn add_driver(&self, driver: Arc<dyn DriverDyn>) {
        self.drivers.lock().unwrap().push(driver);
    }

    /// Dispatches a single already-decoded payload through the pipeline
    /// and dispatcher. Exposed directly for drivers that want to bypass
    /// `run`/`run_and_block`'s channel plumbing (tests, embedders).
    pub async fn process_payload(&self, payload: &[u8], caller: Arc<dyn ApiCallerDyn>) {
        let event = match pipeline::normalize(payload, &self.config) {
            Ok(event) => event,
            Err(err) => {
                warn!(error = %err, "dropping malformed event payload");
                return;
            }
        };

        if self.config.mark_message {
            if let Some(mid) = &event.message_id {
                let request = driver::ApiRequest::new(
                    "mark_msg_as_read",
                    serde_json::json!({ "message_id": message_id_json(mid) }),
                );
                let _ = caller.call_api(request).await;
            }
        }

        dispatcher::dispatch(
            event,
            caller,
            &self.registry,
            &self.registrar,
            self.triggered.clone(),
            self.config.max_process_time,
        )
        .await;
    }

    /// Connects every registered driver and listens. All but the last
    /// driver run on a spawned task; the last blocks the caller, matching
    /// `RunAndBlock`'s driver-list loop.
    pub async fn run_and_block(self: Arc<Self>, preblock: impl FnOnce() + Send + 'static) -> Result<()> {
        let drivers = self.drivers.lock().unwrap().clone();
        let Some((last, rest)) = drivers.split_last() else {
            warn!("run_and_block called with no drivers registered");
            return Ok(());
        };

        for driver in rest {
            driver.connect().await?;
            let (sink, mut receiver) = EventSink::new();
            let runtime = self.clone();
            tokio::spawn({
                let driver = driver.clone();
                async move {
                    if let Err(err) = driver.listen(sink).await {
                        warn!(error = %err, "driver listen loop exited");
                    }
                }
            });
            tokio::spawn(async move {
                while let Some((payload, caller)) = receiver.recv().await {
                    runtime.process_payload(&payload, caller).await;
                }
            });
        }

        last.connect().await?;
        let (sink, mut receiver) = EventSink::new();
        let runtime = self.clone();
        let listen_handle = tokio::spawn({
            let last = last.clone();
            async move { last.listen(sink).await }
        });

        preblock();
        info!("runtime entering blocking listen loop");

        while let Some((payload, caller)) = receiver.recv().await {
            runtime.process_payload(&payload, caller).await;
        }

        listen_handle.await.map_err(|e| anyhow::anyhow!(e))??;
        Ok(())
    }

    pub async fn get_triggered_messages(&self, inbound: event::MessageId) -> Vec<event::MessageId> {
        self.triggered.get(&inbound).await
    }
}

fn message_id_json(mid: &event::MessageId) -> serde_json::Value {
    match mid {
        event::MessageId::Integer(i) => serde_json::Value::from(*i),
        event::MessageId::Str(s) => serde_json::Value::from(s.clone()),
    }
}
