//! Configuration loading and validation.

use crate::error::{ConfigError, Result};
use anyhow::Context as _;
use std::time::Duration;

/// Runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Bot's self-reported nickname; stripped as an alternative to an
    /// `@self` segment when deciding whether a message is to-me.
    pub nickname: Vec<String>,

    /// Required leading token for `CommandRule`, e.g. `/`.
    pub command_prefix: String,

    /// Superusers, in priority order. Order matters for
    /// [`Config::first_superuser`]'s tie-break scan.
    pub super_users: Vec<i64>,

    /// Ring buffer length for ring-mode ingestion. `0` selects direct mode.
    pub ring_len: usize,

    /// Latency applied before processing a ring slot (ring mode) or an
    /// inbound payload (direct mode).
    pub latency: Duration,

    /// Per-event deadline. Resettable via `NoTimeout`.
    pub max_process_time: Duration,

    /// Whether to call a mark-as-read API action before dispatch.
    pub mark_message: bool,

    /// Path to the control-layer SQLite database.
    pub db_path: std::path::PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            nickname: Vec::new(),
            command_prefix: "/".to_string(),
            super_users: Vec::new(),
            ring_len: 0,
            latency: Duration::from_millis(0),
            max_process_time: Duration::from_secs(240),
            mark_message: false,
            db_path: std::path::PathBuf::from("ctrl.db"),
        }
    }
}

impl Config {
    /// Start building a `Config` from defaults.
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Load configuration from environment variables, falling back to
    /// defaults for anything unset.
    pub fn load() -> Result<Self> {
        let mut cfg = Self::default();

        if let Ok(raw) = std::env::var("COREBOT_NICKNAME") {
            cfg.nickname = raw.split(',').map(|s| s.trim().to_string()).collect();
        }

        if let Ok(raw) = std::env::var("COREBOT_COMMAND_PREFIX") {
            cfg.command_prefix = raw;
        }

        if let Ok(raw) = std::env::var("COREBOT_SUPERUSERS") {
            cfg.super_users = raw
                .split(',')
                .filter_map(|s| s.trim().parse::<i64>().ok())
                .collect();
        }

        if let Ok(raw) = std::env::var("COREBOT_RING_LEN") {
            cfg.ring_len = raw
                .parse()
                .map_err(|_| ConfigError::Invalid("COREBOT_RING_LEN must be a non-negative integer".into()))?;
        }

        if let Ok(raw) = std::env::var("COREBOT_LATENCY_MS") {
            let ms: u64 = raw
                .parse()
                .map_err(|_| ConfigError::Invalid("COREBOT_LATENCY_MS must be a non-negative integer".into()))?;
            cfg.latency = Duration::from_millis(ms);
        }

        if let Ok(raw) = std::env::var("COREBOT_MAX_PROCESS_TIME_SECS") {
            let secs: u64 = raw.parse().map_err(|_| {
                ConfigError::Invalid("COREBOT_MAX_PROCESS_TIME_SECS must be a non-negative integer".into())
            })?;
            cfg.max_process_time = Duration::from_secs(secs);
        }

        if let Ok(raw) = std::env::var("COREBOT_MARK_MESSAGE") {
            cfg.mark_message = matches!(raw.as_str(), "1" | "true" | "yes");
        }

        if let Ok(raw) = std::env::var("COREBOT_DB_PATH") {
            cfg.db_path = std::path::PathBuf::from(raw);
        }

        if let Some(parent) = cfg.db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create db directory: {}", parent.display()))?;
        }

        Ok(cfg)
    }

    /// Returns the first of `ids` that appears in `super_users`, scanning
    /// `super_users` in its configured order (not the order of `ids`).
    pub fn first_superuser(&self, ids: &[i64]) -> Option<i64> {
        self.super_users.iter().find(|su| ids.contains(su)).copied()
    }

    pub fn is_superuser(&self, id: i64) -> bool {
        self.super_users.contains(&id)
    }
}

/// Builder for programmatic `Config` construction (tests, embedders).
#[derive(Debug, Clone, Default)]
pub struct ConfigBuilder {
    cfg: Config,
}

impl ConfigBuilder {
    pub fn nickname(mut self, names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.cfg.nickname = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn command_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.cfg.command_prefix = prefix.into();
        self
    }

    pub fn super_users(mut self, ids: impl IntoIterator<Item = i64>) -> Self {
        self.cfg.super_users = ids.into_iter().collect();
        self
    }

    pub fn ring_len(mut self, len: usize) -> Self {
        self.cfg.ring_len = len;
        self
    }

    pub fn latency(mut self, latency: Duration) -> Self {
        self.cfg.latency = latency;
        self
    }

    pub fn max_process_time(mut self, d: Duration) -> Self {
        self.cfg.max_process_time = d;
        self
    }

    pub fn mark_message(mut self, v: bool) -> Self {
        self.cfg.mark_message = v;
        self
    }

    pub fn db_path(mut self, path: impl Into<std::path::PathBuf>) -> Self {
        self.cfg.db_path = path.into();
        self
    }

    pub fn build(self) -> Config {
        self.cfg
    }
}
