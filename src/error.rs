//! Top-level error types.

use thiserror::Error;

/// Crate-wide result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error enum wrapping domain-specific errors.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Control(#[from] ControlError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("missing required config key: {0}")]
    MissingKey(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Control-layer (per-service enable/ban/response) errors.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("service {0:?} is not registered")]
    UnknownService(String),

    #[error("gid 0 is reserved for the global default and cannot be reset or individually banned")]
    ReservedGroup,

    #[error("no extra tag registered for service {0:?}")]
    UnregisteredExtra(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Event-pipeline normalization errors.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("failed to decode event payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("event carried neither an integer nor string message id")]
    MissingMessageId,
}

/// Dispatcher execution errors.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("rule or handler task panicked: {0}")]
    Panicked(String),

    #[error("processing exceeded the configured deadline")]
    DeadlineExceeded,
}
