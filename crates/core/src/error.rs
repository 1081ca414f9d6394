//! Error model shared by every command.

use std::sync::Arc;

use thiserror::Error;

/// Result type used by handlers and hooks.
pub type CommandResult<T> = Result<T, CommandError>;

/// Failure of a single command invocation.
///
/// `CommandError` is cheap to clone: the same value is stored as the command's
/// last error, broadcast to every error subscriber and returned to the caller
/// of `trigger_async`. Arbitrary failures are carried as a shared
/// [`anyhow::Error`].
#[derive(Debug, Clone, Error)]
pub enum CommandError {
    /// A trigger arrived while the command was busy and the caller asked for
    /// an error instead of a silent abort.
    #[error("command already running")]
    AlreadyRunning,

    /// A save-gated action was triggered while its form was invalid.
    #[error("form is invalid: {0}")]
    InvalidForm(String),

    /// The handler (or one of its hooks) failed.
    #[error("{0}")]
    Failed(Arc<anyhow::Error>),
}

impl CommandError {
    pub fn failed(err: impl Into<anyhow::Error>) -> Self {
        Self::Failed(Arc::new(err.into()))
    }

    pub fn msg(msg: impl core::fmt::Display + core::fmt::Debug + Send + Sync + 'static) -> Self {
        Self::Failed(Arc::new(anyhow::Error::msg(msg)))
    }

    pub fn invalid_form(msg: impl Into<String>) -> Self {
        Self::InvalidForm(msg.into())
    }

    pub fn is_already_running(&self) -> bool {
        matches!(self, Self::AlreadyRunning)
    }

    /// Attempt to downcast the wrapped failure to a concrete error type.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: core::fmt::Display + core::fmt::Debug + Send + Sync + 'static,
    {
        match self {
            Self::Failed(inner) => inner.downcast_ref::<E>(),
            _ => None,
        }
    }
}

impl From<anyhow::Error> for CommandError {
    fn from(value: anyhow::Error) -> Self {
        Self::Failed(Arc::new(value))
    }
}

/// Configuration and construction errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A configuration value could not be interpreted.
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    /// A configuration document could not be parsed.
    #[error("malformed configuration: {0}")]
    Malformed(String),

    /// Commands need an async runtime to drive deferred work.
    #[error("no async runtime available: {0}")]
    NoRuntime(String),
}

impl ConfigError {
    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn invalid_value(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.into(),
            value: value.into(),
        }
    }
}
