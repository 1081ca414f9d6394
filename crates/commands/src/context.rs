//! Ambient services every command is built within.

use std::future::Future;
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use reflex_core::{CancelController, CancelSignal, CommandConfig, ConfigError};

use crate::status::{NoopStatusSink, StatusSink};

/// Parameter object handed to every builder.
///
/// Cloning is cheap; clones share the same scope, so disposing one disposes
/// them all.
#[derive(Clone)]
pub struct CommandContext {
    runtime: Handle,
    status: Arc<dyn StatusSink>,
    config: Arc<CommandConfig>,
    scope: CancelController,
}

impl core::fmt::Debug for CommandContext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CommandContext")
            .field("config", &self.config)
            .field("disposed", &self.scope.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl CommandContext {
    pub fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            status: Arc::new(NoopStatusSink),
            config: Arc::new(CommandConfig::default()),
            scope: CancelController::new(),
        }
    }

    /// Context bound to the runtime of the calling task.
    pub fn current() -> Result<Self, ConfigError> {
        let runtime = Handle::try_current().map_err(|e| ConfigError::NoRuntime(e.to_string()))?;
        Ok(Self::new(runtime))
    }

    pub fn with_status_sink(mut self, sink: Arc<dyn StatusSink>) -> Self {
        self.status = sink;
        self
    }

    pub fn with_config(mut self, config: CommandConfig) -> Self {
        self.config = Arc::new(config);
        self
    }

    pub fn config(&self) -> &CommandConfig {
        &self.config
    }

    pub fn status_sink(&self) -> &Arc<dyn StatusSink> {
        &self.status
    }

    pub fn runtime(&self) -> &Handle {
        &self.runtime
    }

    /// Fires when the scope is disposed.
    pub fn scope(&self) -> CancelSignal {
        self.scope.signal()
    }

    pub fn is_disposed(&self) -> bool {
        self.scope.is_cancelled()
    }

    /// End the scope. Reactive listeners started from this context stop;
    /// commands themselves stay usable.
    pub fn dispose(&self) {
        if self.scope.cancel() {
            tracing::debug!("command scope disposed");
        }
    }

    pub(crate) fn spawn<F>(&self, fut: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.runtime.spawn(fut)
    }

    /// Spawn a listener that stops when the scope is disposed.
    pub(crate) fn spawn_scoped<F>(&self, fut: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let scope = self.scope();
        self.runtime.spawn(async move {
            tokio::select! {
                _ = scope.cancelled() => {}
                _ = fut => {}
            }
        })
    }
}
