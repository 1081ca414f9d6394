//! Status collaborator.
//!
//! Every invocation (unless suppressed) is handed to a [`StatusSink`] together
//! with the merged [`StatusOptions`]. How progress, toasts or errors are shown
//! is entirely up to the sink; the command only guarantees a well-ordered
//! event stream that ends right after `Completed`.

use std::sync::Mutex;

use futures::stream::{self, BoxStream, StreamExt};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use reflex_core::{CommandError, CommandId};
use reflex_events::{CommandEnvelope, CommandEvent, CompletionKind, Subscription};

use crate::options::StatusOptions;

/// Type-erased lifecycle event of one invocation.
#[derive(Debug, Clone)]
pub enum StatusEvent {
    Busy(bool),
    /// The handler produced a value.
    Result,
    Error(CommandError),
    Completed(CompletionKind),
}

/// One invocation reported to the sink.
pub struct StatusRegistration {
    pub command_id: CommandId,
    pub invocation: u64,
    pub options: StatusOptions,
    /// Ends after [`StatusEvent::Completed`].
    pub events: BoxStream<'static, StatusEvent>,
}

impl core::fmt::Debug for StatusRegistration {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("StatusRegistration")
            .field("command_id", &self.command_id)
            .field("invocation", &self.invocation)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl StatusRegistration {
    /// Build a registration from a subscription taken before the invocation
    /// published anything.
    pub(crate) fn from_subscription<A, T>(
        command_id: CommandId,
        invocation: u64,
        options: StatusOptions,
        subscription: Subscription<CommandEnvelope<A, T>>,
    ) -> Self
    where
        A: Clone + Send + Sync + 'static,
        T: Clone + Send + Sync + 'static,
    {
        let source = subscription.into_stream();
        let events = stream::unfold(Some(source), move |source| async move {
            let mut source = source?;
            while let Some(envelope) = source.next().await {
                if envelope.invocation() != invocation {
                    continue;
                }
                let event = match envelope.into_payload() {
                    CommandEvent::Triggered { .. } => continue,
                    CommandEvent::Busy(busy) => StatusEvent::Busy(busy),
                    CommandEvent::Result(_) => StatusEvent::Result,
                    CommandEvent::Error(err) => StatusEvent::Error(err),
                    CommandEvent::Completed(kind) => {
                        return Some((StatusEvent::Completed(kind), None));
                    }
                };
                return Some((event, Some(source)));
            }
            None
        })
        .boxed();

        Self {
            command_id,
            invocation,
            options,
            events,
        }
    }
}

/// Receives invocations to present to the user.
pub trait StatusSink: Send + Sync + 'static {
    fn register(&self, registration: StatusRegistration);
}

/// Discards every registration.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStatusSink;

impl StatusSink for NoopStatusSink {
    fn register(&self, _registration: StatusRegistration) {}
}

/// Renders invocation status as log records.
#[derive(Debug, Clone)]
pub struct TracingStatusSink {
    runtime: Handle,
}

impl TracingStatusSink {
    pub fn new(runtime: Handle) -> Self {
        Self { runtime }
    }
}

impl StatusSink for TracingStatusSink {
    fn register(&self, registration: StatusRegistration) {
        let StatusRegistration {
            command_id,
            invocation,
            options,
            mut events,
        } = registration;
        let label = options.label.unwrap_or_else(|| command_id.to_string());
        let show_busy = options.show_busy.unwrap_or(true);
        let show_error = options.show_error.unwrap_or(true);
        let error_message = options.error_message.unwrap_or_else(|| "failed".to_string());
        let success_message = options.success_message;

        self.runtime.spawn(async move {
            while let Some(event) = events.next().await {
                match event {
                    StatusEvent::Busy(true) if show_busy => {
                        debug!(command = %label, invocation, "working");
                    }
                    StatusEvent::Error(err) if show_error => {
                        warn!(command = %label, invocation, error = %err, "{error_message}");
                    }
                    StatusEvent::Completed(CompletionKind::Succeeded) => {
                        if let Some(message) = success_message.as_deref() {
                            info!(command = %label, invocation, "{message}");
                        }
                    }
                    _ => {}
                }
            }
        });
    }
}

/// Collects registrations for inspection (tests/dev).
#[derive(Debug, Default)]
pub struct InMemoryStatusSink {
    inner: Mutex<Vec<StatusRegistration>>,
}

impl InMemoryStatusSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove and return everything registered so far.
    pub fn take(&self) -> Vec<StatusRegistration> {
        std::mem::take(&mut *self.inner.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

impl StatusSink for InMemoryStatusSink {
    fn register(&self, registration: StatusRegistration) {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(registration);
    }
}
