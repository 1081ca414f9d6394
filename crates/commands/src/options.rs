//! Command and trigger configuration.
//!
//! `CommandOptions` is fixed when a command is built. `TriggerOptions` travel
//! with a single trigger.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use reflex_core::{CancelSignal, CommandId};

/// What happens when a command is triggered while an invocation is in flight.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConcurrencyPolicy {
    /// Drop the new trigger.
    #[default]
    Ignore,
    /// Queue the new trigger behind the running one; only the most recent
    /// queued trigger survives.
    WaitForRunning,
    /// Cancel the running invocation and start the new one.
    CancelRunning,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConcurrentTriggerBehavior {
    #[serde(rename = "type")]
    pub policy: ConcurrencyPolicy,

    /// While busy, a trigger whose args equal the running args is answered
    /// with the current result instead of being arbitrated.
    pub only_when_params_changed: bool,
}

impl ConcurrentTriggerBehavior {
    pub fn new(policy: ConcurrencyPolicy) -> Self {
        Self {
            policy,
            only_when_params_changed: false,
        }
    }

    pub fn only_when_params_changed(mut self) -> Self {
        self.only_when_params_changed = true;
        self
    }
}

/// How a trigger that will not run resolves.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WhenNotTriggered {
    /// Resolve with `Outcome::Aborted`.
    #[default]
    #[serde(alias = "return-undefined")]
    ReturnAborted,
    /// Resolve with the last known result.
    ReturnLastResult,
    /// Fail with `CommandError::AlreadyRunning`.
    ThrowError,
}

/// Options handed through to the status sink.
///
/// The command itself only merges these; their meaning belongs to whoever
/// presents progress and errors.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StatusOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub show_busy: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub show_error: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl StatusOptions {
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_show_busy(mut self, show: bool) -> Self {
        self.show_busy = Some(show);
        self
    }

    pub fn with_show_error(mut self, show: bool) -> Self {
        self.show_error = Some(show);
        self
    }

    /// `overrides` wins field by field; `extra` maps are merged key by key.
    pub fn merge(&self, overrides: &StatusOptions) -> StatusOptions {
        let mut extra = self.extra.clone();
        extra.extend(overrides.extra.clone());
        StatusOptions {
            label: overrides.label.clone().or_else(|| self.label.clone()),
            show_busy: overrides.show_busy.or(self.show_busy),
            show_error: overrides.show_error.or(self.show_error),
            success_message: overrides
                .success_message
                .clone()
                .or_else(|| self.success_message.clone()),
            error_message: overrides
                .error_message
                .clone()
                .or_else(|| self.error_message.clone()),
            extra,
        }
    }
}

/// Immutable configuration of a command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CommandOptions {
    /// When `true`, cancelling also signals the handler and drops its stream;
    /// otherwise the command only stops observing the invocation.
    pub is_cancellable: bool,
    pub concurrent_trigger_behavior: ConcurrentTriggerBehavior,
    /// Default for triggers that do not set their own behaviour.
    #[serde(rename = "whenNotTriggeredBehavior")]
    pub when_not_triggered: WhenNotTriggered,
    pub status: StatusOptions,
}

impl CommandOptions {
    pub fn cancellable(mut self, cancellable: bool) -> Self {
        self.is_cancellable = cancellable;
        self
    }

    pub fn with_policy(mut self, policy: ConcurrencyPolicy) -> Self {
        self.concurrent_trigger_behavior.policy = policy;
        self
    }

    pub fn with_concurrent_trigger_behavior(mut self, behavior: ConcurrentTriggerBehavior) -> Self {
        self.concurrent_trigger_behavior = behavior;
        self
    }

    pub fn with_when_not_triggered(mut self, behavior: WhenNotTriggered) -> Self {
        self.when_not_triggered = behavior;
        self
    }

    pub fn with_status(mut self, status: StatusOptions) -> Self {
        self.status = status;
        self
    }
}

/// Per-trigger settings.
#[derive(Debug, Clone, Default)]
pub struct TriggerOptions {
    /// External cancellation: already cancelled means the trigger is a no-op,
    /// cancelling later cancels the invocation it started.
    pub signal: Option<CancelSignal>,
    pub when_not_triggered: Option<WhenNotTriggered>,
    /// Do not report this invocation to the status sink.
    pub suppress_status: bool,
    /// Merged over the command's status options for this invocation.
    pub status: Option<StatusOptions>,
    /// Command on whose behalf this trigger runs.
    pub origin: Option<CommandId>,
}

impl TriggerOptions {
    pub fn with_signal(mut self, signal: CancelSignal) -> Self {
        self.signal = Some(signal);
        self
    }

    pub fn with_when_not_triggered(mut self, behavior: WhenNotTriggered) -> Self {
        self.when_not_triggered = Some(behavior);
        self
    }

    pub fn suppress_status(mut self) -> Self {
        self.suppress_status = true;
        self
    }

    pub fn with_status(mut self, status: StatusOptions) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_origin(mut self, origin: CommandId) -> Self {
        self.origin = Some(origin);
        self
    }
}
