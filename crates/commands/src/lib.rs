//! `reflex-commands`: triggerable, observable async operations.
//!
//! A [`Command`] wraps a handler (sync value, future or stream), tracks its
//! busy/result/error lifecycle, arbitrates concurrent triggers and publishes
//! every transition on its own result channel. [`builders`] provide the usual
//! presets; [`compose`] derives commands from other commands, legacy objects
//! and plain callables.

pub mod builders;
pub mod command;
pub mod compose;
pub mod context;
pub mod handler;
pub mod hooks;
pub mod legacy;
pub mod options;
pub mod signal;
pub mod status;

pub use builders::{
    FormGroup, FormSource, action, auto_query, background, query, query_from_signal, query_from_source,
    query_from_stream, query_interdependent, save_action,
};
pub use command::Command;
pub use compose::{AbstractCommand, CommandInput, from_input, from_input_mapped};
pub use context::CommandContext;
pub use handler::{Handler, HandlerOutput, Outcome, handler};
pub use hooks::{AfterExecute, AfterExecuteHook, BeforeExecuteHook};
pub use legacy::LegacyCommand;
pub use options::{
    CommandOptions, ConcurrencyPolicy, ConcurrentTriggerBehavior, StatusOptions, TriggerOptions,
    WhenNotTriggered,
};
pub use signal::{CommandSignal, from_input_signal};
pub use status::{
    InMemoryStatusSink, NoopStatusSink, StatusEvent, StatusRegistration, StatusSink, TracingStatusSink,
};

pub use reflex_core::{CancelController, CancelSignal, CommandConfig, CommandError, CommandId, CommandResult};
pub use reflex_events::{CommandEvent, CompletionKind};
