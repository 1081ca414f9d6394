//! `reflex-core`: foundation building blocks for commands.
//!
//! This crate contains the primitives every other crate agrees on: the error
//! model, identifiers, cooperative cancellation and configuration.

pub mod cancel;
pub mod config;
pub mod error;
pub mod id;

pub use cancel::{CancelController, CancelSignal};
pub use config::CommandConfig;
pub use error::{CommandError, CommandResult, ConfigError};
pub use id::CommandId;
