//! Named presets over [`Command`](crate::Command).
//!
//! Every builder takes the ambient [`CommandContext`](crate::CommandContext),
//! a handler and caller options; the preset then overrides the concurrency
//! fields it is about.

mod action;
mod query;
mod save;

pub use action::{action, background};
pub use query::{
    auto_query, query, query_from_signal, query_from_source, query_from_stream, query_interdependent,
};
pub use save::{FormGroup, FormSource, save_action};
