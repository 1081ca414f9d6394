//! Command lifecycle events and their broadcast channel.

pub mod bus;
pub mod channel;
pub mod envelope;
pub mod event;
pub mod in_memory_bus;

pub use bus::{EventBus, Subscription};
pub use channel::{BusySubscription, CommandEnvelope, ResultChannel};
pub use envelope::EventEnvelope;
pub use event::{CommandEvent, CompletionKind};
pub use in_memory_bus::InMemoryEventBus;
