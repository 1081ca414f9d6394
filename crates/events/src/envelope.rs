use chrono::{DateTime, Utc};
use uuid::Uuid;

use reflex_core::CommandId;

/// Envelope around one event published by a command.
///
/// Notes:
/// - `invocation` numbers start at 1 and increase by one per accepted trigger.
/// - `sequence_number` increases by one per published event of the command,
///   so subscribers can detect gaps after lagging.
/// - `payload` is the event itself.
#[derive(Debug, Clone, PartialEq)]
pub struct EventEnvelope<E> {
    event_id: Uuid,
    command_id: CommandId,

    invocation: u64,

    /// Monotonically increasing position in the command's event stream.
    sequence_number: u64,

    occurred_at: DateTime<Utc>,

    payload: E,
}

impl<E> EventEnvelope<E> {
    pub fn new(command_id: CommandId, invocation: u64, sequence_number: u64, payload: E) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            command_id,
            invocation,
            sequence_number,
            occurred_at: Utc::now(),
            payload,
        }
    }

    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    pub fn command_id(&self) -> CommandId {
        self.command_id
    }

    pub fn invocation(&self) -> u64 {
        self.invocation
    }

    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn payload(&self) -> &E {
        &self.payload
    }

    pub fn into_payload(self) -> E {
        self.payload
    }
}
