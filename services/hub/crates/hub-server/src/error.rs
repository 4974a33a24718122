use fleet_protocol::{Command, CommandError};
use thiserror::Error;

/// Failure talking to durable storage (snapshots, command records, registry, events).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("corrupt record at {key}: {source}")]
    Corrupt {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("snapshot schema {found} is newer than supported schema {supported}")]
    UnsupportedSchema { found: u32, supported: u32 },

    #[error("failed to encode record: {0}")]
    Encode(#[source] serde_json::Error),
}

impl StoreError {
    /// Whether retrying the same call may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Backend(_))
    }
}

/// Failure reaching or using a device actor.
#[derive(Debug, Error)]
pub enum HubError {
    #[error("invalid device id: {0}")]
    InvalidDeviceId(&'static str),

    #[error("hub is shutting down")]
    ShuttingDown,

    #[error("device actor stopped before replying")]
    ActorStopped,

    #[error("device state unavailable: {0}")]
    StateUnavailable(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Why a command could not be accepted into a device queue.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("command payload rejected: {0}")]
    Invalid(#[from] CommandError),

    #[error("command queue is full ({depth} commands outstanding)")]
    QueueFull { depth: usize },

    /// The command was created but the queue write failed; it is now `Failed`.
    #[error("command {} could not be queued: {source}", command.command_id)]
    Storage {
        command: Box<Command>,
        #[source]
        source: StoreError,
    },

    #[error(transparent)]
    Hub(#[from] HubError),
}
