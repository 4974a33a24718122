//! Wire protocol spoken between router agents and the fleet hub.
//!
//! Every frame is a JSON text message `{id, type, payload}`. The `type`
//! string is decoded exactly once, at the socket boundary, into [`Message`];
//! nothing past the boundary dispatches on strings.

pub mod command;
pub mod config;
pub mod envelope;
pub mod payloads;
pub mod store_keys;

pub use command::{Command, CommandError, CommandKind, CommandOutcome, CommandStatus};
pub use config::{agent_ws_url, defaults};
pub use envelope::{
    DecodeError, Direction, Envelope, Frame, Message, MessageKind, PROTOCOL_VERSION, generate_id,
};
pub use store_keys::{
    command_key, device_key, events_key, keys, limits, snapshot_key, ttl, validate_command_id,
    validate_device_id,
};
pub use payloads::*;
