/// Valkey key prefixes for hub state
pub mod keys {
    /// Hibernation snapshot of one device actor
    /// Format: fleet:snapshot:{device_id}
    /// Value: JSON-serialized Snapshot
    /// TTL: None (destroyed only on device deletion)
    pub const SNAPSHOT: &str = "fleet:snapshot";

    /// Terminal command records for CRUD polling
    /// Format: fleet:command:{device_id}:{command_id}
    /// Value: JSON-serialized Command
    /// TTL: ttl::COMMAND_RECORD_SECS
    pub const COMMAND: &str = "fleet:command";

    /// Device registry entry (hash)
    /// Format: fleet:device:{device_id}
    /// Fields: owner_id, api_key_sha256, revoked
    pub const DEVICE: &str = "fleet:device";

    /// Agent LOG / ALERT log (sorted set scored by receive time)
    /// Format: fleet:events:{device_id}
    /// Value: JSON-serialized event, trimmed to limits::EVENT_STREAM_MAXLEN
    pub const EVENTS: &str = "fleet:events";
}

/// TTL constants
pub mod ttl {
    /// Terminal command records (24 hours)
    pub const COMMAND_RECORD_SECS: u64 = 86400;

    /// Default command expiry when the caller gives none (1 hour)
    pub const DEFAULT_COMMAND_SECS: u64 = 3600;

    /// Longest expiry a caller may request (7 days)
    pub const MAX_COMMAND_SECS: u64 = 604_800;

    /// Hard ceiling an operator may raise the longest expiry to (365 days)
    pub const CEILING_COMMAND_SECS: u64 = 31_536_000;
}

/// Size limits shared by both sides
pub mod limits {
    /// Queued (pending) commands per device
    pub const MAX_QUEUE_DEPTH: usize = 100;

    /// Largest text frame accepted on the socket
    pub const MAX_FRAME_BYTES: usize = 256 * 1024;

    /// Entries kept per device event stream
    pub const EVENT_STREAM_MAXLEN: u64 = 1000;

    /// Captured stdout / stderr per EXEC stream
    pub const MAX_OUTPUT_BYTES: usize = 64 * 1024;

    /// Longest device id
    pub const MAX_DEVICE_ID_LEN: usize = 64;
}

/// Helper functions for key construction
pub fn snapshot_key(device_id: &str) -> String {
    format!("{}:{}", keys::SNAPSHOT, device_id)
}

pub fn command_key(device_id: &str, command_id: &str) -> String {
    format!("{}:{}:{}", keys::COMMAND, device_id, command_id)
}

pub fn device_key(device_id: &str) -> String {
    format!("{}:{}", keys::DEVICE, device_id)
}

pub fn events_key(device_id: &str) -> String {
    format!("{}:{}", keys::EVENTS, device_id)
}

/// Validate a device id: 1-64 characters of `[A-Za-z0-9_-]`.
/// SECURITY: Always call before constructing Valkey keys from untrusted input.
/// Prevents oversized keys and namespace injection through `:` (CWE-20).
pub fn validate_device_id(device_id: &str) -> Result<(), &'static str> {
    if device_id.is_empty() {
        return Err("device_id must not be empty");
    }
    if device_id.len() > limits::MAX_DEVICE_ID_LEN {
        return Err("device_id must be at most 64 characters");
    }
    if !device_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err("device_id may only contain [A-Za-z0-9_-]");
    }
    Ok(())
}

/// Validate a command id: `cmd-` followed by 16 lowercase hex characters.
pub fn validate_command_id(command_id: &str) -> Result<(), &'static str> {
    if command_id.len() != 20 {
        return Err("command_id must be exactly 20 characters");
    }
    if !command_id.starts_with("cmd-") {
        return Err("command_id must start with 'cmd-'");
    }
    if !command_id[4..]
        .chars()
        .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
    {
        return Err("command_id suffix must be lowercase hex [a-f0-9]");
    }
    Ok(())
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// ids drawn from the allowed alphabet always validate
        #[test]
        fn prop_valid_alphabet_accepted(id in "[A-Za-z0-9_-]{1,64}") {
            prop_assert!(validate_device_id(&id).is_ok());
        }

        /// any id containing a key separator is refused
        #[test]
        fn prop_separator_rejected(prefix in "[a-z0-9]{0,20}", suffix in "[a-z0-9]{0,20}") {
            let id = format!("{prefix}:{suffix}");
            prop_assert!(validate_device_id(&id).is_err());
        }
    }
}
