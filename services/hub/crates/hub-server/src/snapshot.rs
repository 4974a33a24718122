//! Durable per-device state and its versioned hibernation snapshot.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use fleet_protocol::{AgentMode, Command};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StoreError;

/// Bump when a field changes meaning. Added optional fields do not need a bump.
pub const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

/// Everything the hub knows about one device. Owned by that device's actor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionState {
    pub device_id: String,
    #[serde(default)]
    pub authenticated: bool,
    #[serde(default)]
    pub protocol_version: Option<u32>,
    #[serde(default)]
    pub firmware_version: Option<String>,
    #[serde(default)]
    pub mode: Option<AgentMode>,
    #[serde(default)]
    pub last_status: Option<Value>,
    #[serde(default)]
    pub last_metrics: Option<Value>,
    /// Non-terminal commands in dispatch order.
    #[serde(default)]
    pub pending_commands: VecDeque<Command>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
}

impl ConnectionState {
    #[must_use]
    pub fn new(device_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            device_id: device_id.to_string(),
            authenticated: false,
            protocol_version: None,
            firmware_version: None,
            mode: None,
            last_status: None,
            last_metrics: None,
            pending_commands: VecDeque::new(),
            created_at: now,
            last_seen: None,
        }
    }
}

/// Serialized form written to the store before an actor suspends.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Snapshot {
    pub schema_version: u32,
    #[serde(flatten)]
    pub state: ConnectionState,
}

#[derive(Deserialize)]
struct SchemaProbe {
    #[serde(default)]
    schema_version: u32,
}

impl Snapshot {
    #[must_use]
    pub fn capture(state: &ConnectionState) -> Self {
        Self {
            schema_version: SNAPSHOT_SCHEMA_VERSION,
            state: state.clone(),
        }
    }

    pub fn encode(&self) -> Result<String, StoreError> {
        serde_json::to_string(self).map_err(StoreError::Encode)
    }

    /// Decode a stored snapshot. `key` only labels errors.
    ///
    /// Snapshots from a newer schema are refused rather than misread.
    pub fn decode(key: &str, text: &str) -> Result<Self, StoreError> {
        let corrupt = |source| StoreError::Corrupt {
            key: key.to_string(),
            source,
        };
        let probe: SchemaProbe = serde_json::from_str(text).map_err(corrupt)?;
        if probe.schema_version > SNAPSHOT_SCHEMA_VERSION {
            return Err(StoreError::UnsupportedSchema {
                found: probe.schema_version,
                supported: SNAPSHOT_SCHEMA_VERSION,
            });
        }
        serde_json::from_str(text).map_err(corrupt)
    }

    /// State to resume from. No socket survives a hibernation, so the
    /// restored state is never authenticated.
    #[must_use]
    pub fn into_state(self) -> ConnectionState {
        let mut state = self.state;
        state.authenticated = false;
        state
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::Duration;
    use fleet_protocol::CommandKind;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        "2026-05-04T10:00:00Z".parse().unwrap()
    }

    fn populated() -> ConnectionState {
        let mut state = ConnectionState::new("d1", now());
        state.authenticated = true;
        state.protocol_version = Some(1);
        state.last_status = Some(json!({"uptime_secs": 3600, "wan": {"ip": "100.64.0.7", "up": true}}));
        state.last_metrics = Some(json!({"load": [0.12, 0.2, 0.5], "mem_free_kb": 41234}));
        for cmd in ["uptime", "df"] {
            state.pending_commands.push_back(
                Command::new(
                    CommandKind::Exec,
                    json!({"command": cmd}),
                    Duration::minutes(5),
                    now(),
                )
                .unwrap(),
            );
        }
        state.last_seen = Some(now());
        state
    }

    #[test]
    fn snapshot_restores_cached_state_exactly() {
        let state = populated();
        let text = Snapshot::capture(&state).encode().unwrap();
        let restored = Snapshot::decode("k", &text).unwrap().into_state();

        assert_eq!(restored.last_status, state.last_status);
        assert_eq!(restored.last_metrics, state.last_metrics);
        assert_eq!(restored.pending_commands, state.pending_commands);
        assert_eq!(restored.protocol_version, Some(1));
    }

    #[test]
    fn restored_state_is_never_authenticated() {
        let text = Snapshot::capture(&populated()).encode().unwrap();
        let restored = Snapshot::decode("k", &text).unwrap().into_state();
        assert!(!restored.authenticated);
    }

    #[test]
    fn snapshot_is_flat_on_the_wire() {
        let value: Value =
            serde_json::from_str(&Snapshot::capture(&populated()).encode().unwrap()).unwrap();
        assert_eq!(value["schema_version"], SNAPSHOT_SCHEMA_VERSION);
        assert_eq!(value["device_id"], "d1");
        assert_eq!(value["pending_commands"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn newer_schema_is_refused() {
        let text = r#"{"schema_version": 99, "device_id": "d1", "created_at": "2026-05-04T10:00:00Z"}"#;
        let err = Snapshot::decode("fleet:snapshot:d1", text).expect_err("must refuse");
        assert!(matches!(
            err,
            StoreError::UnsupportedSchema { found: 99, .. }
        ));
    }

    #[test]
    fn older_snapshot_fills_missing_fields() {
        let text = r#"{"schema_version": 1, "device_id": "d1", "created_at": "2026-05-04T10:00:00Z"}"#;
        let state = Snapshot::decode("k", text).unwrap().into_state();
        assert!(state.pending_commands.is_empty());
        assert!(state.last_status.is_none());
        assert!(state.mode.is_none());
    }

    #[test]
    fn garbage_is_reported_as_corrupt() {
        let err = Snapshot::decode("fleet:snapshot:d1", "{{nope").expect_err("corrupt");
        assert!(matches!(err, StoreError::Corrupt { ref key, .. } if key == "fleet:snapshot:d1"));
        assert!(!err.is_transient());
    }
}
