//! Shared request / response types for the fleet hub device API.
//!
//! These are the only shapes the CRUD layer sees. The live socket and the
//! actor's internal state never cross this boundary.

use chrono::{DateTime, Utc};
use fleet_protocol::{AgentMode, Command, CommandKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Read-only view of one device: `GET /devices/{id}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceSnapshot {
    pub device: DeviceInfo,
    pub connection: ConnectionView,
    /// Last STATUS payload, verbatim.
    pub status: Option<Value>,
    /// Last METRICS payload, verbatim.
    pub metrics: Option<Value>,
}

/// Registry facts about a device. Never includes key material.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceInfo {
    pub device_id: String,
    pub owner_id: String,
    pub revoked: bool,
}

/// Connection facts held by the device actor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionView {
    /// An authenticated socket is bound right now.
    pub ready: bool,
    /// Ready, or last seen within the liveness window.
    pub online: bool,
    pub authenticated: bool,
    pub protocol_version: Option<u32>,
    pub firmware_version: Option<String>,
    pub mode: Option<AgentMode>,
    pub last_seen: Option<DateTime<Utc>>,
    pub connected_since: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    /// Commands not yet terminal (pending or sent).
    pub pending_commands: usize,
}

/// Body of `POST /devices/{id}/commands`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DispatchRequest {
    pub kind: CommandKind,
    #[serde(default)]
    pub payload: Value,
    /// Expiry in seconds; the hub default applies when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_secs: Option<u64>,
}

/// Body of a successful dispatch or a command lookup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandResponse {
    pub command: Command,
}

/// JSON error body for every non-2xx response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApiErrorBody {
    pub error: String,
    /// Present when a command was created but could not be kept.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_id: Option<String>,
}

impl ApiErrorBody {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            command_id: None,
        }
    }
}
