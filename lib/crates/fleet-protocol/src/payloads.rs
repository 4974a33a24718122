use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::envelope::PROTOCOL_VERSION;

/// Operating mode of a router agent.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum AgentMode {
    /// All commands are honoured.
    #[default]
    Managed,
    /// Telemetry only; mutating commands are refused.
    Monitor,
}

impl AgentMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Managed => "managed",
            Self::Monitor => "monitor",
        }
    }
}

impl fmt::Display for AgentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AgentMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "managed" => Ok(Self::Managed),
            "monitor" => Ok(Self::Monitor),
            other => Err(format!(
                "invalid mode '{other}': expected managed or monitor"
            )),
        }
    }
}

/// Outcome of applying a configuration section.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ApplyStatus {
    Applied,
    Rejected,
    Error,
}

/// Outcome of an EXEC, REBOOT or UPGRADE command.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExecStatus {
    Ok,
    Failed,
    Timeout,
    Error,
}

/// Machine-readable code carried by an `ERROR` frame.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    UnknownType,
    InvalidPayload,
    UnexpectedDirection,
    NotAuthenticated,
    AlreadyAuthenticated,
    Internal,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

/// Payload of kinds that carry nothing (`PING`, `PONG`, `STATUS_REQUEST`, `STATUS_OK`).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Empty {}

/// First frame an agent sends after the socket upgrade.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Auth {
    pub device_id: String,
    pub api_key: String,
    pub firmware_version: String,
    #[serde(default = "default_protocol_version")]
    pub protocol_version: u32,
    #[serde(default)]
    pub mode: AgentMode,
}

impl fmt::Debug for Auth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Auth")
            .field("device_id", &self.device_id)
            .field("api_key", &"<redacted>")
            .field("firmware_version", &self.firmware_version)
            .field("protocol_version", &self.protocol_version)
            .field("mode", &self.mode)
            .finish()
    }
}

fn default_protocol_version() -> u32 {
    PROTOCOL_VERSION
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthOk {
    pub server_time: DateTime<Utc>,
    #[serde(default = "default_protocol_version")]
    pub protocol_version: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthFail {
    pub error: String,
}

/// Apply one configuration section (`firewall`, `dhcp`, `dns`, `wifi`, `vpn`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConfigPush {
    pub command_id: String,
    pub section: String,
    pub config: Value,
}

/// Replace the full managed configuration, one entry per section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConfigFull {
    pub command_id: String,
    pub sections: BTreeMap<String, Value>,
}

/// Per-section outcome inside a `CONFIG_FULL` result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SectionOutcome {
    pub status: ApplyStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<String>,
    #[serde(default)]
    pub changed: bool,
}

/// Body of both `CONFIG_ACK` and `CONFIG_FAIL`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConfigResult {
    pub command_id: String,
    pub status: ApplyStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<String>,
    /// Whether any firmware state was modified.
    #[serde(default)]
    pub changed: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub sections: BTreeMap<String, SectionOutcome>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecRequest {
    pub command_id: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_exec_timeout")]
    pub timeout_secs: u64,
}

fn default_exec_timeout() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecResult {
    pub command_id: String,
    pub status: ExecStatus,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub duration_ms: u64,
}

impl ExecResult {
    /// Result carrying only a diagnostic, used for refusals and local failures.
    #[must_use]
    pub fn error(command_id: &str, status: ExecStatus, message: impl Into<String>) -> Self {
        Self {
            command_id: command_id.to_string(),
            status,
            exit_code: None,
            stdout: String::new(),
            stderr: message.into(),
            duration_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RebootRequest {
    pub command_id: String,
    #[serde(default)]
    pub delay_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpgradeRequest {
    pub command_id: String,
    pub url: String,
    /// Expected SHA-256 of the image, lowercase hex.
    pub sha256: String,
    #[serde(default = "default_true")]
    pub keep_config: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModeUpdate {
    pub command_id: String,
    pub mode: AgentMode,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModeAck {
    pub command_id: String,
    pub mode: AgentMode,
    pub status: ApplyStatus,
}

/// Free-form telemetry object (`STATUS`, `METRICS`).
///
/// The hub caches these verbatim; only the agent knows their shape.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct Telemetry(pub Map<String, Value>);

impl Telemetry {
    /// Build a telemetry object from any struct that serializes to a JSON object.
    pub fn from_serializable<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        match serde_json::to_value(value)? {
            Value::Object(map) => Ok(Self(map)),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                Ok(Self(map))
            }
        }
    }

    #[must_use]
    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Alert {
    pub severity: AlertSeverity,
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
    /// Id of the frame this error answers, when there is one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ref_id: Option<String>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn auth_debug_redacts_api_key() {
        let auth = Auth {
            device_id: "d1".to_string(),
            api_key: "super-secret".to_string(),
            firmware_version: "23.05.2".to_string(),
            protocol_version: 1,
            mode: AgentMode::Managed,
        };
        let rendered = format!("{auth:?}");
        assert!(!rendered.contains("super-secret"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn auth_defaults_protocol_version_and_mode() {
        let auth: Auth = serde_json::from_value(json!({
            "device_id": "d1",
            "api_key": "k1",
            "firmware_version": "1.0"
        }))
        .unwrap();
        assert_eq!(auth.protocol_version, PROTOCOL_VERSION);
        assert_eq!(auth.mode, AgentMode::Managed);
    }

    #[test]
    fn exec_request_defaults_timeout_and_args() {
        let req: ExecRequest =
            serde_json::from_value(json!({"command_id": "cmd-1", "command": "uptime"})).unwrap();
        assert_eq!(req.timeout_secs, 30);
        assert!(req.args.is_empty());
    }

    #[test]
    fn upgrade_keeps_config_unless_told_otherwise() {
        let req: UpgradeRequest = serde_json::from_value(json!({
            "command_id": "cmd-1",
            "url": "https://fw.example.com/img.bin",
            "sha256": "ab"
        }))
        .unwrap();
        assert!(req.keep_config);
    }

    #[test]
    fn config_result_omits_empty_sections() {
        let result = ConfigResult {
            command_id: "cmd-1".to_string(),
            status: ApplyStatus::Applied,
            diagnostic: None,
            changed: false,
            sections: BTreeMap::new(),
        };
        let value = serde_json::to_value(&result).unwrap();
        assert!(value.get("sections").is_none());
        assert!(value.get("diagnostic").is_none());
    }

    #[test]
    fn exec_status_timeout_is_lowercase_on_the_wire() {
        assert_eq!(
            serde_json::to_string(&ExecStatus::Timeout).unwrap(),
            "\"timeout\""
        );
    }

    #[test]
    fn agent_mode_parses_case_insensitively() {
        assert_eq!("MONITOR".parse::<AgentMode>(), Ok(AgentMode::Monitor));
        assert!("readonly".parse::<AgentMode>().is_err());
    }

    #[test]
    fn telemetry_wraps_non_object_values() {
        let telemetry = Telemetry::from_serializable(&42).unwrap();
        assert_eq!(telemetry.into_value(), json!({"value": 42}));
    }

    #[test]
    fn telemetry_is_transparent() {
        let telemetry: Telemetry =
            serde_json::from_value(json!({"uptime_secs": 10, "wan": {"up": true}})).unwrap();
        assert_eq!(
            serde_json::to_value(&telemetry).unwrap(),
            json!({"uptime_secs": 10, "wan": {"up": true}})
        );
    }
}
