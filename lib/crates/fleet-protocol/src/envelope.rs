//! Message envelope and the closed set of message kinds.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::payloads::{
    Alert, Auth, AuthFail, AuthOk, ConfigFull, ConfigPush, ConfigResult, Empty, ErrorCode,
    ErrorPayload, ExecRequest, ExecResult, LogEntry, ModeAck, ModeUpdate, RebootRequest,
    Telemetry, UpgradeRequest,
};

/// Protocol revision advertised in `AUTH` and echoed in `AUTH_OK`.
pub const PROTOCOL_VERSION: u32 = 1;

// ===================================================================
// Kinds
// ===================================================================

/// Which way a kind is allowed to travel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ToAgent,
    ToCloud,
    Either,
}

/// Every `type` string the protocol knows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    // cloud -> agent
    ConfigPush,
    ConfigFull,
    Exec,
    Reboot,
    Upgrade,
    StatusRequest,
    ModeUpdate,
    StatusOk,
    AuthOk,
    AuthFail,
    // agent -> cloud
    Auth,
    Status,
    ConfigAck,
    ConfigFail,
    ExecResult,
    Log,
    Alert,
    Metrics,
    ModeAck,
    // both
    Ping,
    Pong,
    Error,
}

impl MessageKind {
    pub const ALL: [MessageKind; 22] = [
        Self::ConfigPush,
        Self::ConfigFull,
        Self::Exec,
        Self::Reboot,
        Self::Upgrade,
        Self::StatusRequest,
        Self::Ping,
        Self::ModeUpdate,
        Self::StatusOk,
        Self::AuthOk,
        Self::AuthFail,
        Self::Auth,
        Self::Status,
        Self::ConfigAck,
        Self::ConfigFail,
        Self::ExecResult,
        Self::Log,
        Self::Alert,
        Self::Metrics,
        Self::Pong,
        Self::ModeAck,
        Self::Error,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ConfigPush => "CONFIG_PUSH",
            Self::ConfigFull => "CONFIG_FULL",
            Self::Exec => "EXEC",
            Self::Reboot => "REBOOT",
            Self::Upgrade => "UPGRADE",
            Self::StatusRequest => "STATUS_REQUEST",
            Self::Ping => "PING",
            Self::ModeUpdate => "MODE_UPDATE",
            Self::StatusOk => "STATUS_OK",
            Self::AuthOk => "AUTH_OK",
            Self::AuthFail => "AUTH_FAIL",
            Self::Auth => "AUTH",
            Self::Status => "STATUS",
            Self::ConfigAck => "CONFIG_ACK",
            Self::ConfigFail => "CONFIG_FAIL",
            Self::ExecResult => "EXEC_RESULT",
            Self::Log => "LOG",
            Self::Alert => "ALERT",
            Self::Metrics => "METRICS",
            Self::Pong => "PONG",
            Self::ModeAck => "MODE_ACK",
            Self::Error => "ERROR",
        }
    }

    /// Look up a wire `type` string. Returns `None` for kinds this build does not know.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.as_str() == s)
    }

    #[must_use]
    pub fn direction(self) -> Direction {
        match self {
            Self::ConfigPush
            | Self::ConfigFull
            | Self::Exec
            | Self::Reboot
            | Self::Upgrade
            | Self::StatusRequest
            | Self::ModeUpdate
            | Self::StatusOk
            | Self::AuthOk
            | Self::AuthFail => Direction::ToAgent,
            Self::Auth
            | Self::Status
            | Self::ConfigAck
            | Self::ConfigFail
            | Self::ExecResult
            | Self::Log
            | Self::Alert
            | Self::Metrics
            | Self::ModeAck => Direction::ToCloud,
            // Either side may probe liveness.
            Self::Ping | Self::Pong | Self::Error => Direction::Either,
        }
    }

    /// True when a receiver on the agent side may accept this kind.
    #[must_use]
    pub fn accepted_by_agent(self) -> bool {
        matches!(self.direction(), Direction::ToAgent | Direction::Either)
    }

    /// True when the hub may accept this kind.
    #[must_use]
    pub fn accepted_by_cloud(self) -> bool {
        matches!(self.direction(), Direction::ToCloud | Direction::Either)
    }

    /// Kinds the agent must answer with a result referencing the command id.
    #[must_use]
    pub fn expects_reply(self) -> bool {
        matches!(
            self,
            Self::ConfigPush
                | Self::ConfigFull
                | Self::Exec
                | Self::Reboot
                | Self::Upgrade
                | Self::ModeUpdate
        )
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ===================================================================
// Envelope (raw wire shape)
// ===================================================================

/// The raw `{id, type, payload}` object exactly as it travels.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

// ===================================================================
// Message (decoded sum type)
// ===================================================================

/// A decoded message. One variant per [`MessageKind`].
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    ConfigPush(ConfigPush),
    ConfigFull(ConfigFull),
    Exec(ExecRequest),
    Reboot(RebootRequest),
    Upgrade(UpgradeRequest),
    StatusRequest,
    Ping,
    ModeUpdate(ModeUpdate),
    StatusOk,
    AuthOk(AuthOk),
    AuthFail(AuthFail),
    Auth(Auth),
    Status(Telemetry),
    ConfigAck(ConfigResult),
    ConfigFail(ConfigResult),
    ExecResult(ExecResult),
    Log(LogEntry),
    Alert(Alert),
    Metrics(Telemetry),
    Pong,
    ModeAck(ModeAck),
    Error(ErrorPayload),
}

impl Message {
    #[must_use]
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::ConfigPush(_) => MessageKind::ConfigPush,
            Self::ConfigFull(_) => MessageKind::ConfigFull,
            Self::Exec(_) => MessageKind::Exec,
            Self::Reboot(_) => MessageKind::Reboot,
            Self::Upgrade(_) => MessageKind::Upgrade,
            Self::StatusRequest => MessageKind::StatusRequest,
            Self::Ping => MessageKind::Ping,
            Self::ModeUpdate(_) => MessageKind::ModeUpdate,
            Self::StatusOk => MessageKind::StatusOk,
            Self::AuthOk(_) => MessageKind::AuthOk,
            Self::AuthFail(_) => MessageKind::AuthFail,
            Self::Auth(_) => MessageKind::Auth,
            Self::Status(_) => MessageKind::Status,
            Self::ConfigAck(_) => MessageKind::ConfigAck,
            Self::ConfigFail(_) => MessageKind::ConfigFail,
            Self::ExecResult(_) => MessageKind::ExecResult,
            Self::Log(_) => MessageKind::Log,
            Self::Alert(_) => MessageKind::Alert,
            Self::Metrics(_) => MessageKind::Metrics,
            Self::Pong => MessageKind::Pong,
            Self::ModeAck(_) => MessageKind::ModeAck,
            Self::Error(_) => MessageKind::Error,
        }
    }

    /// Decode a payload for a known kind.
    ///
    /// A JSON `null` payload is treated as `{}` so empty kinds may omit it.
    pub fn from_parts(kind: MessageKind, payload: Value) -> Result<Self, serde_json::Error> {
        let payload = match payload {
            Value::Null => Value::Object(Map::new()),
            other => other,
        };
        let message = match kind {
            MessageKind::ConfigPush => Self::ConfigPush(serde_json::from_value(payload)?),
            MessageKind::ConfigFull => Self::ConfigFull(serde_json::from_value(payload)?),
            MessageKind::Exec => Self::Exec(serde_json::from_value(payload)?),
            MessageKind::Reboot => Self::Reboot(serde_json::from_value(payload)?),
            MessageKind::Upgrade => Self::Upgrade(serde_json::from_value(payload)?),
            MessageKind::StatusRequest => {
                serde_json::from_value::<Empty>(payload)?;
                Self::StatusRequest
            }
            MessageKind::Ping => {
                serde_json::from_value::<Empty>(payload)?;
                Self::Ping
            }
            MessageKind::ModeUpdate => Self::ModeUpdate(serde_json::from_value(payload)?),
            MessageKind::StatusOk => {
                serde_json::from_value::<Empty>(payload)?;
                Self::StatusOk
            }
            MessageKind::AuthOk => Self::AuthOk(serde_json::from_value(payload)?),
            MessageKind::AuthFail => Self::AuthFail(serde_json::from_value(payload)?),
            MessageKind::Auth => Self::Auth(serde_json::from_value(payload)?),
            MessageKind::Status => Self::Status(serde_json::from_value(payload)?),
            MessageKind::ConfigAck => Self::ConfigAck(serde_json::from_value(payload)?),
            MessageKind::ConfigFail => Self::ConfigFail(serde_json::from_value(payload)?),
            MessageKind::ExecResult => Self::ExecResult(serde_json::from_value(payload)?),
            MessageKind::Log => Self::Log(serde_json::from_value(payload)?),
            MessageKind::Alert => Self::Alert(serde_json::from_value(payload)?),
            MessageKind::Metrics => Self::Metrics(serde_json::from_value(payload)?),
            MessageKind::Pong => {
                serde_json::from_value::<Empty>(payload)?;
                Self::Pong
            }
            MessageKind::ModeAck => Self::ModeAck(serde_json::from_value(payload)?),
            MessageKind::Error => Self::Error(serde_json::from_value(payload)?),
        };
        Ok(message)
    }

    /// Serialize the payload half of the message.
    pub fn to_payload(&self) -> Result<Value, serde_json::Error> {
        match self {
            Self::ConfigPush(p) => serde_json::to_value(p),
            Self::ConfigFull(p) => serde_json::to_value(p),
            Self::Exec(p) => serde_json::to_value(p),
            Self::Reboot(p) => serde_json::to_value(p),
            Self::Upgrade(p) => serde_json::to_value(p),
            Self::ModeUpdate(p) => serde_json::to_value(p),
            Self::AuthOk(p) => serde_json::to_value(p),
            Self::AuthFail(p) => serde_json::to_value(p),
            Self::Auth(p) => serde_json::to_value(p),
            Self::Status(p) | Self::Metrics(p) => serde_json::to_value(p),
            Self::ConfigAck(p) | Self::ConfigFail(p) => serde_json::to_value(p),
            Self::ExecResult(p) => serde_json::to_value(p),
            Self::Log(p) => serde_json::to_value(p),
            Self::Alert(p) => serde_json::to_value(p),
            Self::ModeAck(p) => serde_json::to_value(p),
            Self::Error(p) => serde_json::to_value(p),
            Self::StatusRequest | Self::Ping | Self::StatusOk | Self::Pong => {
                Ok(Value::Object(Map::new()))
            }
        }
    }

    /// Build an `ERROR` message answering the frame `ref_id`.
    #[must_use]
    pub fn error(code: ErrorCode, message: impl Into<String>, ref_id: Option<&str>) -> Self {
        Self::Error(ErrorPayload {
            code,
            message: message.into(),
            ref_id: ref_id.map(str::to_string),
        })
    }
}

// ===================================================================
// Frame
// ===================================================================

/// A decoded message plus its correlation id.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub id: String,
    pub message: Message,
}

impl Frame {
    /// New frame with a freshly generated message id.
    #[must_use]
    pub fn new(message: Message) -> Self {
        Self {
            id: generate_id("msg"),
            message,
        }
    }

    /// Frame answering `request_id`; replies echo the originating id.
    #[must_use]
    pub fn reply(request_id: &str, message: Message) -> Self {
        Self {
            id: request_id.to_string(),
            message,
        }
    }

    #[must_use]
    pub fn kind(&self) -> MessageKind {
        self.message.kind()
    }

    /// Serialize to the text frame sent over the socket.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        let envelope = Envelope {
            id: self.id.clone(),
            kind: self.kind().as_str().to_string(),
            payload: self.message.to_payload()?,
        };
        serde_json::to_string(&envelope)
    }

    /// Decode a text frame received from the socket.
    pub fn decode(text: &str) -> Result<Self, DecodeError> {
        let envelope: Envelope = serde_json::from_str(text).map_err(DecodeError::Malformed)?;
        if envelope.id.is_empty() {
            return Err(DecodeError::MissingId);
        }
        let Some(kind) = MessageKind::parse(&envelope.kind) else {
            return Err(DecodeError::UnknownKind {
                id: envelope.id,
                kind: envelope.kind,
            });
        };
        match Message::from_parts(kind, envelope.payload) {
            Ok(message) => Ok(Self {
                id: envelope.id,
                message,
            }),
            Err(source) => Err(DecodeError::InvalidPayload {
                id: envelope.id,
                kind,
                source,
            }),
        }
    }
}

// ===================================================================
// Decode errors
// ===================================================================

/// Why an inbound text frame could not be turned into a [`Frame`].
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Not JSON, or not an envelope. Logged and dropped.
    #[error("malformed frame: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("frame has an empty id")]
    MissingId,

    #[error("unknown message type '{kind}'")]
    UnknownKind { id: String, kind: String },

    #[error("invalid {kind} payload: {source}")]
    InvalidPayload {
        id: String,
        kind: MessageKind,
        #[source]
        source: serde_json::Error,
    },
}

impl DecodeError {
    /// The `ERROR` reply owed to the peer, or `None` when the frame is
    /// unreadable enough that it should only be dropped.
    #[must_use]
    pub fn error_reply(&self) -> Option<Frame> {
        match self {
            Self::Malformed(_) | Self::MissingId => None,
            Self::UnknownKind { id, .. } => Some(Frame::new(Message::error(
                ErrorCode::UnknownType,
                self.to_string(),
                Some(id),
            ))),
            Self::InvalidPayload { id, .. } => Some(Frame::new(Message::error(
                ErrorCode::InvalidPayload,
                self.to_string(),
                Some(id),
            ))),
        }
    }
}

// ===================================================================
// Ids
// ===================================================================

/// Generate a correlation id: `<prefix>-` followed by 16 lowercase hex characters.
#[must_use]
pub fn generate_id(prefix: &str) -> String {
    format!("{prefix}-{:016x}", rand::random::<u64>())
}
