//! Commands issued by the CRUD layer and carried to agents by the hub.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::envelope::{Frame, Message, MessageKind, generate_id};
use crate::payloads::{ApplyStatus, ExecStatus};

/// What a command asks the agent to do.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    ConfigPush,
    ConfigFull,
    Exec,
    Reboot,
    Upgrade,
    StatusRequest,
    ModeUpdate,
}

impl CommandKind {
    #[must_use]
    pub fn message_kind(self) -> MessageKind {
        match self {
            Self::ConfigPush => MessageKind::ConfigPush,
            Self::ConfigFull => MessageKind::ConfigFull,
            Self::Exec => MessageKind::Exec,
            Self::Reboot => MessageKind::Reboot,
            Self::Upgrade => MessageKind::Upgrade,
            Self::StatusRequest => MessageKind::StatusRequest,
            Self::ModeUpdate => MessageKind::ModeUpdate,
        }
    }

    /// Whether the wire payload carries a `command_id` field.
    #[must_use]
    pub fn carries_command_id(self) -> bool {
        !matches!(self, Self::StatusRequest)
    }

    /// Whether applying the command twice leaves the router as applying it once.
    /// Only these are resent when the socket they went out on dies.
    #[must_use]
    pub fn is_idempotent(self) -> bool {
        matches!(
            self,
            Self::ConfigPush | Self::ConfigFull | Self::ModeUpdate | Self::StatusRequest
        )
    }
}

/// Lifecycle of a command. Owned by the device actor until terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Pending,
    Sent,
    Acked,
    Failed,
    TimedOut,
}

impl CommandStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Acked | Self::Failed | Self::TimedOut)
    }
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("{kind:?} payload must be a JSON object")]
    PayloadNotObject { kind: CommandKind },

    #[error("invalid {kind:?} payload: {source}")]
    InvalidPayload {
        kind: CommandKind,
        #[source]
        source: serde_json::Error,
    },

    #[error("ttl of {ttl} puts the expiry out of range")]
    TtlOutOfRange { ttl: Duration },
}

/// A command and its delivery state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Command {
    pub command_id: String,
    pub kind: CommandKind,
    /// Payload without `command_id`; the id is injected when the frame is built.
    pub payload: Value,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: CommandStatus,
    /// Raw result payload reported by the agent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Hub-side reason for a `Failed` or `TimedOut` status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Command {
    /// Create a pending command, refusing payloads the agent could not decode.
    pub fn new(
        kind: CommandKind,
        payload: Value,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Self, CommandError> {
        let expires_at = now
            .checked_add_signed(ttl)
            .ok_or(CommandError::TtlOutOfRange { ttl })?;
        let command = Self {
            command_id: generate_id("cmd"),
            kind,
            payload,
            issued_at: now,
            expires_at,
            status: CommandStatus::Pending,
            result: None,
            error: None,
            updated_at: now,
        };
        command.to_message()?;
        Ok(command)
    }

    /// Build the wire message, injecting `command_id` into the payload.
    pub fn to_message(&self) -> Result<Message, CommandError> {
        let mut object = match &self.payload {
            Value::Object(map) => map.clone(),
            Value::Null => Map::new(),
            _ => return Err(CommandError::PayloadNotObject { kind: self.kind }),
        };
        if self.kind.carries_command_id() {
            object.insert(
                "command_id".to_string(),
                Value::String(self.command_id.clone()),
            );
        }
        Message::from_parts(self.kind.message_kind(), Value::Object(object)).map_err(|source| {
            CommandError::InvalidPayload {
                kind: self.kind,
                source,
            }
        })
    }

    /// The frame pushed down the socket. Its id is the command id.
    pub fn to_frame(&self) -> Result<Frame, CommandError> {
        Ok(Frame::reply(&self.command_id, self.to_message()?))
    }

    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        !self.status.is_terminal() && now >= self.expires_at
    }

    pub fn mark_sent(&mut self, now: DateTime<Utc>) {
        self.status = CommandStatus::Sent;
        self.updated_at = now;
    }

    /// Put a sent idempotent command back in line after its socket died.
    /// Returns false, and leaves the command alone, for anything else.
    pub fn requeue(&mut self, now: DateTime<Utc>) -> bool {
        if self.status != CommandStatus::Sent || !self.kind.is_idempotent() {
            return false;
        }
        self.status = CommandStatus::Pending;
        self.updated_at = now;
        true
    }

    /// Move to a terminal status with the agent's result payload.
    pub fn complete(&mut self, outcome: CommandOutcome, now: DateTime<Utc>) {
        self.status = outcome.status;
        self.result = Some(outcome.result);
        self.updated_at = now;
    }

    /// Move to a terminal status for a reason known only to the hub.
    pub fn fail(&mut self, status: CommandStatus, reason: impl Into<String>, now: DateTime<Utc>) {
        self.status = status;
        self.error = Some(reason.into());
        self.updated_at = now;
    }
}

/// Terminal status derived from an agent result message.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandOutcome {
    pub command_id: String,
    pub status: CommandStatus,
    pub result: Value,
}

impl Message {
    /// If this message reports the result of a command, the outcome it implies.
    #[must_use]
    pub fn command_outcome(&self) -> Option<CommandOutcome> {
        let (command_id, status) = match self {
            Self::ConfigAck(r) => (r.command_id.clone(), CommandStatus::Acked),
            Self::ConfigFail(r) => (r.command_id.clone(), CommandStatus::Failed),
            Self::ExecResult(r) => {
                let status = match r.status {
                    ExecStatus::Ok => CommandStatus::Acked,
                    ExecStatus::Timeout => CommandStatus::TimedOut,
                    ExecStatus::Failed | ExecStatus::Error => CommandStatus::Failed,
                };
                (r.command_id.clone(), status)
            }
            Self::ModeAck(r) => {
                let status = if r.status == ApplyStatus::Applied {
                    CommandStatus::Acked
                } else {
                    CommandStatus::Failed
                };
                (r.command_id.clone(), status)
            }
            _ => return None,
        };
        let result = self.to_payload().unwrap_or(Value::Null);
        Some(CommandOutcome {
            command_id,
            status,
            result,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::payloads::{ConfigResult, ExecResult};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn now() -> DateTime<Utc> {
        "2026-03-01T12:00:00Z".parse().unwrap()
    }

    #[test]
    fn new_command_is_pending_with_expiry() {
        let cmd = Command::new(
            CommandKind::Exec,
            json!({"command": "uptime"}),
            Duration::seconds(60),
            now(),
        )
        .unwrap();
        assert_eq!(cmd.status, CommandStatus::Pending);
        assert!(cmd.command_id.starts_with("cmd-"));
        assert_eq!(cmd.expires_at, now() + Duration::seconds(60));
    }

    #[test]
    fn new_command_rejects_payload_agent_cannot_decode() {
        let err = Command::new(
            CommandKind::Exec,
            json!({"args": ["-a"]}),
            Duration::seconds(60),
            now(),
        )
        .expect_err("missing command must be refused");
        assert!(matches!(err, CommandError::InvalidPayload { .. }));
    }

    #[test]
    fn new_command_rejects_non_object_payload() {
        let err = Command::new(CommandKind::Reboot, json!([1, 2]), Duration::seconds(1), now())
            .expect_err("arrays are not payloads");
        assert!(matches!(err, CommandError::PayloadNotObject { .. }));
    }

    #[test]
    fn frame_id_and_payload_carry_command_id() {
        let cmd = Command::new(
            CommandKind::ConfigPush,
            json!({"section": "firewall", "config": {"rules": []}}),
            Duration::seconds(60),
            now(),
        )
        .unwrap();
        let frame = cmd.to_frame().unwrap();
        assert_eq!(frame.id, cmd.command_id);
        match frame.message {
            Message::ConfigPush(push) => assert_eq!(push.command_id, cmd.command_id),
            other => panic!("expected CONFIG_PUSH, got {other:?}"),
        }
    }

    #[test]
    fn status_request_accepts_null_payload() {
        let cmd = Command::new(
            CommandKind::StatusRequest,
            Value::Null,
            Duration::seconds(5),
            now(),
        )
        .unwrap();
        assert_eq!(cmd.to_message().unwrap(), Message::StatusRequest);
    }

    #[test]
    fn expiry_ignores_terminal_commands() {
        let mut cmd = Command::new(CommandKind::Reboot, json!({}), Duration::seconds(1), now())
            .unwrap();
        let later = now() + Duration::seconds(5);
        assert!(cmd.is_expired(later));
        cmd.fail(CommandStatus::Failed, "device deleted", now());
        assert!(!cmd.is_expired(later));
    }

    #[test]
    fn ttl_past_the_calendar_is_refused() {
        let err = Command::new(CommandKind::Reboot, json!({}), Duration::MAX, now()).unwrap_err();
        assert!(matches!(err, CommandError::TtlOutOfRange { .. }));
    }

    #[test]
    fn only_idempotent_sent_commands_requeue() {
        let mut push = Command::new(
            CommandKind::ConfigPush,
            json!({"section": "dns", "config": {}}),
            Duration::seconds(60),
            now(),
        )
        .unwrap();
        assert!(!push.requeue(now()), "pending commands stay as they are");
        push.mark_sent(now());
        assert!(push.requeue(now()));
        assert_eq!(push.status, CommandStatus::Pending);

        let mut reboot =
            Command::new(CommandKind::Reboot, json!({}), Duration::seconds(60), now()).unwrap();
        reboot.mark_sent(now());
        assert!(!reboot.requeue(now()));
        assert_eq!(reboot.status, CommandStatus::Sent);
    }

    #[test]
    fn exec_timeout_result_maps_to_timed_out() {
        let msg = Message::ExecResult(ExecResult::error("cmd-1", ExecStatus::Timeout, "killed"));
        let outcome = msg.command_outcome().unwrap();
        assert_eq!(outcome.status, CommandStatus::TimedOut);
        assert_eq!(outcome.result["status"], "timeout");
    }

    #[test]
    fn config_fail_maps_to_failed() {
        let msg = Message::ConfigFail(ConfigResult {
            command_id: "cmd-2".to_string(),
            status: ApplyStatus::Rejected,
            diagnostic: Some("bad cidr".to_string()),
            changed: false,
            sections: BTreeMap::new(),
        });
        let outcome = msg.command_outcome().unwrap();
        assert_eq!(outcome.command_id, "cmd-2");
        assert_eq!(outcome.status, CommandStatus::Failed);
    }

    #[test]
    fn telemetry_is_not_a_command_outcome() {
        assert!(Message::Pong.command_outcome().is_none());
    }

    #[test]
    fn command_status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&CommandStatus::TimedOut).unwrap(),
            "\"timed_out\""
        );
    }
}
