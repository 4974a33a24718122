//! Hands firmware commands to the worker pool and routes their results back
//! to the socket writer.

use std::collections::BTreeMap;
use std::sync::Arc;

use fleet_protocol::{
    AgentMode, ApplyStatus, ConfigFull, ConfigPush, ConfigResult, ExecRequest, ExecResult,
    ExecStatus, Frame, Message, RebootRequest, UpgradeRequest,
};
use tokio::sync::mpsc;

use crate::firmware::Firmware;
use crate::pool::WorkerPool;

/// A command that ends up in the firmware layer.
#[derive(Debug, Clone)]
pub enum FirmwareCommand {
    ConfigPush(ConfigPush),
    ConfigFull(ConfigFull),
    Exec(ExecRequest),
    Reboot(RebootRequest),
    Upgrade(UpgradeRequest),
}

impl FirmwareCommand {
    /// Split firmware commands off from everything else.
    pub fn from_message(message: Message) -> Result<Self, Message> {
        match message {
            Message::ConfigPush(p) => Ok(Self::ConfigPush(p)),
            Message::ConfigFull(p) => Ok(Self::ConfigFull(p)),
            Message::Exec(p) => Ok(Self::Exec(p)),
            Message::Reboot(p) => Ok(Self::Reboot(p)),
            Message::Upgrade(p) => Ok(Self::Upgrade(p)),
            other => Err(other),
        }
    }

    #[must_use]
    pub fn command_id(&self) -> &str {
        match self {
            Self::ConfigPush(p) => &p.command_id,
            Self::ConfigFull(p) => &p.command_id,
            Self::Exec(p) => &p.command_id,
            Self::Reboot(p) => &p.command_id,
            Self::Upgrade(p) => &p.command_id,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::ConfigPush(_) => "config_push",
            Self::ConfigFull(_) => "config_full",
            Self::Exec(_) => "exec",
            Self::Reboot(_) => "reboot",
            Self::Upgrade(_) => "upgrade",
        }
    }

    /// The negative result sent instead of running the command.
    fn refusal(&self, reason: &str) -> Message {
        match self {
            Self::ConfigPush(_) | Self::ConfigFull(_) => Message::ConfigFail(ConfigResult {
                command_id: self.command_id().to_string(),
                status: ApplyStatus::Rejected,
                diagnostic: Some(reason.to_string()),
                changed: false,
                sections: BTreeMap::new(),
            }),
            Self::Exec(_) | Self::Reboot(_) | Self::Upgrade(_) => Message::ExecResult(
                ExecResult::error(self.command_id(), ExecStatus::Error, reason),
            ),
        }
    }
}

/// Runs firmware commands off the socket task.
///
/// Results go to an unbounded channel owned by the connection manager, so
/// a result produced while the socket is down is sent after the next
/// successful authentication.
pub struct Dispatcher {
    firmware: Arc<Firmware>,
    pool: WorkerPool,
    results: mpsc::UnboundedSender<Frame>,
}

impl Dispatcher {
    #[must_use]
    pub fn new(
        firmware: Arc<Firmware>,
        pool: WorkerPool,
        results: mpsc::UnboundedSender<Frame>,
    ) -> Self {
        Self {
            firmware,
            pool,
            results,
        }
    }

    /// Start `command`. Returns at once; the reply frame carries `request_id`.
    pub fn dispatch(&self, request_id: &str, command: FirmwareCommand, mode: AgentMode) {
        let request_id = request_id.to_string();
        tracing::info!(command_id = %command.command_id(), kind = command.name(), %mode, "command received");

        if mode == AgentMode::Monitor {
            tracing::warn!(command_id = %command.command_id(), kind = command.name(), "refused in monitor mode");
            let reply = command.refusal("agent is in monitor mode");
            self.send(Frame::reply(&request_id, reply));
            return;
        }

        let firmware = Arc::clone(&self.firmware);
        let results = self.results.clone();
        self.pool.spawn(async move {
            let reply = run(&firmware, command).await;
            if results.send(Frame::reply(&request_id, reply)).is_err() {
                tracing::debug!("result channel closed, agent is stopping");
            }
        });
    }

    fn send(&self, frame: Frame) {
        if self.results.send(frame).is_err() {
            tracing::debug!("result channel closed, agent is stopping");
        }
    }
}

async fn run(firmware: &Firmware, command: FirmwareCommand) -> Message {
    match command {
        FirmwareCommand::ConfigPush(push) => {
            match firmware.apply_section(&push.section, &push.config).await {
                Ok(changed) => Message::ConfigAck(ConfigResult {
                    command_id: push.command_id,
                    status: ApplyStatus::Applied,
                    diagnostic: None,
                    changed,
                    sections: BTreeMap::new(),
                }),
                Err(e) => {
                    tracing::warn!(command_id = %push.command_id, section = %push.section, error = %e, "config push failed");
                    Message::ConfigFail(ConfigResult {
                        command_id: push.command_id,
                        status: e.apply_status(),
                        diagnostic: Some(e.to_string()),
                        changed: false,
                        sections: BTreeMap::new(),
                    })
                }
            }
        }
        FirmwareCommand::ConfigFull(full) => {
            let outcomes = firmware.apply_full(&full.sections).await;
            config_full_result(full.command_id, outcomes)
        }
        FirmwareCommand::Exec(request) => Message::ExecResult(firmware.exec(&request).await),
        FirmwareCommand::Reboot(request) => Message::ExecResult(firmware.reboot(&request).await),
        FirmwareCommand::Upgrade(request) => Message::ExecResult(firmware.upgrade(&request).await),
    }
}

/// CONFIG_ACK only when every section applied.
fn config_full_result(
    command_id: String,
    outcomes: BTreeMap<String, fleet_protocol::SectionOutcome>,
) -> Message {
    let changed = outcomes.values().any(|o| o.changed);
    let failed: Vec<&str> = outcomes
        .iter()
        .filter(|(_, o)| o.status != ApplyStatus::Applied)
        .map(|(name, _)| name.as_str())
        .collect();

    if failed.is_empty() {
        return Message::ConfigAck(ConfigResult {
            command_id,
            status: ApplyStatus::Applied,
            diagnostic: None,
            changed,
            sections: outcomes,
        });
    }

    let status = if outcomes.values().any(|o| o.status == ApplyStatus::Error) {
        ApplyStatus::Error
    } else {
        ApplyStatus::Rejected
    };
    Message::ConfigFail(ConfigResult {
        command_id,
        status,
        diagnostic: Some(format!("sections failed: {}", failed.join(", "))),
        changed,
        sections: outcomes,
    })
}
