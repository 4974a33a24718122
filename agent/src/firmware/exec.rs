use std::time::Duration;

use fleet_protocol::{ExecRequest, ExecResult, ExecStatus};

use super::{Completion, Firmware};

/// Longest EXEC the agent will run, whatever the hub asks for.
pub const MAX_EXEC_TIMEOUT_SECS: u64 = 3600;

impl Firmware {
    /// Run an EXEC request. The program is spawned directly, never through
    /// a shell, and killed with its process group on timeout.
    pub async fn exec(&self, request: &ExecRequest) -> ExecResult {
        if request.command.trim().is_empty() {
            return ExecResult::error(&request.command_id, ExecStatus::Error, "empty command");
        }
        let timeout = Duration::from_secs(request.timeout_secs.clamp(1, MAX_EXEC_TIMEOUT_SECS));

        tracing::info!(
            command_id = %request.command_id,
            command = %request.command,
            args = request.args.len(),
            timeout_secs = timeout.as_secs(),
            "exec"
        );
        let output = match self.runner.run(&request.command, &request.args, timeout).await {
            Ok(output) => output,
            Err(e) => {
                tracing::warn!(command_id = %request.command_id, error = %e, "exec failed to start");
                return ExecResult::error(&request.command_id, ExecStatus::Error, e.to_string());
            }
        };

        let (status, exit_code) = match output.completion {
            Completion::Exited(Some(0)) => (ExecStatus::Ok, Some(0)),
            Completion::Exited(code) => (ExecStatus::Failed, code),
            Completion::TimedOut => (ExecStatus::Timeout, None),
        };
        let mut stderr = output.stderr_lossy();
        if output.truncated {
            stderr.push_str("\n[output truncated]");
        }
        ExecResult {
            command_id: request.command_id.clone(),
            status,
            exit_code,
            stdout: output.stdout_lossy(),
            stderr,
            duration_ms: u64::try_from(output.duration.as_millis()).unwrap_or(u64::MAX),
        }
    }
}
