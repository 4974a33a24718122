use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Child;

use super::FirmwareError;

/// How long to wait for the output readers once the process is gone.
const READER_GRACE: Duration = Duration::from_secs(1);

/// How a process run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Exited on its own. `None` when killed by a signal.
    Exited(Option<i32>),
    /// Hit the timeout; the process group was killed and reaped.
    TimedOut,
}

/// Captured result of a process run. Each stream is capped at the runner's
/// output limit; `truncated` is set when either one was cut.
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub completion: Completion,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub truncated: bool,
    pub duration: Duration,
}

impl RunOutput {
    #[must_use]
    pub fn success(&self) -> bool {
        self.completion == Completion::Exited(Some(0))
    }

    #[must_use]
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    #[must_use]
    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Process execution with a hard timeout.
///
/// The firmware adapters only ever talk to the OS through this trait, so
/// tests swap in a recorder instead of spawning `nft` or `wg`.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<RunOutput, FirmwareError>;
}

/// Production runner on `tokio::process`.
///
/// Each child gets its own process group; on timeout the whole group is
/// sent SIGKILL and the leader is reaped before the call returns, so
/// nothing the command forked outlives it.
pub struct TokioCommandRunner {
    output_limit: usize,
}

impl TokioCommandRunner {
    #[must_use]
    pub fn new(output_limit: usize) -> Self {
        Self { output_limit }
    }
}

#[async_trait]
impl CommandRunner for TokioCommandRunner {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<RunOutput, FirmwareError> {
        let started = Instant::now();
        let mut command = tokio::process::Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|source| FirmwareError::Spawn {
            program: program.to_string(),
            source,
        })?;

        // Readers run beside wait() so a chatty child never blocks on a full pipe.
        let stdout = Capture::shared();
        let stderr = Capture::shared();
        let stdout_task = tokio::spawn(read_capped(
            child.stdout.take(),
            self.output_limit,
            stdout.clone(),
        ));
        let stderr_task = tokio::spawn(read_capped(
            child.stderr.take(),
            self.output_limit,
            stderr.clone(),
        ));

        let completion = tokio::select! {
            status = child.wait() => {
                let status = status.map_err(|source| FirmwareError::Io {
                    path: program.to_string(),
                    source,
                })?;
                Completion::Exited(status.code())
            }
            () = tokio::time::sleep(timeout) => {
                kill_group(&mut child).await;
                tracing::warn!(program, timeout_secs = timeout.as_secs(), "process timed out and was killed");
                Completion::TimedOut
            }
        };

        let (stdout, stdout_cut) = join_reader(stdout_task, &stdout).await;
        let (stderr, stderr_cut) = join_reader(stderr_task, &stderr).await;

        Ok(RunOutput {
            completion,
            stdout,
            stderr,
            truncated: stdout_cut || stderr_cut,
            duration: started.elapsed(),
        })
    }
}

/// SIGKILL the child's process group, then kill and reap the leader.
async fn kill_group(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;

        match i32::try_from(pid) {
            Ok(raw) => {
                if let Err(e) = killpg(Pid::from_raw(raw), Signal::SIGKILL) {
                    tracing::warn!(pid, error = %e, "failed to signal process group");
                }
            }
            Err(_) => tracing::warn!(pid, "pid out of range for a process group"),
        }
    }
    // kill() also waits, so the leader never lingers as a zombie.
    if let Err(e) = child.kill().await {
        tracing::debug!(error = %e, "child already exited");
    }
}

/// Bytes read so far from one stream, visible even if the reader never finishes.
#[derive(Debug, Default)]
struct Capture {
    kept: Vec<u8>,
    truncated: bool,
}

impl Capture {
    fn shared() -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(Self::default()))
    }

    fn take(shared: &Mutex<Self>) -> (Vec<u8>, bool) {
        let mut capture = shared.lock().unwrap_or_else(PoisonError::into_inner);
        (std::mem::take(&mut capture.kept), capture.truncated)
    }
}

/// Read a stream to EOF, keeping at most `limit` bytes.
async fn read_capped<R>(reader: Option<R>, limit: usize, capture: Arc<Mutex<Capture>>)
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return;
    };
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let mut capture = capture.lock().unwrap_or_else(PoisonError::into_inner);
                let room = limit.saturating_sub(capture.kept.len());
                if n > room {
                    capture.truncated = true;
                }
                capture.kept.extend_from_slice(&chunk[..n.min(room)]);
            }
        }
    }
}

/// Wait briefly for a reader, then keep whatever it captured. A reader still
/// blocked after the grace period is abandoned and its output marked truncated.
async fn join_reader(task: tokio::task::JoinHandle<()>, capture: &Mutex<Capture>) -> (Vec<u8>, bool) {
    let abort = task.abort_handle();
    let finished = match tokio::time::timeout(READER_GRACE, task).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            tracing::debug!(error = %e, "output reader failed");
            true
        }
        Err(_) => {
            abort.abort();
            false
        }
    };
    let (kept, truncated) = Capture::take(capture);
    (kept, truncated || !finished)
}

#[cfg(all(test, unix))]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| (*s).to_string()).collect()
    }

    #[tokio::test]
    async fn captures_exit_code_and_streams() {
        let runner = TokioCommandRunner::new(1024);
        let out = runner
            .run(
                "sh",
                &args(&["-c", "echo out; echo err >&2; exit 3"]),
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert_eq!(out.completion, Completion::Exited(Some(3)));
        assert_eq!(out.stdout_lossy(), "out\n");
        assert_eq!(out.stderr_lossy(), "err\n");
        assert!(!out.success());
    }

    #[tokio::test]
    async fn output_is_capped() {
        let runner = TokioCommandRunner::new(16);
        let out = runner
            .run(
                "sh",
                &args(&["-c", "head -c 100000 /dev/zero"]),
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.len(), 16);
        assert!(out.truncated);
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let runner = TokioCommandRunner::new(16);
        let err = runner
            .run("/nonexistent/fleet-test-binary", &[], Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, FirmwareError::Spawn { .. }));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn timeout_kill_does_not_depend_on_path() {
        // The group is signalled directly, so a child with no usable PATH
        // still loses its background sleep, and the pid it printed survives.
        let empty = tempfile::tempdir().unwrap();
        let runner = TokioCommandRunner::new(1024);
        let out = runner
            .run(
                "/usr/bin/env",
                &args(&[
                    format!("PATH={}", empty.path().display()).as_str(),
                    "/bin/sh",
                    "-c",
                    "/bin/sleep 31 & echo $!; wait",
                ]),
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert_eq!(out.completion, Completion::TimedOut);

        let pid: u32 = out.stdout_lossy().trim().parse().unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        if let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            let state = stat.rsplit(')').next().unwrap().split_whitespace().next().unwrap();
            assert_eq!(state, "Z", "background sleep outlived the timeout");
        }
    }

    #[tokio::test]
    async fn abandoned_reader_keeps_partial_output() {
        let capture = Capture::shared();
        let (mut writer, reader) = tokio::io::duplex(64);
        let task = tokio::spawn(read_capped(Some(reader), 1024, capture.clone()));
        tokio::io::AsyncWriteExt::write_all(&mut writer, b"partial").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The writer stays open, so the reader never sees EOF.
        let (kept, truncated) = join_reader(task, &capture).await;
        assert_eq!(kept, b"partial");
        assert!(truncated);
        drop(writer);
    }

    #[tokio::test]
    async fn timeout_kills_the_process() {
        let runner = TokioCommandRunner::new(1024);
        let started = Instant::now();
        let out = runner
            .run("sleep", &args(&["5"]), Duration::from_millis(200))
            .await
            .unwrap();
        assert_eq!(out.completion, Completion::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(3));
    }
}
