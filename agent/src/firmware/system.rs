//! Reboot and firmware upgrade.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use fleet_protocol::{ExecResult, ExecStatus, RebootRequest, UpgradeRequest};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::{CommandRunner, Firmware, FirmwareError};

/// Minimum delay before a reboot, so the result frame reaches the hub first.
pub(super) const REBOOT_GRACE: Duration = Duration::from_secs(5);

const MAX_IMAGE_BYTES: u64 = 128 * 1024 * 1024;
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(600);
const IMAGE_CHECK_TIMEOUT: Duration = Duration::from_secs(120);
const UPGRADE_TIMEOUT: Duration = Duration::from_secs(900);
const IMAGE_FILE: &str = "fleet-upgrade.bin";

impl Firmware {
    /// Schedule a reboot and report immediately.
    pub async fn reboot(&self, request: &RebootRequest) -> ExecResult {
        let delay = Duration::from_secs(request.delay_secs).max(self.reboot_grace);
        let runner = Arc::clone(&self.runner);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            tracing::warn!("rebooting on hub request");
            run_detached(runner.as_ref(), "reboot", Vec::new(), Duration::from_secs(30)).await;
        });
        tracing::info!(command_id = %request.command_id, delay_secs = delay.as_secs(), "reboot scheduled");
        ExecResult {
            command_id: request.command_id.clone(),
            status: ExecStatus::Ok,
            exit_code: None,
            stdout: format!("reboot scheduled in {}s", delay.as_secs()),
            stderr: String::new(),
            duration_ms: 0,
        }
    }

    /// Download, verify and hand the image to `sysupgrade`.
    ///
    /// The result is sent once the image passes `sysupgrade -T`; the flash
    /// itself runs detached because it ends with the router rebooting.
    pub async fn upgrade(&self, request: &UpgradeRequest) -> ExecResult {
        let started = Instant::now();
        match self.stage_upgrade(request).await {
            Ok(()) => ExecResult {
                command_id: request.command_id.clone(),
                status: ExecStatus::Ok,
                exit_code: None,
                stdout: "image verified, upgrade started".to_string(),
                stderr: String::new(),
                duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            },
            Err(e) => {
                tracing::warn!(command_id = %request.command_id, error = %e, "upgrade refused");
                let status = match e {
                    FirmwareError::ChecksumMismatch { .. } | FirmwareError::CommandFailed { .. } => {
                        ExecStatus::Failed
                    }
                    _ => ExecStatus::Error,
                };
                let mut result = ExecResult::error(&request.command_id, status, e.to_string());
                result.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
                result
            }
        }
    }

    async fn stage_upgrade(&self, request: &UpgradeRequest) -> Result<(), FirmwareError> {
        if request.sha256.len() != 64
            || !request
                .sha256
                .chars()
                .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
        {
            return Err(FirmwareError::Download(
                "sha256 must be 64 lowercase hex characters".to_string(),
            ));
        }
        let url = reqwest::Url::parse(&request.url)
            .map_err(|e| FirmwareError::Download(format!("invalid url: {e}")))?;
        if !matches!(url.scheme(), "https" | "http") {
            return Err(FirmwareError::Download(format!(
                "unsupported url scheme '{}'",
                url.scheme()
            )));
        }

        let image = self.paths.download_dir.join(IMAGE_FILE);
        self.download(url, &image).await?;
        if let Err(e) = verify_image(&image, &request.sha256).await {
            let _ = tokio::fs::remove_file(&image).await;
            return Err(e);
        }

        let path = image.display().to_string();
        self.run_checked(&["sysupgrade".to_string(), "-T".to_string(), path.clone()], IMAGE_CHECK_TIMEOUT)
            .await?;

        let mut args = Vec::new();
        if !request.keep_config {
            args.push("-n".to_string());
        }
        args.push(path);
        let runner = Arc::clone(&self.runner);
        tokio::spawn(async move {
            run_detached(runner.as_ref(), "sysupgrade", args, UPGRADE_TIMEOUT).await;
        });
        Ok(())
    }

    async fn download(&self, url: reqwest::Url, dest: &Path) -> Result<(), FirmwareError> {
        let download = |e: reqwest::Error| FirmwareError::Download(e.to_string());
        let mut response = self
            .http
            .get(url)
            .timeout(DOWNLOAD_TIMEOUT)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(download)?;
        if response.content_length().is_some_and(|len| len > MAX_IMAGE_BYTES) {
            return Err(FirmwareError::Download("image exceeds size limit".to_string()));
        }

        if let Some(dir) = dest.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| FirmwareError::io(dir, e))?;
        }
        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| FirmwareError::io(dest, e))?;
        let mut written: u64 = 0;
        while let Some(chunk) = response.chunk().await.map_err(download)? {
            written += chunk.len() as u64;
            if written > MAX_IMAGE_BYTES {
                drop(file);
                let _ = tokio::fs::remove_file(dest).await;
                return Err(FirmwareError::Download("image exceeds size limit".to_string()));
            }
            file.write_all(&chunk)
                .await
                .map_err(|e| FirmwareError::io(dest, e))?;
        }
        file.flush().await.map_err(|e| FirmwareError::io(dest, e))?;
        tracing::info!(bytes = written, path = %dest.display(), "image downloaded");
        Ok(())
    }
}

/// Check a file against an expected lowercase hex SHA-256.
pub async fn verify_image(path: &Path, expected: &str) -> Result<(), FirmwareError> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| FirmwareError::io(path, e))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 65536];
    loop {
        let n = file
            .read(&mut buf)
            .await
            .map_err(|e| FirmwareError::io(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let actual = hex_encode(&hasher.finalize());
    if actual == expected {
        Ok(())
    } else {
        Err(FirmwareError::ChecksumMismatch {
            expected: expected.to_string(),
            actual,
        })
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write as _;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut s, b| {
        let _ = write!(s, "{b:02x}");
        s
    })
}

async fn run_detached(runner: &dyn CommandRunner, program: &str, args: Vec<String>, timeout: Duration) {
    match runner.run(program, &args, timeout).await {
        Ok(output) if output.success() => {}
        Ok(output) => {
            tracing::error!(program, completion = ?output.completion, stderr = %output.stderr_lossy(), "command failed");
        }
        Err(e) => tracing::error!(program, error = %e, "command failed to start"),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const OTHER_SHA: &str = "abababababababababababababababababababababababababababababababab";

    #[tokio::test]
    async fn verify_image_matches_known_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("img.bin");
        std::fs::write(&path, b"").unwrap();
        verify_image(
            &path,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855",
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn verify_image_reports_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("img.bin");
        std::fs::write(&path, b"not the image").unwrap();
        let err = verify_image(&path, OTHER_SHA).await.unwrap_err();
        let FirmwareError::ChecksumMismatch { expected, actual } = err else {
            panic!("expected checksum mismatch");
        };
        assert_eq!(expected, OTHER_SHA);
        assert_eq!(actual.len(), 64);
        assert_ne!(actual, OTHER_SHA);
    }

    #[test]
    fn hex_is_lowercase_and_padded() {
        assert_eq!(hex_encode(&[0x00, 0x0f, 0xab]), "000fab");
    }
}
