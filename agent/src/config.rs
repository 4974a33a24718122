//! Agent configuration: command-line flags with `FLEET_AGENT_*` fallbacks.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use fleet_protocol::{AgentMode, agent_ws_url, defaults, validate_device_id};

use crate::firmware::FirmwarePaths;

/// Router agent for the fleet hub
#[derive(Parser, Debug, Clone)]
#[command(name = "fleet-agent", version)]
pub struct AgentArgs {
    /// Hub origin, e.g. wss://hub.example.com
    #[arg(long, env = "FLEET_AGENT_HUB_URL")]
    pub hub_url: String,

    #[arg(long, env = "FLEET_AGENT_DEVICE_ID")]
    pub device_id: String,

    #[arg(long, env = "FLEET_AGENT_OWNER_ID")]
    pub owner_id: String,

    /// File holding the device API key
    #[arg(long, env = "FLEET_AGENT_API_KEY_FILE")]
    pub api_key_file: PathBuf,

    /// Reported firmware version (read from /etc/openwrt_version when unset)
    #[arg(long, env = "FLEET_AGENT_FIRMWARE_VERSION")]
    pub firmware_version: Option<String>,

    /// Starting mode: managed or monitor
    #[arg(long, env = "FLEET_AGENT_MODE", default_value_t = AgentMode::Managed)]
    pub mode: AgentMode,

    #[arg(long, env = "FLEET_AGENT_PING_INTERVAL_SECS", default_value_t = defaults::PING_INTERVAL_SECS)]
    pub ping_interval_secs: u64,

    #[arg(long, env = "FLEET_AGENT_STATUS_INTERVAL_SECS", default_value_t = defaults::STATUS_INTERVAL_SECS)]
    pub status_interval_secs: u64,

    #[arg(long, env = "FLEET_AGENT_METRICS_INTERVAL_SECS", default_value_t = defaults::METRICS_INTERVAL_SECS)]
    pub metrics_interval_secs: u64,

    /// Drop the connection after this long without inbound traffic
    #[arg(long, env = "FLEET_AGENT_LIVENESS_WINDOW_SECS", default_value_t = defaults::LIVENESS_WINDOW_SECS)]
    pub liveness_window_secs: u64,

    #[arg(long, env = "FLEET_AGENT_AUTH_TIMEOUT_SECS", default_value_t = defaults::AUTH_TIMEOUT_SECS)]
    pub auth_timeout_secs: u64,

    #[arg(long, env = "FLEET_AGENT_BACKOFF_BASE_MS", default_value_t = defaults::BACKOFF_BASE_MS)]
    pub backoff_base_ms: u64,

    #[arg(long, env = "FLEET_AGENT_BACKOFF_CAP_SECS", default_value_t = defaults::BACKOFF_CAP_SECS)]
    pub backoff_cap_secs: u64,

    /// Firmware operations allowed to run at once
    #[arg(long, env = "FLEET_AGENT_MAX_CONCURRENT_OPS", default_value_t = 4)]
    pub max_concurrent_ops: usize,

    #[arg(long, env = "FLEET_AGENT_PROC_ROOT", default_value = "/proc")]
    pub proc_root: PathBuf,

    #[arg(long, env = "FLEET_AGENT_NFTABLES_FILE", default_value = "/etc/nftables.d/fleet.nft")]
    pub nftables_file: PathBuf,

    #[arg(long, env = "FLEET_AGENT_DNSMASQ_DIR", default_value = "/etc/dnsmasq.d")]
    pub dnsmasq_dir: PathBuf,

    #[arg(long, env = "FLEET_AGENT_WIRELESS_FILE", default_value = "/etc/config/wireless")]
    pub wireless_file: PathBuf,

    #[arg(long, env = "FLEET_AGENT_WIREGUARD_DIR", default_value = "/etc/wireguard")]
    pub wireguard_dir: PathBuf,

    /// Where upgrade images are downloaded
    #[arg(long, env = "FLEET_AGENT_DOWNLOAD_DIR", default_value = "/tmp")]
    pub download_dir: PathBuf,
}

/// Validated runtime configuration.
#[derive(Clone)]
pub struct AgentConfig {
    pub hub_url: String,
    pub device_id: String,
    pub owner_id: String,
    pub api_key: String,
    pub firmware_version: String,
    pub mode: AgentMode,
    pub ping_interval: Duration,
    pub status_interval: Duration,
    pub metrics_interval: Duration,
    pub liveness_window: Duration,
    pub auth_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub max_concurrent_ops: usize,
    pub proc_root: PathBuf,
    pub paths: FirmwarePaths,
}

impl fmt::Debug for AgentConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentConfig")
            .field("hub_url", &self.hub_url)
            .field("device_id", &self.device_id)
            .field("owner_id", &self.owner_id)
            .field("api_key", &"<redacted>")
            .field("firmware_version", &self.firmware_version)
            .field("mode", &self.mode)
            .field("liveness_window", &self.liveness_window)
            .field("max_concurrent_ops", &self.max_concurrent_ops)
            .finish_non_exhaustive()
    }
}

impl AgentConfig {
    /// Socket URL for this device.
    #[must_use]
    pub fn ws_url(&self) -> String {
        agent_ws_url(&self.hub_url, &self.device_id, &self.owner_id)
    }
}

impl AgentArgs {
    /// Validate the flags and read the API key file.
    ///
    /// # Errors
    ///
    /// Returns an error for an invalid device id, a non-WebSocket hub URL,
    /// a zero interval, or an unreadable or empty key file.
    pub fn into_config(self) -> Result<AgentConfig> {
        validate_device_id(&self.device_id)
            .map_err(|reason| anyhow::anyhow!("invalid device id: {reason}"))?;
        anyhow::ensure!(!self.owner_id.trim().is_empty(), "owner id must not be empty");
        anyhow::ensure!(
            self.hub_url.starts_with("ws://") || self.hub_url.starts_with("wss://"),
            "hub url must start with ws:// or wss://"
        );
        if self.hub_url.starts_with("ws://") {
            tracing::warn!("hub url is not TLS: the API key is sent in clear text");
        }
        for (name, value) in [
            ("ping interval", self.ping_interval_secs),
            ("status interval", self.status_interval_secs),
            ("metrics interval", self.metrics_interval_secs),
            ("liveness window", self.liveness_window_secs),
            ("auth timeout", self.auth_timeout_secs),
            ("backoff base", self.backoff_base_ms),
        ] {
            anyhow::ensure!(value > 0, "{name} must be greater than zero");
        }
        anyhow::ensure!(
            self.ping_interval_secs < self.liveness_window_secs,
            "ping interval must be shorter than the liveness window"
        );

        let api_key = read_key(&self.api_key_file)?;
        let firmware_version = self
            .firmware_version
            .unwrap_or_else(|| detect_firmware_version(Path::new("/etc/openwrt_version")));

        Ok(AgentConfig {
            hub_url: self.hub_url,
            device_id: self.device_id,
            owner_id: self.owner_id,
            api_key,
            firmware_version,
            mode: self.mode,
            ping_interval: Duration::from_secs(self.ping_interval_secs),
            status_interval: Duration::from_secs(self.status_interval_secs),
            metrics_interval: Duration::from_secs(self.metrics_interval_secs),
            liveness_window: Duration::from_secs(self.liveness_window_secs),
            auth_timeout: Duration::from_secs(self.auth_timeout_secs),
            backoff_base: Duration::from_millis(self.backoff_base_ms),
            backoff_cap: Duration::from_secs(self.backoff_cap_secs),
            max_concurrent_ops: self.max_concurrent_ops.max(1),
            proc_root: self.proc_root,
            paths: FirmwarePaths {
                nftables_file: self.nftables_file,
                dnsmasq_dir: self.dnsmasq_dir,
                wireless_file: self.wireless_file,
                wireguard_dir: self.wireguard_dir,
                download_dir: self.download_dir,
            },
        })
    }
}

fn read_key(path: &Path) -> Result<String> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read API key file {}", path.display()))?;
    let key = raw.trim();
    anyhow::ensure!(!key.is_empty(), "API key file {} is empty", path.display());
    Ok(key.to_string())
}

fn detect_firmware_version(path: &Path) -> String {
    std::fs::read_to_string(path)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn key_file(contents: &str) -> tempfile::NamedTempFile {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), contents).unwrap();
        file
    }

    fn parse(extra: &[&str], key: &Path) -> Result<AgentConfig> {
        let key = key.display().to_string();
        let mut argv = vec![
            "fleet-agent",
            "--hub-url",
            "wss://hub.example.com",
            "--device-id",
            "router-1",
            "--owner-id",
            "owner-1",
            "--api-key-file",
            key.as_str(),
            "--firmware-version",
            "23.05.2",
        ];
        argv.extend_from_slice(extra);
        AgentArgs::try_parse_from(argv).unwrap().into_config()
    }

    #[test]
    fn defaults_follow_protocol_constants() {
        let key = key_file("  secret-key\n");
        let config = parse(&[], key.path()).unwrap();
        assert_eq!(config.api_key, "secret-key");
        assert_eq!(config.mode, AgentMode::Managed);
        assert_eq!(config.ping_interval, Duration::from_secs(defaults::PING_INTERVAL_SECS));
        assert_eq!(config.liveness_window, Duration::from_secs(defaults::LIVENESS_WINDOW_SECS));
        assert_eq!(config.max_concurrent_ops, 4);
        assert_eq!(
            config.ws_url(),
            "wss://hub.example.com/agent/ws?device_id=router-1&owner_id=owner-1"
        );
    }

    #[test]
    fn mode_flag_is_parsed() {
        let key = key_file("k");
        let config = parse(&["--mode", "monitor"], key.path()).unwrap();
        assert_eq!(config.mode, AgentMode::Monitor);
    }

    #[test]
    fn rejects_http_hub_url() {
        let key = key_file("k");
        let argv = [
            "fleet-agent", "--hub-url", "https://hub", "--device-id", "r1", "--owner-id", "o1",
            "--api-key-file",
        ];
        let mut argv: Vec<String> = argv.iter().map(|s| (*s).to_string()).collect();
        argv.push(key.path().display().to_string());
        let err = AgentArgs::try_parse_from(argv).unwrap().into_config().unwrap_err();
        assert!(err.to_string().contains("ws://"));
    }

    #[test]
    fn rejects_empty_key_file() {
        let key = key_file("\n");
        assert!(parse(&[], key.path()).is_err());
    }

    #[test]
    fn rejects_liveness_window_shorter_than_ping() {
        let key = key_file("k");
        let err = parse(&["--ping-interval-secs", "30", "--liveness-window-secs", "20"], key.path())
            .unwrap_err();
        assert!(err.to_string().contains("liveness"));
    }

    #[test]
    fn debug_hides_api_key() {
        let key = key_file("super-secret");
        let config = parse(&[], key.path()).unwrap();
        assert!(!format!("{config:?}").contains("super-secret"));
    }
}
