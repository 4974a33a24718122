//! Firmware adapter layer: turns protocol commands into changes on the router.
//!
//! Every configuration area renders its desired state to one file, writes it
//! only when the content differs, and reloads the owning daemon only after a
//! write. Re-applying identical configuration is therefore a no-op that still
//! reports success.

mod dnsmasq;
mod exec;
mod firewall;
pub mod runner;
mod system;
mod vpn;
mod wifi;

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use fleet_protocol::{ApplyStatus, SectionOutcome};
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;

pub use runner::{CommandRunner, Completion, RunOutput, TokioCommandRunner};
pub use system::verify_image;

/// Upper bound on daemon reload commands.
const RELOAD_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum FirmwareError {
    #[error("invalid {section} config: {reason}")]
    InvalidConfig { section: String, reason: String },

    #[error("unknown config section '{0}'")]
    UnknownSection(String),

    #[error("{path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with {code:?}: {stderr}")]
    CommandFailed {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("{program} timed out after {}s", .timeout.as_secs())]
    TimedOut { program: String, timeout: Duration },

    #[error("download failed: {0}")]
    Download(String),

    #[error("image checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
}

impl FirmwareError {
    /// Status reported to the hub: bad input is `rejected`, anything the
    /// router failed to do is `error`.
    #[must_use]
    pub fn apply_status(&self) -> ApplyStatus {
        match self {
            Self::InvalidConfig { .. } | Self::UnknownSection(_) => ApplyStatus::Rejected,
            _ => ApplyStatus::Error,
        }
    }

    fn invalid(section: Section, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            section: section.to_string(),
            reason: reason.into(),
        }
    }

    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

/// Configuration areas the agent can manage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    Firewall,
    Dhcp,
    Dns,
    Wifi,
    Vpn,
}

impl Section {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Firewall => "firewall",
            Self::Dhcp => "dhcp",
            Self::Dns => "dns",
            Self::Wifi => "wifi",
            Self::Vpn => "vpn",
        }
    }
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Section {
    type Err = FirmwareError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "firewall" => Ok(Self::Firewall),
            "dhcp" => Ok(Self::Dhcp),
            "dns" => Ok(Self::Dns),
            "wifi" => Ok(Self::Wifi),
            "vpn" => Ok(Self::Vpn),
            other => Err(FirmwareError::UnknownSection(other.to_string())),
        }
    }
}

/// Where the adapters write their files.
#[derive(Debug, Clone)]
pub struct FirmwarePaths {
    pub nftables_file: PathBuf,
    pub dnsmasq_dir: PathBuf,
    pub wireless_file: PathBuf,
    pub wireguard_dir: PathBuf,
    pub download_dir: PathBuf,
}

impl Default for FirmwarePaths {
    fn default() -> Self {
        Self {
            nftables_file: PathBuf::from("/etc/nftables.d/fleet.nft"),
            dnsmasq_dir: PathBuf::from("/etc/dnsmasq.d"),
            wireless_file: PathBuf::from("/etc/config/wireless"),
            wireguard_dir: PathBuf::from("/etc/wireguard"),
            download_dir: PathBuf::from("/tmp"),
        }
    }
}

/// A rendered file plus the commands that make the daemon pick it up.
struct Target {
    path: PathBuf,
    content: String,
    mode: u32,
    reload: Vec<ReloadStep>,
}

/// One command of a reload, skipped when `skip_if` exits cleanly.
struct ReloadStep {
    argv: Vec<String>,
    skip_if: Option<Vec<String>>,
}

impl ReloadStep {
    fn unless(argv: Vec<String>, check: Vec<String>) -> Self {
        Self {
            argv,
            skip_if: Some(check),
        }
    }
}

impl From<Vec<String>> for ReloadStep {
    fn from(argv: Vec<String>) -> Self {
        Self { argv, skip_if: None }
    }
}

/// Entry point for all router-side changes.
pub struct Firmware {
    runner: Arc<dyn CommandRunner>,
    paths: FirmwarePaths,
    /// Serialises config writes so two pushes never interleave on one file.
    config_lock: Mutex<()>,
    http: reqwest::Client,
    reboot_grace: Duration,
}

impl Firmware {
    #[must_use]
    pub fn new(runner: Arc<dyn CommandRunner>, paths: FirmwarePaths) -> Self {
        Self {
            runner,
            paths,
            config_lock: Mutex::new(()),
            http: reqwest::Client::new(),
            reboot_grace: system::REBOOT_GRACE,
        }
    }

    /// Override the minimum reboot delay (tests use zero).
    #[must_use]
    pub fn with_reboot_grace(mut self, grace: Duration) -> Self {
        self.reboot_grace = grace;
        self
    }

    #[must_use]
    pub fn paths(&self) -> &FirmwarePaths {
        &self.paths
    }

    /// Apply one configuration section. Returns whether anything changed.
    pub async fn apply_section(&self, section: &str, config: &Value) -> Result<bool, FirmwareError> {
        let section: Section = section.parse()?;
        let target = self.render(section, config)?;
        let _guard = self.config_lock.lock().await;
        let changed = self.converge(&target).await?;
        tracing::info!(%section, changed, path = %target.path.display(), "config section applied");
        Ok(changed)
    }

    /// Apply every section, continuing past failures.
    pub async fn apply_full(&self, sections: &BTreeMap<String, Value>) -> BTreeMap<String, SectionOutcome> {
        let mut outcomes = BTreeMap::new();
        for (name, config) in sections {
            let outcome = match self.apply_section(name, config).await {
                Ok(changed) => SectionOutcome {
                    status: ApplyStatus::Applied,
                    diagnostic: None,
                    changed,
                },
                Err(e) => {
                    tracing::warn!(section = %name, error = %e, "config section failed");
                    SectionOutcome {
                        status: e.apply_status(),
                        diagnostic: Some(e.to_string()),
                        changed: false,
                    }
                }
            };
            outcomes.insert(name.clone(), outcome);
        }
        outcomes
    }

    fn render(&self, section: Section, config: &Value) -> Result<Target, FirmwareError> {
        let target = match section {
            Section::Firewall => Target {
                path: self.paths.nftables_file.clone(),
                content: firewall::render(&parse(section, config)?)?,
                mode: 0o644,
                reload: vec![firewall::reload_command(&self.paths.nftables_file).into()],
            },
            Section::Dhcp => Target {
                path: self.paths.dnsmasq_dir.join(dnsmasq::DHCP_FILE),
                content: dnsmasq::render_dhcp(&parse(section, config)?)?,
                mode: 0o644,
                reload: vec![dnsmasq::reload_command().into()],
            },
            Section::Dns => Target {
                path: self.paths.dnsmasq_dir.join(dnsmasq::DNS_FILE),
                content: dnsmasq::render_dns(&parse(section, config)?)?,
                mode: 0o644,
                reload: vec![dnsmasq::reload_command().into()],
            },
            Section::Wifi => Target {
                path: self.paths.wireless_file.clone(),
                content: wifi::render(&parse(section, config)?)?,
                mode: 0o644,
                reload: vec![wifi::reload_command().into()],
            },
            Section::Vpn => {
                let vpn: vpn::VpnConfig = parse(section, config)?;
                let path = self
                    .paths
                    .wireguard_dir
                    .join(format!("{}.conf", vpn.interface));
                Target {
                    content: vpn::render(&vpn)?,
                    reload: vpn::bring_up(&vpn, &path),
                    path,
                    mode: 0o600,
                }
            }
        };
        Ok(target)
    }

    /// Write `target` if its content differs, then reload. A failed reload
    /// puts the previous file back so the router keeps its last good state.
    async fn converge(&self, target: &Target) -> Result<bool, FirmwareError> {
        let previous = match tokio::fs::read_to_string(&target.path).await {
            Ok(text) => Some(text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(FirmwareError::io(&target.path, e)),
        };
        if previous.as_deref() == Some(target.content.as_str()) {
            return Ok(false);
        }

        write_atomic(&target.path, target.content.clone(), target.mode).await?;

        if let Err(e) = self.reload(&target.reload).await {
            tracing::warn!(path = %target.path.display(), error = %e, "reload failed, restoring previous config");
            let restored = match previous {
                Some(text) => write_atomic(&target.path, text, target.mode).await,
                None => tokio::fs::remove_file(&target.path)
                    .await
                    .map_err(|source| FirmwareError::io(&target.path, source)),
            };
            if let Err(restore) = restored {
                tracing::error!(path = %target.path.display(), error = %restore, "failed to restore previous config");
            }
            return Err(e);
        }
        Ok(true)
    }

    /// Run reload steps in order, stopping at the first failure.
    async fn reload(&self, steps: &[ReloadStep]) -> Result<(), FirmwareError> {
        for step in steps {
            if let Some(check) = &step.skip_if {
                if self.run_checked(check, RELOAD_TIMEOUT).await.is_ok() {
                    continue;
                }
            }
            self.run_checked(&step.argv, RELOAD_TIMEOUT).await?;
        }
        Ok(())
    }

    /// Run `argv` and turn anything but a clean exit into an error.
    async fn run_checked(&self, argv: &[String], timeout: Duration) -> Result<RunOutput, FirmwareError> {
        let Some((program, args)) = argv.split_first() else {
            return Err(FirmwareError::Spawn {
                program: String::new(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command"),
            });
        };
        let output = self.runner.run(program, args, timeout).await?;
        match output.completion {
            Completion::Exited(Some(0)) => Ok(output),
            Completion::Exited(code) => Err(FirmwareError::CommandFailed {
                program: program.clone(),
                code,
                stderr: output.stderr_lossy().trim().to_string(),
            }),
            Completion::TimedOut => Err(FirmwareError::TimedOut {
                program: program.clone(),
                timeout,
            }),
        }
    }
}

fn parse<T: DeserializeOwned>(section: Section, config: &Value) -> Result<T, FirmwareError> {
    serde_json::from_value(config.clone()).map_err(|e| FirmwareError::invalid(section, e.to_string()))
}

/// Replace `path` with `content` via a temp file in the same directory.
async fn write_atomic(path: &Path, content: String, mode: u32) -> Result<(), FirmwareError> {
    let path = path.to_path_buf();
    let result = tokio::task::spawn_blocking(move || -> Result<(), FirmwareError> {
        use std::io::Write;

        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir).map_err(|e| FirmwareError::io(dir, e))?;
        let mut file = tempfile::NamedTempFile::new_in(dir).map_err(|e| FirmwareError::io(dir, e))?;
        file.write_all(content.as_bytes())
            .map_err(|e| FirmwareError::io(file.path(), e))?;
        file.as_file()
            .sync_all()
            .map_err(|e| FirmwareError::io(file.path(), e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(mode))
                .map_err(|e| FirmwareError::io(file.path(), e))?;
        }
        #[cfg(not(unix))]
        let _ = mode;
        file.persist(&path).map_err(|e| FirmwareError::io(&path, e.error))?;
        Ok(())
    })
    .await;

    match result {
        Ok(inner) => inner,
        Err(e) => Err(FirmwareError::Io {
            path: "write task".to_string(),
            source: std::io::Error::other(e),
        }),
    }
}

/// Shared field checks for the renderers.
mod validate {
    use std::net::IpAddr;

    /// Interface, zone and chain names: 1-15 of `[A-Za-z0-9_.-]`.
    pub(super) fn ifname(name: &str) -> Result<(), String> {
        let ok = !name.is_empty()
            && name.len() <= 15
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
        if ok {
            Ok(())
        } else {
            Err(format!("invalid interface name '{name}'"))
        }
    }

    /// `addr` or `addr/prefix`. Returns the address part.
    pub(super) fn cidr(value: &str) -> Result<IpAddr, String> {
        let (addr, prefix) = match value.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (value, None),
        };
        let ip: IpAddr = addr
            .parse()
            .map_err(|_| format!("invalid address '{value}'"))?;
        if let Some(prefix) = prefix {
            let max = if ip.is_ipv4() { 32 } else { 128 };
            match prefix.parse::<u8>() {
                Ok(p) if p <= max => {}
                _ => return Err(format!("invalid prefix in '{value}'")),
            }
        }
        Ok(ip)
    }

    pub(super) fn ip(value: &str) -> Result<IpAddr, String> {
        value
            .parse()
            .map_err(|_| format!("invalid address '{value}'"))
    }

    /// DNS names: dot-separated labels of `[A-Za-z0-9-]`.
    pub(super) fn hostname(name: &str) -> Result<(), String> {
        let ok = !name.is_empty()
            && name.len() <= 253
            && name.split('.').all(|label| {
                !label.is_empty()
                    && label.len() <= 63
                    && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
            });
        if ok {
            Ok(())
        } else {
            Err(format!("invalid hostname '{name}'"))
        }
    }
}
