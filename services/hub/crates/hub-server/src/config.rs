use std::time::Duration;

use anyhow::{Context, Result};
use fleet_protocol::{defaults, limits, ttl};
use serde::Deserialize;

use crate::hub::HubSettings;
use crate::valkey::{ValkeyOptions, ValkeyTls};

/// Hub configuration loaded from environment variables via `envy`.
///
/// Each field maps to `FLEET_HUB_<FIELD>`:
///   - `FLEET_HUB_LISTEN_ADDR`        (default `0.0.0.0:8080`)
///   - `FLEET_HUB_VALKEY_URL`         (optional; in-memory state when unset)
///   - `FLEET_HUB_VALKEY_USER`        (optional ACL user)
///   - `FLEET_HUB_VALKEY_PASS_FILE`   (optional, path to Docker secret)
///   - `FLEET_HUB_VALKEY_CA` / `_CLIENT_CERT` / `_CLIENT_KEY` (optional mTLS)
///   - `FLEET_HUB_DEVICES_FILE`       (JSON registry used without Valkey)
///   - `FLEET_HUB_ADMIN_TOKEN_FILE`   (optional bearer token for `/devices`)
///   - `FLEET_HUB_TLS_CERT` / `FLEET_HUB_TLS_KEY` (optional HTTPS)
#[derive(Debug, Deserialize)]
pub struct HubConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    pub valkey_url: Option<String>,
    pub valkey_user: Option<String>,
    pub valkey_pass_file: Option<String>,
    pub valkey_ca: Option<String>,
    pub valkey_client_cert: Option<String>,
    pub valkey_client_key: Option<String>,

    pub devices_file: Option<String>,
    pub admin_token_file: Option<String>,

    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,

    #[serde(default = "default_auth_timeout_secs")]
    pub auth_timeout_secs: u64,
    #[serde(default = "default_liveness_window_secs")]
    pub liveness_window_secs: u64,
    #[serde(default = "default_max_queue_depth")]
    pub max_queue_depth: usize,
    #[serde(default = "default_command_ttl_secs")]
    pub command_ttl_secs: u64,
    #[serde(default = "default_max_command_ttl_secs")]
    pub max_command_ttl_secs: u64,
    #[serde(default = "default_idle_hibernate_secs")]
    pub idle_hibernate_secs: u64,
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_auth_timeout_secs() -> u64 {
    defaults::AUTH_TIMEOUT_SECS
}

fn default_liveness_window_secs() -> u64 {
    defaults::LIVENESS_WINDOW_SECS
}

fn default_max_queue_depth() -> usize {
    limits::MAX_QUEUE_DEPTH
}

fn default_command_ttl_secs() -> u64 {
    ttl::DEFAULT_COMMAND_SECS
}

fn default_max_command_ttl_secs() -> u64 {
    ttl::MAX_COMMAND_SECS
}

fn default_idle_hibernate_secs() -> u64 {
    300
}

fn default_tick_interval_ms() -> u64 {
    1000
}

impl HubConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_iter(std::env::vars())
    }

    /// Load from an explicit variable list (tests use this instead of the process env).
    pub fn from_iter<I: IntoIterator<Item = (String, String)>>(vars: I) -> Result<Self> {
        let config: Self = envy::prefixed("FLEET_HUB_")
            .from_iter(vars)
            .context("failed to load config from FLEET_HUB_* env vars")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.tls_cert.is_some() != self.tls_key.is_some() {
            anyhow::bail!("FLEET_HUB_TLS_CERT and FLEET_HUB_TLS_KEY must be set together");
        }
        if self.valkey_url.is_none() && self.devices_file.is_none() {
            anyhow::bail!("set FLEET_HUB_VALKEY_URL or FLEET_HUB_DEVICES_FILE");
        }
        if self.auth_timeout_secs == 0 || self.liveness_window_secs == 0 || self.tick_interval_ms == 0 {
            anyhow::bail!("timeouts and the tick interval must be non-zero");
        }
        if self.max_command_ttl_secs > ttl::CEILING_COMMAND_SECS {
            anyhow::bail!(
                "FLEET_HUB_MAX_COMMAND_TTL_SECS must not exceed {}",
                ttl::CEILING_COMMAND_SECS
            );
        }
        if self.command_ttl_secs == 0 || self.command_ttl_secs > self.max_command_ttl_secs {
            anyhow::bail!("FLEET_HUB_COMMAND_TTL_SECS must be between 1 and FLEET_HUB_MAX_COMMAND_TTL_SECS");
        }
        Ok(())
    }

    #[must_use]
    pub fn settings(&self) -> HubSettings {
        HubSettings {
            auth_timeout: Duration::from_secs(self.auth_timeout_secs),
            liveness_window: Duration::from_secs(self.liveness_window_secs),
            max_queue_depth: self.max_queue_depth,
            idle_hibernate: Duration::from_secs(self.idle_hibernate_secs),
            tick_interval: Duration::from_millis(self.tick_interval_ms),
        }
    }

    /// Valkey connection options, reading the password from its secret file.
    pub fn valkey_options(&self) -> Result<Option<ValkeyOptions>> {
        let Some(url) = &self.valkey_url else {
            return Ok(None);
        };
        let password = self
            .valkey_pass_file
            .as_deref()
            .map(read_secret)
            .transpose()?;
        let tls = match (&self.valkey_ca, &self.valkey_client_cert, &self.valkey_client_key) {
            (Some(ca), Some(cert), Some(key)) => Some(ValkeyTls {
                ca_path: ca.clone(),
                cert_path: cert.clone(),
                key_path: key.clone(),
            }),
            (None, None, None) => None,
            _ => anyhow::bail!(
                "FLEET_HUB_VALKEY_CA, FLEET_HUB_VALKEY_CLIENT_CERT and FLEET_HUB_VALKEY_CLIENT_KEY must be set together"
            ),
        };
        Ok(Some(ValkeyOptions {
            url: url.clone(),
            user: self.valkey_user.clone(),
            password,
            tls,
        }))
    }

    pub fn admin_token(&self) -> Result<Option<String>> {
        self.admin_token_file.as_deref().map(read_secret).transpose()
    }
}

/// Read a secret file, trimming the trailing newline Docker secrets carry.
pub fn read_secret(path: &str) -> Result<String> {
    let secret = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read secret from {path}"))?
        .trim()
        .to_string();
    if secret.is_empty() {
        anyhow::bail!("secret file {path} is empty");
    }
    Ok(secret)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::io::Write;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn defaults_apply_with_devices_file() {
        let config = HubConfig::from_iter(vars(&[("FLEET_HUB_DEVICES_FILE", "/etc/fleet/devices.json")]))
            .unwrap();
        assert_eq!(config.listen_addr, "0.0.0.0:8080");
        assert_eq!(config.auth_timeout_secs, defaults::AUTH_TIMEOUT_SECS);
        assert_eq!(config.settings().max_queue_depth, limits::MAX_QUEUE_DEPTH);
        assert!(config.valkey_options().unwrap().is_none());
    }

    #[test]
    fn some_state_backend_is_required() {
        assert!(HubConfig::from_iter(vars(&[])).is_err());
    }

    #[test]
    fn tls_cert_without_key_is_refused() {
        let err = HubConfig::from_iter(vars(&[
            ("FLEET_HUB_DEVICES_FILE", "d.json"),
            ("FLEET_HUB_TLS_CERT", "/tls/cert.pem"),
        ]))
        .expect_err("half TLS config");
        assert!(err.to_string().contains("TLS"));
    }

    #[test]
    fn command_ttl_ceiling_is_enforced() {
        let err = HubConfig::from_iter(vars(&[
            ("FLEET_HUB_DEVICES_FILE", "d.json"),
            ("FLEET_HUB_MAX_COMMAND_TTL_SECS", "18446744073709551615"),
        ]))
        .expect_err("unbounded ttl");
        assert!(err.to_string().contains("FLEET_HUB_MAX_COMMAND_TTL_SECS"));

        let config = HubConfig::from_iter(vars(&[
            ("FLEET_HUB_DEVICES_FILE", "d.json"),
            ("FLEET_HUB_MAX_COMMAND_TTL_SECS", "31536000"),
        ]))
        .unwrap();
        assert_eq!(config.max_command_ttl_secs, ttl::CEILING_COMMAND_SECS);
    }

    #[test]
    fn numeric_overrides_are_parsed() {
        let config = HubConfig::from_iter(vars(&[
            ("FLEET_HUB_VALKEY_URL", "redis://valkey:6379"),
            ("FLEET_HUB_LIVENESS_WINDOW_SECS", "45"),
            ("FLEET_HUB_TICK_INTERVAL_MS", "250"),
        ]))
        .unwrap();
        let settings = config.settings();
        assert_eq!(settings.liveness_window, Duration::from_secs(45));
        assert_eq!(settings.tick_interval, Duration::from_millis(250));
    }

    #[test]
    fn valkey_password_is_read_from_secret_file() {
        let mut secret = tempfile::NamedTempFile::new().unwrap();
        writeln!(secret, "s3cret").unwrap();
        let path = secret.path().to_str().unwrap().to_string();

        let config = HubConfig::from_iter(vars(&[
            ("FLEET_HUB_VALKEY_URL", "redis://valkey:6379"),
            ("FLEET_HUB_VALKEY_USER", "fleet-hub"),
            ("FLEET_HUB_VALKEY_PASS_FILE", &path),
        ]))
        .unwrap();
        let options = config.valkey_options().unwrap().unwrap();
        assert_eq!(options.password.as_deref(), Some("s3cret"));
        assert_eq!(options.user.as_deref(), Some("fleet-hub"));
    }

    #[test]
    fn partial_valkey_mtls_is_refused() {
        let config = HubConfig::from_iter(vars(&[
            ("FLEET_HUB_VALKEY_URL", "rediss://valkey:6379"),
            ("FLEET_HUB_VALKEY_CA", "/tls/ca.crt"),
        ]))
        .unwrap();
        assert!(config.valkey_options().is_err());
    }

    #[test]
    fn empty_secret_is_refused() {
        let secret = tempfile::NamedTempFile::new().unwrap();
        assert!(read_secret(secret.path().to_str().unwrap()).is_err());
    }
}
