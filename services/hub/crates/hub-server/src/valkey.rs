//! Valkey-backed snapshot store, device registry and event log.

use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use fred::prelude::*;
use fred::types::config::{TlsConfig, TlsConnector, TlsHostMapping};

use fleet_protocol::{
    Command, command_key, device_key, events_key, limits, snapshot_key, ttl,
};

use crate::error::StoreError;
use crate::events::{DeviceEvent, EventSink};
use crate::registry::{DeviceRecord, DeviceRegistry};
use crate::snapshot::Snapshot;
use crate::store::SnapshotStore;

impl From<fred::error::Error> for StoreError {
    fn from(err: fred::error::Error) -> Self {
        Self::Backend(err.to_string())
    }
}

/// Client certificate material for mutual TLS to Valkey.
#[derive(Debug, Clone)]
pub struct ValkeyTls {
    pub ca_path: String,
    pub cert_path: String,
    pub key_path: String,
}

/// Connection settings for [`ValkeyStore::connect`].
#[derive(Clone)]
pub struct ValkeyOptions {
    pub url: String,
    pub user: Option<String>,
    pub password: Option<String>,
    pub tls: Option<ValkeyTls>,
}

impl std::fmt::Debug for ValkeyOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValkeyOptions")
            .field("url", &self.url)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("tls", &self.tls)
            .finish()
    }
}

#[derive(Clone)]
pub struct ValkeyStore {
    client: Client,
}

impl ValkeyStore {
    pub async fn connect(options: &ValkeyOptions) -> anyhow::Result<Self> {
        let mut config = Config::from_url(&options.url).context("invalid Valkey URL")?;
        if let Some(tls) = &options.tls {
            config.tls = Some(TlsConfig {
                connector: TlsConnector::Rustls(Arc::new(load_client_tls(tls)?).into()),
                hostnames: TlsHostMapping::None,
            });
        }
        if let Some(user) = &options.user {
            config.username = Some(user.clone());
        }
        if let Some(password) = &options.password {
            config.password = Some(password.clone());
        }

        let client = Builder::from_config(config)
            .with_connection_config(|conn_config| {
                conn_config.connection_timeout = std::time::Duration::from_secs(5);
                conn_config.internal_command_timeout = std::time::Duration::from_secs(10);
            })
            .set_policy(ReconnectPolicy::new_exponential(0, 100, 5000, 5))
            .build()?;

        client.init().await?;

        client
            .ping::<String>(None)
            .await
            .context("Valkey startup PING failed")?;

        tracing::info!(
            url = %options.url,
            tls = options.tls.is_some(),
            "Valkey connection ready"
        );

        Ok(Self { client })
    }
}

fn load_client_tls(tls: &ValkeyTls) -> anyhow::Result<rustls::ClientConfig> {
    let ca_file =
        File::open(&tls.ca_path).with_context(|| format!("failed to open CA cert: {}", tls.ca_path))?;
    let ca_certs = rustls_pemfile::certs(&mut BufReader::new(ca_file))
        .collect::<Result<Vec<_>, _>>()
        .context("failed to parse CA cert")?;

    let mut root_store = rustls::RootCertStore::empty();
    for cert in ca_certs {
        root_store
            .add(cert)
            .context("failed to add CA cert to root store")?;
    }

    let cert_file = File::open(&tls.cert_path)
        .with_context(|| format!("failed to open client cert: {}", tls.cert_path))?;
    let client_certs = rustls_pemfile::certs(&mut BufReader::new(cert_file))
        .collect::<Result<Vec<_>, _>>()
        .context("failed to parse client cert")?;

    let key_file = File::open(&tls.key_path)
        .with_context(|| format!("failed to open client key: {}", tls.key_path))?;
    let client_key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
        .context("failed to parse client key")?
        .context("no private key found in file")?;

    rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_client_auth_cert(client_certs, client_key)
        .context("failed to build TLS config with client auth")
}

fn expiry_secs(secs: u64) -> Expiration {
    Expiration::EX(i64::try_from(secs).unwrap_or(i64::MAX))
}

#[async_trait]
impl SnapshotStore for ValkeyStore {
    async fn load_snapshot(&self, device_id: &str) -> Result<Option<Snapshot>, StoreError> {
        let key = snapshot_key(device_id);
        let raw: Option<String> = self.client.get(&key).await?;
        raw.map(|text| Snapshot::decode(&key, &text)).transpose()
    }

    async fn save_snapshot(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        let key = snapshot_key(&snapshot.state.device_id);
        let json = snapshot.encode()?;
        self.client
            .set::<(), _, _>(&key, json, None, None, false)
            .await?;
        tracing::debug!(
            device_id = %snapshot.state.device_id,
            pending = snapshot.state.pending_commands.len(),
            "saved snapshot"
        );
        Ok(())
    }

    async fn delete_snapshot(&self, device_id: &str) -> Result<(), StoreError> {
        self.client.del::<(), _>(snapshot_key(device_id)).await?;
        Ok(())
    }

    async fn save_command(&self, device_id: &str, command: &Command) -> Result<(), StoreError> {
        let key = command_key(device_id, &command.command_id);
        let json = serde_json::to_string(command).map_err(StoreError::Encode)?;
        self.client
            .set::<(), _, _>(
                &key,
                json,
                Some(expiry_secs(ttl::COMMAND_RECORD_SECS)),
                None,
                false,
            )
            .await?;
        Ok(())
    }

    async fn load_command(
        &self,
        device_id: &str,
        command_id: &str,
    ) -> Result<Option<Command>, StoreError> {
        let key = command_key(device_id, command_id);
        let raw: Option<String> = self.client.get(&key).await?;
        raw.map(|text| {
            serde_json::from_str(&text).map_err(|source| StoreError::Corrupt { key, source })
        })
        .transpose()
    }
}

#[async_trait]
impl DeviceRegistry for ValkeyStore {
    async fn lookup(&self, device_id: &str) -> Result<Option<DeviceRecord>, StoreError> {
        let fields: HashMap<String, String> = self.client.hgetall(device_key(device_id)).await?;
        Ok(record_from_fields(device_id, &fields))
    }
}

/// Build a record from the `fleet:device:{id}` hash. A hash without a key
/// digest is treated as absent.
fn record_from_fields(device_id: &str, fields: &HashMap<String, String>) -> Option<DeviceRecord> {
    let api_key_sha256 = fields.get("api_key_sha256")?.clone();
    let revoked = fields
        .get("revoked")
        .is_some_and(|v| matches!(v.as_str(), "1" | "true" | "yes"));
    Some(DeviceRecord {
        device_id: device_id.to_string(),
        owner_id: fields.get("owner_id").cloned().unwrap_or_default(),
        api_key_sha256,
        revoked,
    })
}

#[async_trait]
impl EventSink for ValkeyStore {
    async fn publish(&self, device_id: &str, event: &DeviceEvent) -> Result<(), StoreError> {
        let key = events_key(device_id);
        let json = serde_json::to_string(event).map_err(StoreError::Encode)?;
        #[allow(clippy::cast_precision_loss)]
        let score = event.received_at().timestamp_millis() as f64;

        self.client
            .zadd::<(), _, _>(&key, None, None, false, false, (score, json.as_str()))
            .await?;

        let maxlen = i64::try_from(limits::EVENT_STREAM_MAXLEN).unwrap_or(i64::MAX);
        let count: i64 = self.client.zcard(&key).await?;
        if count > maxlen {
            self.client
                .zremrangebyrank::<(), _>(&key, 0, count - maxlen - 1)
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn empty_hash_is_no_device() {
        assert!(record_from_fields("d1", &HashMap::new()).is_none());
    }

    #[test]
    fn hash_fields_map_onto_record() {
        let record = record_from_fields(
            "d1",
            &fields(&[("owner_id", "o1"), ("api_key_sha256", "abcd"), ("revoked", "1")]),
        );
        let record = record.as_ref();
        assert_eq!(record.map(|r| r.owner_id.as_str()), Some("o1"));
        assert_eq!(record.map(|r| r.revoked), Some(true));
    }

    #[test]
    fn revoked_defaults_to_false() {
        let record = record_from_fields("d1", &fields(&[("api_key_sha256", "abcd")]));
        assert_eq!(record.map(|r| r.revoked), Some(false));
    }

    #[test]
    fn options_debug_redacts_password() {
        let options = ValkeyOptions {
            url: "redis://valkey:6379".to_string(),
            user: Some("fleet-hub".to_string()),
            password: Some("hunter2".to_string()),
            tls: None,
        };
        assert!(!format!("{options:?}").contains("hunter2"));
    }
}
