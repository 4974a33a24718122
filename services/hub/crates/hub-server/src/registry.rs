//! Device registry: who may connect, and with which key.
//!
//! API keys are never stored; the registry holds SHA-256 hex digests and
//! presented keys are hashed and compared in constant time.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::error::StoreError;

/// One registered device.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceRecord {
    pub device_id: String,
    pub owner_id: String,
    /// Lowercase hex SHA-256 of the device API key.
    pub api_key_sha256: String,
    #[serde(default)]
    pub revoked: bool,
}

impl fmt::Debug for DeviceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceRecord")
            .field("device_id", &self.device_id)
            .field("owner_id", &self.owner_id)
            .field("api_key_sha256", &"<redacted>")
            .field("revoked", &self.revoked)
            .finish()
    }
}

impl DeviceRecord {
    #[must_use]
    pub fn info(&self) -> hub_api_types::DeviceInfo {
        hub_api_types::DeviceInfo {
            device_id: self.device_id.clone(),
            owner_id: self.owner_id.clone(),
            revoked: self.revoked,
        }
    }
}

#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    async fn lookup(&self, device_id: &str) -> Result<Option<DeviceRecord>, StoreError>;
}

/// Result of checking presented credentials against the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthVerdict {
    Accepted,
    UnknownDevice,
    /// AUTH named a different device than the socket URL.
    DeviceMismatch,
    BadKey,
    Revoked,
    OwnerMismatch,
}

impl AuthVerdict {
    /// Text sent to the agent in `AUTH_FAIL`. Deliberately coarse so the
    /// reply does not reveal which devices exist.
    #[must_use]
    pub fn public_reason(self) -> &'static str {
        match self {
            Self::Accepted => "ok",
            Self::Revoked => "device revoked",
            Self::UnknownDevice | Self::DeviceMismatch | Self::BadKey | Self::OwnerMismatch => {
                "invalid credentials"
            }
        }
    }
}

impl fmt::Display for AuthVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Accepted => "accepted",
            Self::UnknownDevice => "unknown device",
            Self::DeviceMismatch => "device id does not match connection",
            Self::BadKey => "api key mismatch",
            Self::Revoked => "device revoked",
            Self::OwnerMismatch => "owner id mismatch",
        })
    }
}

/// Check an AUTH attempt against a registry record.
///
/// `owner_id` is the owner named in the socket URL; when present it must
/// match the registered owner.
#[must_use]
pub fn verify(record: Option<&DeviceRecord>, api_key: &str, owner_id: Option<&str>) -> AuthVerdict {
    let presented = hash_api_key(api_key);
    let Some(record) = record else {
        return AuthVerdict::UnknownDevice;
    };
    let expected = record.api_key_sha256.to_ascii_lowercase();
    if !bool::from(presented.as_bytes().ct_eq(expected.as_bytes())) {
        return AuthVerdict::BadKey;
    }
    if record.revoked {
        return AuthVerdict::Revoked;
    }
    if owner_id.is_some_and(|owner| owner != record.owner_id) {
        return AuthVerdict::OwnerMismatch;
    }
    AuthVerdict::Accepted
}

/// Lowercase hex SHA-256 of an API key.
#[must_use]
pub fn hash_api_key(api_key: &str) -> String {
    format!("{:x}", Sha256::digest(api_key.as_bytes()))
}

/// Compare two secrets in constant time.
///
/// Both sides are hashed first, so the comparison always runs over 32
/// bytes and the timing says nothing about the expected secret's length.
#[must_use]
pub fn secrets_match(presented: &str, expected: &str) -> bool {
    let presented = Sha256::digest(presented.as_bytes());
    let expected = Sha256::digest(expected.as_bytes());
    presented.as_slice().ct_eq(expected.as_slice()).into()
}

/// Registry held in memory, optionally seeded from a JSON file.
#[derive(Default)]
pub struct StaticRegistry {
    devices: Mutex<HashMap<String, DeviceRecord>>,
}

impl StaticRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a JSON array of [`DeviceRecord`]s.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        use anyhow::Context;

        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read devices file {}", path.display()))?;
        let records: Vec<DeviceRecord> = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse devices file {}", path.display()))?;
        let registry = Self::new();
        for record in records {
            fleet_protocol::validate_device_id(&record.device_id)
                .map_err(|e| anyhow::anyhow!("{}: {e}", record.device_id))?;
            registry.insert(record);
        }
        Ok(registry)
    }

    /// Register a device with a plaintext key; only the digest is kept.
    #[must_use]
    pub fn with_device(self, device_id: &str, owner_id: &str, api_key: &str) -> Self {
        self.insert(DeviceRecord {
            device_id: device_id.to_string(),
            owner_id: owner_id.to_string(),
            api_key_sha256: hash_api_key(api_key),
            revoked: false,
        });
        self
    }

    pub fn insert(&self, record: DeviceRecord) {
        self.devices()
            .insert(record.device_id.clone(), record);
    }

    pub fn set_revoked(&self, device_id: &str, revoked: bool) {
        if let Some(record) = self.devices().get_mut(device_id) {
            record.revoked = revoked;
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.devices().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn devices(&self) -> std::sync::MutexGuard<'_, HashMap<String, DeviceRecord>> {
        self.devices.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl DeviceRegistry for StaticRegistry {
    async fn lookup(&self, device_id: &str) -> Result<Option<DeviceRecord>, StoreError> {
        Ok(self.devices().get(device_id).cloned())
    }
}
