//! Durable storage seam for actor snapshots and command records.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use fleet_protocol::{Command, command_key, snapshot_key};

use crate::error::StoreError;
use crate::snapshot::Snapshot;

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn load_snapshot(&self, device_id: &str) -> Result<Option<Snapshot>, StoreError>;

    async fn save_snapshot(&self, snapshot: &Snapshot) -> Result<(), StoreError>;

    async fn delete_snapshot(&self, device_id: &str) -> Result<(), StoreError>;

    /// Keep a terminal command where CRUD callers can poll it.
    async fn save_command(&self, device_id: &str, command: &Command) -> Result<(), StoreError>;

    async fn load_command(
        &self,
        device_id: &str,
        command_id: &str,
    ) -> Result<Option<Command>, StoreError>;
}

/// In-process store for single-node development and tests.
///
/// Records are kept in their encoded form so a load exercises the same
/// decode path as the Valkey store. Command records do not expire.
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<String, String>>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail until switched off again.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// The raw snapshot text currently stored for a device.
    #[must_use]
    pub fn snapshot_text(&self, device_id: &str) -> Option<String> {
        self.records().get(&snapshot_key(device_id)).cloned()
    }

    fn records(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("memory store writes disabled".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    async fn load_snapshot(&self, device_id: &str) -> Result<Option<Snapshot>, StoreError> {
        let key = snapshot_key(device_id);
        let text = self.records().get(&key).cloned();
        text.map(|text| Snapshot::decode(&key, &text)).transpose()
    }

    async fn save_snapshot(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        self.check_writable()?;
        let text = snapshot.encode()?;
        self.records()
            .insert(snapshot_key(&snapshot.state.device_id), text);
        Ok(())
    }

    async fn delete_snapshot(&self, device_id: &str) -> Result<(), StoreError> {
        self.check_writable()?;
        self.records().remove(&snapshot_key(device_id));
        Ok(())
    }

    async fn save_command(&self, device_id: &str, command: &Command) -> Result<(), StoreError> {
        self.check_writable()?;
        let text = serde_json::to_string(command).map_err(StoreError::Encode)?;
        self.records()
            .insert(command_key(device_id, &command.command_id), text);
        Ok(())
    }

    async fn load_command(
        &self,
        device_id: &str,
        command_id: &str,
    ) -> Result<Option<Command>, StoreError> {
        let key = command_key(device_id, command_id);
        let text = self.records().get(&key).cloned();
        text.map(|text| {
            serde_json::from_str(&text).map_err(|source| StoreError::Corrupt { key, source })
        })
        .transpose()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::snapshot::ConnectionState;
    use chrono::{Duration, Utc};
    use fleet_protocol::CommandKind;
    use serde_json::json;

    #[tokio::test]
    async fn missing_snapshot_loads_as_none() {
        let store = MemoryStore::new();
        assert!(store.load_snapshot("d1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn saved_snapshot_loads_back() {
        let store = MemoryStore::new();
        let state = ConnectionState::new("d1", Utc::now());
        store.save_snapshot(&Snapshot::capture(&state)).await.unwrap();
        let loaded = store.load_snapshot("d1").await.unwrap().unwrap();
        assert_eq!(loaded.state, state);
    }

    #[tokio::test]
    async fn failing_writes_leave_previous_snapshot() {
        let store = MemoryStore::new();
        let mut state = ConnectionState::new("d1", Utc::now());
        store.save_snapshot(&Snapshot::capture(&state)).await.unwrap();

        store.fail_writes(true);
        state.last_status = Some(json!({"uptime_secs": 1}));
        let err = store
            .save_snapshot(&Snapshot::capture(&state))
            .await
            .expect_err("writes disabled");
        assert!(err.is_transient());

        let loaded = store.load_snapshot("d1").await.unwrap().unwrap();
        assert!(loaded.state.last_status.is_none());
    }

    #[tokio::test]
    async fn command_records_are_scoped_by_device() {
        let store = MemoryStore::new();
        let cmd = Command::new(CommandKind::Reboot, json!({}), Duration::seconds(60), Utc::now())
            .unwrap();
        store.save_command("d1", &cmd).await.unwrap();

        assert_eq!(
            store.load_command("d1", &cmd.command_id).await.unwrap(),
            Some(cmd.clone())
        );
        assert!(store.load_command("d2", &cmd.command_id).await.unwrap().is_none());
    }
}
