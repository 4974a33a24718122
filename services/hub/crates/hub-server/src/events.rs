//! Fan-out of agent LOG / ALERT frames.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_protocol::{Alert, LogEntry};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// A LOG or ALERT frame as recorded by the hub.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum DeviceEvent {
    Log {
        received_at: DateTime<Utc>,
        #[serde(flatten)]
        entry: LogEntry,
    },
    Alert {
        received_at: DateTime<Utc>,
        #[serde(flatten)]
        alert: Alert,
    },
}

impl DeviceEvent {
    #[must_use]
    pub fn received_at(&self) -> DateTime<Utc> {
        match self {
            Self::Log { received_at, .. } | Self::Alert { received_at, .. } => *received_at,
        }
    }
}

/// Destination for device events. Failures never affect the connection.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, device_id: &str, event: &DeviceEvent) -> Result<(), StoreError>;
}

/// Keeps the most recent events per device in memory.
pub struct MemoryEvents {
    capacity: usize,
    events: Mutex<HashMap<String, VecDeque<DeviceEvent>>>,
}

impl MemoryEvents {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            events: Mutex::new(HashMap::new()),
        }
    }

    /// Events recorded for a device, oldest first.
    #[must_use]
    pub fn recent(&self, device_id: &str) -> Vec<DeviceEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(device_id)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl EventSink for MemoryEvents {
    async fn publish(&self, device_id: &str, event: &DeviceEvent) -> Result<(), StoreError> {
        let mut events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        let queue = events.entry(device_id.to_string()).or_default();
        queue.push_back(event.clone());
        while queue.len() > self.capacity {
            queue.pop_front();
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use fleet_protocol::{AlertSeverity, LogLevel};
    use serde_json::json;

    fn log(n: usize) -> DeviceEvent {
        DeviceEvent::Log {
            received_at: Utc::now(),
            entry: LogEntry {
                level: LogLevel::Info,
                message: format!("line {n}"),
                source: None,
                timestamp: None,
            },
        }
    }

    fn message(event: &DeviceEvent) -> &str {
        match event {
            DeviceEvent::Log { entry, .. } => &entry.message,
            DeviceEvent::Alert { alert, .. } => &alert.message,
        }
    }

    #[tokio::test]
    async fn memory_events_keep_only_the_newest() {
        let sink = MemoryEvents::new(2);
        for n in 0..3 {
            sink.publish("d1", &log(n)).await.unwrap();
        }
        let recent = sink.recent("d1");
        let messages: Vec<&str> = recent.iter().map(message).collect();
        assert_eq!(messages, ["line 1", "line 2"]);
        assert!(sink.recent("d2").is_empty());
    }

    #[test]
    fn alert_serializes_flat_with_kind_tag() {
        let at: DateTime<Utc> = "2026-05-04T10:00:00Z".parse().unwrap();
        let event = DeviceEvent::Alert {
            received_at: at,
            alert: Alert {
                severity: AlertSeverity::Critical,
                code: "wan_down".to_string(),
                message: "WAN link lost".to_string(),
            },
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({
                "kind": "alert",
                "received_at": "2026-05-04T10:00:00Z",
                "severity": "critical",
                "code": "wan_down",
                "message": "WAN link lost"
            })
        );
    }
}
