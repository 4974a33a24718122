//! Router telemetry read from `/proc`.
//!
//! The root is configurable so tests point it at a fixture tree.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use fleet_protocol::{AgentMode, Telemetry};
use serde::Serialize;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LoadAverage {
    pub one: f64,
    pub five: f64,
    pub fifteen: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Memory {
    pub total_kb: u64,
    pub available_kb: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct InterfaceCounters {
    pub rx_bytes: u64,
    pub rx_packets: u64,
    pub tx_bytes: u64,
    pub tx_packets: u64,
}

#[derive(Debug, Clone, Serialize)]
struct StatusReport<'a> {
    firmware_version: &'a str,
    agent_version: &'static str,
    mode: AgentMode,
    hostname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    uptime_secs: Option<u64>,
    reported_at: String,
}

#[derive(Debug, Clone, Serialize)]
struct MetricsReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    uptime_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    load: Option<LoadAverage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    memory: Option<Memory>,
    interfaces: BTreeMap<String, InterfaceCounters>,
    collected_at: String,
}

/// Reads router state from a `/proc`-shaped tree. Missing or unreadable
/// files leave their field out rather than failing the report.
#[derive(Debug, Clone)]
pub struct ProcProbe {
    root: PathBuf,
}

impl ProcProbe {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn read(&self, rel: &str) -> Option<String> {
        match tokio::fs::read_to_string(self.root.join(rel)).await {
            Ok(text) => Some(text),
            Err(e) => {
                tracing::debug!(file = rel, error = %e, "proc file unavailable");
                None
            }
        }
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub async fn uptime_secs(&self) -> Option<u64> {
        let text = self.read("uptime").await?;
        let secs: f64 = text.split_whitespace().next()?.parse().ok()?;
        if secs.is_finite() && secs >= 0.0 {
            Some(secs as u64)
        } else {
            None
        }
    }

    pub async fn load(&self) -> Option<LoadAverage> {
        let text = self.read("loadavg").await?;
        let mut fields = text.split_whitespace().map(str::parse::<f64>);
        Some(LoadAverage {
            one: fields.next()?.ok()?,
            five: fields.next()?.ok()?,
            fifteen: fields.next()?.ok()?,
        })
    }

    pub async fn memory(&self) -> Option<Memory> {
        let text = self.read("meminfo").await?;
        let mut total = None;
        let mut available = None;
        for line in text.lines() {
            let Some((key, rest)) = line.split_once(':') else {
                continue;
            };
            let value = rest.split_whitespace().next().and_then(|v| v.parse().ok());
            match key {
                "MemTotal" => total = value,
                "MemAvailable" => available = value,
                _ => {}
            }
        }
        Some(Memory {
            total_kb: total?,
            available_kb: available?,
        })
    }

    /// Per-interface counters from `net/dev`, loopback excluded.
    pub async fn interfaces(&self) -> BTreeMap<String, InterfaceCounters> {
        let mut out = BTreeMap::new();
        let Some(text) = self.read("net/dev").await else {
            return out;
        };
        // Two header lines, then `iface: rx_bytes rx_packets ... (8 rx) tx_bytes tx_packets ...`.
        for line in text.lines().skip(2) {
            let Some((name, rest)) = line.split_once(':') else {
                continue;
            };
            let name = name.trim();
            if name == "lo" {
                continue;
            }
            let cols: Vec<u64> = rest
                .split_whitespace()
                .filter_map(|c| c.parse().ok())
                .collect();
            if cols.len() < 10 {
                continue;
            }
            out.insert(
                name.to_string(),
                InterfaceCounters {
                    rx_bytes: cols[0],
                    rx_packets: cols[1],
                    tx_bytes: cols[8],
                    tx_packets: cols[9],
                },
            );
        }
        out
    }

    async fn hostname(&self) -> Option<String> {
        let text = self.read("sys/kernel/hostname").await?;
        let name = text.trim();
        (!name.is_empty()).then(|| name.to_string())
    }

    /// STATUS payload.
    pub async fn status(&self, firmware_version: &str, mode: AgentMode) -> Telemetry {
        let report = StatusReport {
            firmware_version,
            agent_version: env!("CARGO_PKG_VERSION"),
            mode,
            hostname: self.hostname().await,
            uptime_secs: self.uptime_secs().await,
            reported_at: Utc::now().to_rfc3339(),
        };
        into_telemetry(&report)
    }

    /// METRICS payload.
    pub async fn metrics(&self) -> Telemetry {
        let report = MetricsReport {
            uptime_secs: self.uptime_secs().await,
            load: self.load().await,
            memory: self.memory().await,
            interfaces: self.interfaces().await,
            collected_at: Utc::now().to_rfc3339(),
        };
        into_telemetry(&report)
    }
}

fn into_telemetry<T: Serialize>(report: &T) -> Telemetry {
    Telemetry::from_serializable(report).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "telemetry did not serialize to an object");
        Telemetry::default()
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const NET_DEV: &str = "\
Inter-|   Receive                                                |  Transmit
 face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed
    lo:    1000      10    0    0    0     0          0         0     1000      10    0    0    0     0       0          0
  eth0: 5000000    4000    0    0    0     0          0         0  2000000    3000    0    0    0     0       0          0
";

    fn fixture() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::write(root.join("uptime"), "12345.67 54321.00\n").unwrap();
        std::fs::write(root.join("loadavg"), "0.15 0.10 0.05 1/123 4567\n").unwrap();
        std::fs::write(
            root.join("meminfo"),
            "MemTotal:      256000 kB\nMemFree:        10000 kB\nMemAvailable:  128000 kB\n",
        )
        .unwrap();
        std::fs::create_dir_all(root.join("net")).unwrap();
        std::fs::write(root.join("net/dev"), NET_DEV).unwrap();
        std::fs::create_dir_all(root.join("sys/kernel")).unwrap();
        std::fs::write(root.join("sys/kernel/hostname"), "router-1\n").unwrap();
        dir
    }

    #[tokio::test]
    async fn reads_fixture_tree() {
        let dir = fixture();
        let probe = ProcProbe::new(dir.path());

        assert_eq!(probe.uptime_secs().await, Some(12345));
        let load = probe.load().await.unwrap();
        assert!((load.one - 0.15).abs() < f64::EPSILON);
        assert_eq!(
            probe.memory().await,
            Some(Memory {
                total_kb: 256_000,
                available_kb: 128_000
            })
        );

        let ifaces = probe.interfaces().await;
        assert_eq!(ifaces.len(), 1);
        let eth0 = &ifaces["eth0"];
        assert_eq!(eth0.rx_bytes, 5_000_000);
        assert_eq!(eth0.tx_packets, 3000);
    }

    #[tokio::test]
    async fn status_and_metrics_payloads() {
        let dir = fixture();
        let probe = ProcProbe::new(dir.path());

        let status = probe.status("23.05.2", AgentMode::Monitor).await.into_value();
        assert_eq!(status["firmware_version"], "23.05.2");
        assert_eq!(status["mode"], "monitor");
        assert_eq!(status["hostname"], "router-1");
        assert_eq!(status["uptime_secs"], 12345);

        let metrics = probe.metrics().await.into_value();
        assert_eq!(metrics["memory"]["available_kb"], 128_000);
        assert_eq!(metrics["interfaces"]["eth0"]["rx_packets"], 4000);
    }

    #[tokio::test]
    async fn missing_files_are_omitted() {
        let dir = tempfile::tempdir().unwrap();
        let probe = ProcProbe::new(dir.path());
        let metrics = probe.metrics().await.into_value();
        assert!(metrics.get("load").is_none());
        assert!(metrics.get("memory").is_none());
        assert_eq!(metrics["interfaces"], serde_json::json!({}));
    }
}
