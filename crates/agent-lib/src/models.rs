//! Core data models for the usage agent

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A deployable unit tracked by the workload registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workload {
    pub id: String,
    #[serde(default)]
    pub gears: Vec<Gear>,
}

impl Workload {
    /// Returns true if any placement record points at `hostname`
    pub fn is_placed_on(&self, hostname: &str) -> bool {
        self.gears.iter().any(|g| g.server_identity == hostname)
    }
}

/// Host placement record of a workload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gear {
    pub server_identity: String,
}

/// Cumulative CPU accounting for one workload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuUsageSample {
    pub workload_id: String,
    pub total_usage_ns: u64,
    pub user_mode_ns: u64,
    pub system_mode_ns: u64,
    pub per_cpu_usage_ns: Vec<u64>,
    pub created_at: DateTime<Utc>,
}

/// Memory accounting for one workload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryUsageSample {
    pub workload_id: String,
    pub usage_bytes: u64,
    pub max_usage_bytes: u64,
    pub limit_bytes: u64,
    pub created_at: DateTime<Utc>,
}

/// Metric discriminator carried on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Cpu,
    Memory,
}

impl MetricKind {
    pub const ALL: [MetricKind; 2] = [MetricKind::Cpu, MetricKind::Memory];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Cpu => "cpu",
            MetricKind::Memory => "memory",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A finished sample of either kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UsageSample {
    Cpu(CpuUsageSample),
    Memory(MemoryUsageSample),
}

impl UsageSample {
    pub fn kind(&self) -> MetricKind {
        match self {
            UsageSample::Cpu(_) => MetricKind::Cpu,
            UsageSample::Memory(_) => MetricKind::Memory,
        }
    }

    pub fn workload_id(&self) -> &str {
        match self {
            UsageSample::Cpu(s) => &s.workload_id,
            UsageSample::Memory(s) => &s.workload_id,
        }
    }
}

impl From<CpuUsageSample> for UsageSample {
    fn from(sample: CpuUsageSample) -> Self {
        UsageSample::Cpu(sample)
    }
}

impl From<MemoryUsageSample> for UsageSample {
    fn from(sample: MemoryUsageSample) -> Self {
        UsageSample::Memory(sample)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workload(id: &str, hosts: &[&str]) -> Workload {
        Workload {
            id: id.to_string(),
            gears: hosts
                .iter()
                .map(|h| Gear {
                    server_identity: h.to_string(),
                })
                .collect(),
        }
    }

    #[test]
    fn test_workload_placement() {
        let w = workload("app1", &["node-a", "node-b"]);
        assert!(w.is_placed_on("node-b"));
        assert!(!w.is_placed_on("node-c"));
        assert!(!workload("app2", &[]).is_placed_on("node-a"));
    }

    #[test]
    fn test_metric_kind_wire_names() {
        assert_eq!(serde_json::to_string(&MetricKind::Cpu).unwrap(), "\"cpu\"");
        assert_eq!(
            serde_json::from_str::<MetricKind>("\"memory\"").unwrap(),
            MetricKind::Memory
        );
        assert_eq!(MetricKind::Cpu.to_string(), "cpu");
    }

    #[test]
    fn test_sample_kind_follows_variant() {
        let sample: UsageSample = MemoryUsageSample {
            workload_id: "app1".to_string(),
            usage_bytes: 1,
            max_usage_bytes: 2,
            limit_bytes: 3,
            created_at: Utc::now(),
        }
        .into();

        assert_eq!(sample.kind(), MetricKind::Memory);
        assert_eq!(sample.workload_id(), "app1");
    }

    #[test]
    fn test_workload_without_gears_deserializes() {
        let w: Workload = serde_json::from_str(r#"{"id":"app1"}"#).unwrap();
        assert!(w.gears.is_empty());
    }
}
